use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::SettlementError;

const PRUNE_THRESHOLD: usize = 1024;

/// One async mutex per key. Holders of different keys never wait on each other.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &K) -> Result<OwnedMutexGuard<()>, SettlementError> {
        let slot = {
            let mut guard = self
                .slots
                .lock()
                .map_err(|_| SettlementError::Storage("lock table poisoned".to_string()))?;
            if guard.len() >= PRUNE_THRESHOLD {
                guard.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            guard.entry(key.clone()).or_default().clone()
        };
        Ok(slot.lock_owned().await)
    }
}
