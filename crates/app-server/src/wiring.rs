use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use audit_store::{InMemoryAuditRepository, PostgresAuditRepository};
use chrono::Duration;
use ledger_store::{
    InMemoryAccountRepository, InMemoryLedgerRepository, InMemoryPaymentSessionRepository,
    PostgresLedgerStore,
};
use payment_gateway::{GatewayClientConfig, PaymentGateway, ReqwestPaymentGateway};
use platform_core::{AppConfig, DatabaseSection, GatewaySection};
use rental_domain::{Clock, Money};
use settlement::{LifecycleSettings, SettlementOrchestrator, SettlementSettings, SettlementStores};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

const SCHEMA: &str = include_str!("../../../migrations/0001_init.sql");

/// Handles to the in-memory repositories, kept so tests can seed and inspect them.
#[derive(Debug, Clone)]
pub struct InMemoryStores {
    pub ledger: InMemoryLedgerRepository,
    pub sessions: InMemoryPaymentSessionRepository,
    pub accounts: InMemoryAccountRepository,
    pub audit: InMemoryAuditRepository,
}

impl InMemoryStores {
    #[must_use]
    pub fn new() -> Self {
        let audit = InMemoryAuditRepository::new();
        Self {
            ledger: InMemoryLedgerRepository::with_audit(audit.clone()),
            sessions: InMemoryPaymentSessionRepository::new(),
            accounts: InMemoryAccountRepository::new(),
            audit,
        }
    }

    #[must_use]
    pub fn settlement_stores(&self) -> SettlementStores {
        SettlementStores {
            ledger: Arc::new(self.ledger.clone()),
            sessions: Arc::new(self.sessions.clone()),
            accounts: Arc::new(self.accounts.clone()),
            audit: Arc::new(self.audit.clone()),
        }
    }
}

impl Default for InMemoryStores {
    fn default() -> Self {
        Self::new()
    }
}

pub fn settlement_settings(config: &AppConfig) -> Result<SettlementSettings> {
    let rental_price = Money::parse_decimal(&config.settlement.rental_price)
        .with_context(|| format!("settlement.rental_price {:?}", config.settlement.rental_price))?;
    anyhow::ensure!(!rental_price.is_zero(), "settlement.rental_price must be positive");
    Ok(SettlementSettings {
        rental_price,
        currency: config.settlement.currency.trim().to_ascii_lowercase(),
        payment_window: Duration::minutes(config.gateway.payment_window_minutes),
        checkout_poll_interval: StdDuration::from_secs(config.poller.checkout_interval_secs),
        lifecycle: LifecycleSettings {
            rental_period: Duration::days(config.settlement.rental_period_days),
            renewal_period: Duration::days(config.settlement.renewal_period_days),
            renewal_price: rental_price,
            sweep_batch_limit: config.sweep.batch_limit,
        },
    })
}

/// Postgres when a url is configured, in-memory otherwise. The schema is
/// applied on connect.
pub async fn connect_stores(database: &DatabaseSection) -> Result<SettlementStores> {
    let Some(url) = database.url.as_deref() else {
        warn!("no database url configured; using in-memory stores");
        return Ok(InMemoryStores::new().settlement_stores());
    };
    let pool = PgPoolOptions::new()
        .max_connections(database.max_connections.max(1))
        .acquire_timeout(StdDuration::from_secs(5))
        .connect(url)
        .await
        .context("failed to connect postgres")?;
    sqlx::raw_sql(SCHEMA)
        .execute(&pool)
        .await
        .context("failed to apply schema")?;
    info!(max_connections = database.max_connections, "postgres stores ready");
    let ledger = Arc::new(PostgresLedgerStore::new(pool.clone()));
    Ok(SettlementStores {
        ledger: ledger.clone(),
        sessions: ledger.clone(),
        accounts: ledger,
        audit: Arc::new(PostgresAuditRepository::new(pool)),
    })
}

pub fn build_gateway(gateway: &GatewaySection) -> Result<Arc<dyn PaymentGateway>> {
    if gateway.api_key.trim().is_empty() {
        warn!("gateway.api_key is empty; crypto checkout calls will be rejected upstream");
    }
    let client = ReqwestPaymentGateway::new(GatewayClientConfig {
        base_url: gateway.base_url.clone(),
        api_key: gateway.api_key.clone(),
        request_timeout: StdDuration::from_millis(gateway.request_timeout_ms),
    })
    .context("failed to build payment gateway client")?;
    Ok(Arc::new(client))
}

pub fn build_orchestrator(
    config: &AppConfig,
    stores: SettlementStores,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
) -> Result<Arc<SettlementOrchestrator>> {
    let settings = settlement_settings(config)?;
    Ok(Arc::new(SettlementOrchestrator::new(
        stores, gateway, clock, settings,
    )))
}
