use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global fmt subscriber. `log_filter` comes from config; an
/// unparsable filter falls back to `RUST_LOG`, then to `info`.
pub fn init_tracing(service_name: &str, log_filter: &str) {
    let env_filter = EnvFilter::try_new(log_filter)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_target(false)
        .with_env_filter(env_filter)
        .compact()
        .try_init();

    tracing::info!(service = service_name, filter = log_filter, "tracing initialized");
}
