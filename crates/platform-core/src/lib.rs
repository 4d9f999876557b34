use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppEnv {
    Local,
    Dev,
    Test,
    Prod,
}

impl AppEnv {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Prod => "prod",
        }
    }
}

impl std::str::FromStr for AppEnv {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "dev" | "development" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            "prod" | "production" => Ok(Self::Prod),
            other => Err(ConfigError::InvalidEnv(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub app: AppSection,
    pub observability: ObservabilitySection,
    pub settlement: SettlementSection,
    pub gateway: GatewaySection,
    pub poller: PollerSection,
    pub sweep: SweepSection,
    pub database: DatabaseSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    pub env: AppEnv,
    pub service_name: String,
    pub http_bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySection {
    pub log_filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementSection {
    /// Decimal string in the settlement currency, e.g. "150.00".
    pub rental_price: String,
    pub rental_period_days: i64,
    pub renewal_period_days: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout_ms: u64,
    pub payment_window_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSection {
    pub checkout_interval_secs: u64,
    pub recovery_interval_secs: u64,
    pub batch_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSection {
    pub interval_secs: u64,
    pub batch_limit: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// In-memory stores are used when unset.
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<ErrorBody>,
}

impl<T> ResponseEnvelope<T> {
    #[must_use]
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RequestInvalid,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    InsufficientFunds,
    GatewayUnavailable,
    StorageError,
    InternalError,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestInvalid => "REQUEST_INVALID",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::GatewayUnavailable => "GATEWAY_UNAVAILABLE",
            Self::StorageError => "STORAGE_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid APP_ENV value: {0}")]
    InvalidEnv(String),
    #[error("unable to locate config directory (expected config/default.toml)")]
    ConfigDirNotFound,
    #[error("failed reading config file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing config file {path}: {source}")]
    ParseToml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Default, Deserialize)]
struct PartialAppConfig {
    app: Option<PartialAppSection>,
    observability: Option<PartialObservabilitySection>,
    settlement: Option<PartialSettlementSection>,
    gateway: Option<PartialGatewaySection>,
    poller: Option<PartialPollerSection>,
    sweep: Option<PartialSweepSection>,
    database: Option<PartialDatabaseSection>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialAppSection {
    env: Option<AppEnv>,
    service_name: Option<String>,
    http_bind_addr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialObservabilitySection {
    log_filter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialSettlementSection {
    rental_price: Option<String>,
    rental_period_days: Option<i64>,
    renewal_period_days: Option<i64>,
    currency: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialGatewaySection {
    base_url: Option<String>,
    api_key: Option<String>,
    request_timeout_ms: Option<u64>,
    payment_window_minutes: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialPollerSection {
    checkout_interval_secs: Option<u64>,
    recovery_interval_secs: Option<u64>,
    batch_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialSweepSection {
    interval_secs: Option<u64>,
    batch_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialDatabaseSection {
    url: Option<String>,
    max_connections: Option<u32>,
}

fn assign<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let app_env = env::var("APP_ENV")
            .ok()
            .map(|value| value.parse())
            .transpose()?
            .unwrap_or(AppEnv::Local);
        let config_dir = resolve_config_dir()?;
        Self::load_from_dir_for_env(config_dir, app_env)
    }

    /// `default.toml`, then `{env}.toml` if present, then environment overrides.
    pub fn load_from_dir_for_env(
        config_dir: impl AsRef<Path>,
        app_env: AppEnv,
    ) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let mut config = Self::default_for_env(app_env);
        merge_file(&mut config, &config_dir.join("default.toml"))?;
        let env_file = config_dir.join(format!("{}.toml", app_env.as_str()));
        if env_file.exists() {
            merge_file(&mut config, &env_file)?;
        }
        config.app.env = app_env;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn default_for_env(app_env: AppEnv) -> Self {
        Self {
            app: AppSection {
                env: app_env,
                service_name: "rental-settlement".to_string(),
                http_bind_addr: "127.0.0.1:9100".to_string(),
            },
            observability: ObservabilitySection {
                log_filter: "info".to_string(),
            },
            settlement: SettlementSection {
                rental_price: "150.00".to_string(),
                rental_period_days: 30,
                renewal_period_days: 30,
                currency: "usd".to_string(),
            },
            gateway: GatewaySection {
                base_url: "https://payments.example.com/v1".to_string(),
                api_key: String::new(),
                request_timeout_ms: 10_000,
                payment_window_minutes: 20,
            },
            poller: PollerSection {
                checkout_interval_secs: 10,
                recovery_interval_secs: 30,
                batch_limit: 100,
            },
            sweep: SweepSection {
                interval_secs: 3600,
                batch_limit: 500,
            },
            database: DatabaseSection {
                url: None,
                max_connections: 10,
            },
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw_env) = env::var("APP_ENV") {
            self.app.env = raw_env.parse()?;
        }
        if let Ok(service_name) = env::var("APP_SERVER__SERVICE_NAME") {
            self.app.service_name = service_name;
        }
        if let Ok(bind_addr) = env::var("APP_SERVER__HTTP_BIND_ADDR") {
            self.app.http_bind_addr = bind_addr;
        }
        if let Ok(base_url) = env::var("GATEWAY__BASE_URL") {
            self.gateway.base_url = base_url;
        }
        if let Ok(api_key) = env::var("GATEWAY__API_KEY") {
            self.gateway.api_key = api_key;
        }
        if let Ok(url) = env::var("DATABASE__URL") {
            self.database.url = Some(url).filter(|url| !url.trim().is_empty());
        }
        if let Ok(log_filter) = env::var("OBSERVABILITY__LOG_FILTER") {
            self.observability.log_filter = log_filter;
        } else if let Ok(log_filter) = env::var("RUST_LOG") {
            self.observability.log_filter = log_filter;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("settlement.rental_period_days", self.settlement.rental_period_days),
            ("settlement.renewal_period_days", self.settlement.renewal_period_days),
            ("gateway.payment_window_minutes", self.gateway.payment_window_minutes),
        ];
        for (field, value) in positive {
            if value <= 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("must be positive, got {value}"),
                });
            }
        }
        let intervals = [
            ("poller.checkout_interval_secs", self.poller.checkout_interval_secs),
            ("poller.recovery_interval_secs", self.poller.recovery_interval_secs),
            ("sweep.interval_secs", self.sweep.interval_secs),
            ("gateway.request_timeout_ms", self.gateway.request_timeout_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.settlement.currency.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "settlement.currency",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    fn merge_partial(&mut self, partial: PartialAppConfig) {
        if let Some(app) = partial.app {
            assign(&mut self.app.env, app.env);
            assign(&mut self.app.service_name, app.service_name);
            assign(&mut self.app.http_bind_addr, app.http_bind_addr);
        }
        if let Some(observability) = partial.observability {
            assign(&mut self.observability.log_filter, observability.log_filter);
        }
        if let Some(settlement) = partial.settlement {
            assign(&mut self.settlement.rental_price, settlement.rental_price);
            assign(
                &mut self.settlement.rental_period_days,
                settlement.rental_period_days,
            );
            assign(
                &mut self.settlement.renewal_period_days,
                settlement.renewal_period_days,
            );
            assign(&mut self.settlement.currency, settlement.currency);
        }
        if let Some(gateway) = partial.gateway {
            assign(&mut self.gateway.base_url, gateway.base_url);
            assign(&mut self.gateway.api_key, gateway.api_key);
            assign(&mut self.gateway.request_timeout_ms, gateway.request_timeout_ms);
            assign(
                &mut self.gateway.payment_window_minutes,
                gateway.payment_window_minutes,
            );
        }
        if let Some(poller) = partial.poller {
            assign(
                &mut self.poller.checkout_interval_secs,
                poller.checkout_interval_secs,
            );
            assign(
                &mut self.poller.recovery_interval_secs,
                poller.recovery_interval_secs,
            );
            assign(&mut self.poller.batch_limit, poller.batch_limit);
        }
        if let Some(sweep) = partial.sweep {
            assign(&mut self.sweep.interval_secs, sweep.interval_secs);
            assign(&mut self.sweep.batch_limit, sweep.batch_limit);
        }
        if let Some(database) = partial.database {
            if database.url.is_some() {
                self.database.url = database.url.filter(|url| !url.trim().is_empty());
            }
            assign(&mut self.database.max_connections, database.max_connections);
        }
    }
}

fn merge_file(config: &mut AppConfig, path: &Path) -> Result<(), ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    let partial =
        toml::from_str::<PartialAppConfig>(&content).map_err(|source| ConfigError::ParseToml {
            path: path.display().to_string(),
            source,
        })?;
    config.merge_partial(partial);
    Ok(())
}

fn resolve_config_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var("RENTAL_PLATFORM_CONFIG_DIR") {
        return Ok(PathBuf::from(path));
    }

    let mut current_dir = env::current_dir().map_err(|_| ConfigError::ConfigDirNotFound)?;
    loop {
        let candidate = current_dir.join("config");
        if candidate.join("default.toml").exists() {
            return Ok(candidate);
        }
        if !current_dir.pop() {
            break;
        }
    }

    Err(ConfigError::ConfigDirNotFound)
}
