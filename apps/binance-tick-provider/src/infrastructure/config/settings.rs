//! Tick Provider Configuration Settings
//!
//! Configuration types for the tick provider service, loaded from
//! environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

/// Largest page the aggregate-trades endpoint serves.
pub const MAX_PAGE_LIMIT: u16 = 1000;

/// Binance API key. Only sent as a header; never logged.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String) -> Self {
        Self { api_key }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// Exchange endpoints and credentials.
#[derive(Debug, Clone)]
pub struct BinanceSettings {
    /// REST base URL.
    pub rest_url: String,
    /// Websocket base URL; stream names are appended as a path segment.
    pub stream_url: String,
    /// Optional API key.
    pub credentials: Option<Credentials>,
}

impl Default for BinanceSettings {
    fn default() -> Self {
        Self {
            rest_url: "https://api.binance.com".to_string(),
            stream_url: "wss://stream.binance.com:9443/ws".to_string(),
            credentials: None,
        }
    }
}

/// REST client behavior.
#[derive(Debug, Clone)]
pub struct RestSettings {
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    /// First retry delay.
    pub retry_delay_initial: Duration,
    /// Retry delay cap.
    pub retry_delay_max: Duration,
    /// Trades requested per page.
    pub page_limit: u16,
}

impl Default for RestSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay_initial: Duration::from_millis(500),
            retry_delay_max: Duration::from_secs(10),
            page_limit: MAX_PAGE_LIMIT,
        }
    }
}

/// Local service settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Root directory of the hour cache.
    pub cache_dir: PathBuf,
    /// Health check HTTP port.
    pub health_port: u16,
    /// How often idle providers are evicted.
    pub collect_interval: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("data"),
            health_port: 8083,
            collect_interval: Duration::from_secs(60),
        }
    }
}

/// The instrument and window the binary follows on startup.
#[derive(Debug, Clone)]
pub struct FollowSettings {
    /// Exchange symbol.
    pub symbol: String,
    /// Minimum price increment.
    pub tick_size: Decimal,
    /// Whole hours of history before the current hour.
    pub lookback_hours: u32,
}

impl Default for FollowSettings {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            tick_size: Decimal::new(1, 2),
            lookback_hours: 2,
        }
    }
}

/// Complete tick provider configuration.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    /// Exchange endpoints.
    pub binance: BinanceSettings,
    /// REST client behavior.
    pub rest: RestSettings,
    /// Local service settings.
    pub server: ServerSettings,
    /// Startup subscription.
    pub follow: FollowSettings,
}

impl ProviderConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but empty or malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but empty or malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };
        let defaults = Self::default();

        let credentials = match lookup("BINANCE_API_KEY") {
            Some(key) if key.is_empty() => {
                return Err(ConfigError::EmptyValue("BINANCE_API_KEY".to_string()));
            }
            Some(key) => Some(Credentials::new(key)),
            None => None,
        };

        let binance = BinanceSettings {
            rest_url: env.string("BINANCE_REST_URL", defaults.binance.rest_url)?,
            stream_url: env.string("BINANCE_STREAM_URL", defaults.binance.stream_url)?,
            credentials,
        };

        let page_limit = env.parse("BINANCE_PAGE_LIMIT", defaults.rest.page_limit)?;
        if page_limit == 0 || page_limit > MAX_PAGE_LIMIT {
            return Err(ConfigError::InvalidValue {
                key: "BINANCE_PAGE_LIMIT".to_string(),
                value: page_limit.to_string(),
            });
        }

        let rest = RestSettings {
            request_timeout: Duration::from_secs(env.parse(
                "BINANCE_REQUEST_TIMEOUT_SECS",
                defaults.rest.request_timeout.as_secs(),
            )?),
            max_retries: env.parse("BINANCE_MAX_RETRIES", defaults.rest.max_retries)?,
            retry_delay_initial: Duration::from_millis(env.parse(
                "BINANCE_RETRY_DELAY_INITIAL_MS",
                u64::try_from(defaults.rest.retry_delay_initial.as_millis()).unwrap_or(u64::MAX),
            )?),
            retry_delay_max: Duration::from_secs(env.parse(
                "BINANCE_RETRY_DELAY_MAX_SECS",
                defaults.rest.retry_delay_max.as_secs(),
            )?),
            page_limit,
        };

        let server = ServerSettings {
            cache_dir: PathBuf::from(env.string(
                "TICK_CACHE_DIR",
                defaults.server.cache_dir.to_string_lossy().into_owned(),
            )?),
            health_port: env.parse("TICK_PROVIDER_HEALTH_PORT", defaults.server.health_port)?,
            collect_interval: Duration::from_secs(env.parse(
                "TICK_PROVIDER_COLLECT_INTERVAL_SECS",
                defaults.server.collect_interval.as_secs(),
            )?),
        };

        let follow = FollowSettings {
            symbol: env.string("TICK_SYMBOL", defaults.follow.symbol)?.to_uppercase(),
            tick_size: env.parse("TICK_SIZE", defaults.follow.tick_size)?,
            lookback_hours: env.parse("TICK_LOOKBACK_HOURS", defaults.follow.lookback_hours)?,
        };
        if follow.tick_size <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue {
                key: "TICK_SIZE".to_string(),
                value: follow.tick_size.to_string(),
            });
        }

        Ok(Self {
            binance,
            rest,
            server,
            follow,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed or is out of range.
    #[error("environment variable {key} has invalid value '{value}'")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Rejected value.
        value: String,
    },
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn string(&self, key: &str, default: String) -> Result<String, ConfigError> {
        match (self.lookup)(key) {
            Some(value) if value.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(value) => Ok(value.trim().to_string()),
            None => Ok(default),
        }
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match (self.lookup)(key) {
            Some(value) if value.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
            None => Ok(default),
        }
    }
}
