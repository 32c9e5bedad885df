//! Configuration Module
//!
//! Configuration loading for the tick provider service.

mod settings;

pub use settings::{
    BinanceSettings, ConfigError, Credentials, FollowSettings, MAX_PAGE_LIMIT, ProviderConfig,
    RestSettings, ServerSettings,
};
