#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Binance Tick Provider - Historical and Live Trade Ticks
//!
//! Serves gap-free tick streams for Binance instruments over arbitrary time
//! windows. Completed hours are fetched from the REST API once and cached on
//! disk; the current hour is backfilled and then followed over the
//! aggregate-trade websocket. Windows spanning both are stitched into one
//! stream whose trade ids are checked for contiguity.
//!
//! # Layers (inside to outside)
//!
//! - **Domain**: Market types, tick streams, provider lifecycle and store
//!   - `market`: Instruments, aggregate trades and ticks
//!   - `tick_stream`: Append-only tick buffers and readers
//!   - `provider`: Provider contract, lifecycle state machine, keyed store
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Historical trades, live trades, file storage
//!   - `services`: Hour, live and composite providers; the service facade
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `binance`: REST and websocket clients
//!   - `file_store`: Local cache directory
//!   - `config`: Environment configuration
//!   - `health`: Health, status and metrics HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! REST aggTrades --> HourProvider (cache) --+
//!                                           +--> CompositeTickProvider --> TickReader
//! WS @aggTrade ----> LiveProvider ----------+
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{AggregateTrade, Instrument, StreamInfo, Tick};
pub use domain::provider::error::{DisposeReason, ProviderError};
pub use domain::provider::lifecycle::{Lifecycle, LifecycleState};
pub use domain::provider::{ProviderInfo, ProviderRequest, ProviderStatus, TickProvider};
pub use domain::tick_stream::{TickReader, TickStream};
pub use domain::time::{Clock, ManualClock, SystemClock};

// Services
pub use application::services::{CompositeTickProvider, ServiceStatus, TickProviderService};

// Infrastructure config
pub use infrastructure::config::{ConfigError, Credentials, ProviderConfig};

// Adapters
pub use infrastructure::binance::{BinanceRestClient, BinanceStreamClient};
pub use infrastructure::file_store::FsFileStore;

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
