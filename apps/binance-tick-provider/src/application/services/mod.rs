//! Application Services
//!
//! Services that implement tick providers on top of the ports.
//!
//! - `HourCache`: Reads and writes cached hours
//! - `HourProvider`: One closed hour, from cache or history
//! - `LiveProvider`: Current hour plus the live feed
//! - `CompositeTickProvider`: Stitches hours and live into a request window
//! - `TickProviderService`: Owns the stores and builds composites

/// Hour cache files.
pub mod cache;

/// Composite tick provider.
pub mod composite;

/// Hour provider.
pub mod hour_provider;

/// Live provider.
pub mod live_provider;

/// Service facade.
pub mod tick_provider_service;

pub use cache::{CachePaths, CachedHour, HourCache};
pub use composite::{CompositeTickProvider, Constituent, HourProviderStore, LiveProviderStore};
pub use hour_provider::{HourProvider, HourProviderDeps};
pub use live_provider::{LiveProvider, LiveProviderDeps, SequenceGuard};
pub use tick_provider_service::{ServiceStatus, TickProviderService};
