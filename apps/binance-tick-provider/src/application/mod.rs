//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the concrete tick providers and the port interfaces
//! they use to reach the exchange and the hour cache.

/// Port interfaces for external systems (REST history, live feed, files).
pub mod ports;

/// Tick providers and the service that builds them.
pub mod services;
