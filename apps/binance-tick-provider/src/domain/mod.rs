//! Domain Layer - Core tick-provider types and business rules.
//!
//! This layer holds the market data types, tick streams, and the provider
//! lifecycle and store that every concrete provider builds on. Nothing here
//! talks to the network or the filesystem.

/// Instruments, aggregate trades and ticks.
pub mod market;

/// Hour arithmetic and the clock abstraction.
pub mod time;

/// Append-only tick streams and readers.
pub mod tick_stream;

/// Provider contract, lifecycle and store.
pub mod provider;
