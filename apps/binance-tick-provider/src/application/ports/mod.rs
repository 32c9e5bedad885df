//! Port Interfaces
//!
//! Driven (outbound) ports the tick providers depend on. Infrastructure
//! adapters implement them against Binance and the local filesystem; tests
//! implement them with in-memory fakes.
//!
//! - `HistoricalTradesPort`: aggregate trades over a closed time range
//! - `TradeStreamPort`: live aggregate-trade subscriptions
//! - `FileStorePort`: whole-file byte storage for the hour cache

mod file_store_port;
mod historical_trades_port;
mod trade_stream_port;

pub use file_store_port::{FileStoreError, FileStorePort};
pub use historical_trades_port::{HistoricalTradesError, HistoricalTradesPort};
pub use trade_stream_port::{TradeStreamError, TradeStreamPort, TradeSubscription};

#[cfg(test)]
pub use historical_trades_port::MockHistoricalTradesPort;
