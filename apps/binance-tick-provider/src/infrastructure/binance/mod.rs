//! Binance Adapters
//!
//! REST history and websocket live trades.

mod backoff;
mod messages;
mod rest;
mod stream;

pub use backoff::{RetryConfig, RetryPolicy};
pub use messages::{AggTradeMessage, ApiErrorBody, InvalidTradeTime};
pub use rest::BinanceRestClient;
pub use stream::BinanceStreamClient;
