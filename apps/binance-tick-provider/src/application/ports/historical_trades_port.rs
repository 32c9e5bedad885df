//! Historical Trades Port (Driven Port)
//!
//! Interface for fetching exchange aggregate trades over a time range.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::market::AggregateTrade;

/// Historical trade fetch error.
#[derive(Debug, thiserror::Error)]
pub enum HistoricalTradesError {
    /// The exchange only serves ranges up to one hour wide.
    #[error("time range {from} - {until} is wider than one hour")]
    RangeTooWide {
        /// Range start.
        from: DateTime<Utc>,
        /// Range end.
        until: DateTime<Utc>,
    },

    /// The request never produced a response.
    #[error("request failed: {message}")]
    Network {
        /// Error details.
        message: String,
    },

    /// The exchange answered with an error.
    #[error("exchange returned HTTP {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Exchange error code, when the body carried one.
        code: Option<i64>,
        /// Error details.
        message: String,
    },

    /// The response body could not be decoded.
    #[error("invalid response: {message}")]
    Decode {
        /// Error details.
        message: String,
    },

    /// Retries were exhausted on transient failures.
    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// The final failure.
        last_error: String,
    },
}

/// Port for fetching historical aggregate trades.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoricalTradesPort: Send + Sync {
    /// All aggregate trades for `symbol` with `from <= time <= until`,
    /// ascending by trade id.
    ///
    /// The range may be at most one hour wide.
    async fn get_aggregate_trades(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<AggregateTrade>, HistoricalTradesError>;
}
