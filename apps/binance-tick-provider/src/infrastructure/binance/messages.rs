//! Binance Wire Types
//!
//! Deserialization types for the aggregate-trade REST endpoint and the
//! `<symbol>@aggTrade` websocket stream. Both use the same compact field
//! names:
//!
//! | key | meaning                     |
//! |-----|-----------------------------|
//! | `a` | aggregate trade id          |
//! | `p` | price (string)              |
//! | `q` | quantity (string)           |
//! | `f` | first underlying trade id   |
//! | `l` | last underlying trade id    |
//! | `T` | trade time, epoch millis    |
//! | `m` | buyer is the market maker   |
//!
//! # References
//!
//! - [Compressed/Aggregate Trades List](https://developers.binance.com/docs/binance-spot-api-docs/rest-api/market-data-endpoints#compressedaggregate-trades-list)
//! - [Aggregate Trade Streams](https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams#aggregate-trade-streams)

use chrono::DateTime;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::market::AggregateTrade;

/// One aggregate trade as sent by the exchange.
///
/// Stream events carry extra keys (`e`, `E`, `s`); they are read when
/// present and ignored by the conversion.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AggTradeMessage {
    /// Event type, stream only (`aggTrade`).
    #[serde(rename = "e", default)]
    pub event_type: Option<String>,
    /// Symbol, stream only.
    #[serde(rename = "s", default)]
    pub symbol: Option<String>,
    /// Aggregate trade id.
    #[serde(rename = "a")]
    pub trade_id: i64,
    /// Price.
    #[serde(rename = "p")]
    pub price: Decimal,
    /// Quantity.
    #[serde(rename = "q")]
    pub quantity: Decimal,
    /// First underlying trade id.
    #[serde(rename = "f")]
    pub first_trade_id: i64,
    /// Last underlying trade id.
    #[serde(rename = "l")]
    pub last_trade_id: i64,
    /// Trade time in epoch milliseconds.
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// Buyer was the maker.
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// Conversion failure for an exchange message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("trade {trade_id} has out-of-range time {trade_time}")]
pub struct InvalidTradeTime {
    /// Aggregate trade id.
    pub trade_id: i64,
    /// Offending timestamp.
    pub trade_time: i64,
}

impl TryFrom<AggTradeMessage> for AggregateTrade {
    type Error = InvalidTradeTime;

    fn try_from(msg: AggTradeMessage) -> Result<Self, Self::Error> {
        let timestamp =
            DateTime::from_timestamp_millis(msg.trade_time).ok_or(InvalidTradeTime {
                trade_id: msg.trade_id,
                trade_time: msg.trade_time,
            })?;
        Ok(Self {
            trade_id: msg.trade_id,
            price: msg.price,
            quantity: msg.quantity,
            timestamp,
            is_buyer_market_maker: msg.is_buyer_maker,
        })
    }
}

/// Error body returned by the REST API (`{"code": -1121, "msg": "..."}`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiErrorBody {
    /// Exchange error code.
    pub code: i64,
    /// Error message.
    pub msg: String,
}
