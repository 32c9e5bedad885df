//! Market Data Types
//!
//! Instruments, exchange aggregate trades and the normalized ticks derived
//! from them. Prices and quantities are kept as [`Decimal`] end to end so
//! that bid/ask derivation never loses precision.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Instrument
// =============================================================================

/// A tradable exchange instrument.
///
/// Equality and hashing cover both fields, so two instruments with the same
/// symbol but a different tick size are distinct provider keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    /// Exchange symbol, upper case (e.g. `BTCUSDT`).
    pub symbol: String,
    /// Smallest price increment the exchange accepts.
    pub min_price_increment: Decimal,
}

impl Instrument {
    /// Create an instrument, normalizing the symbol to upper case.
    #[must_use]
    pub fn new(symbol: impl Into<String>, min_price_increment: Decimal) -> Self {
        Self {
            symbol: symbol.into().to_uppercase(),
            min_price_increment,
        }
    }
}

impl std::fmt::Display for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.symbol)
    }
}

// =============================================================================
// Stream Identity
// =============================================================================

/// Identifies one exchange market-data stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamInfo {
    symbol: String,
    name: String,
}

impl StreamInfo {
    /// The aggregate-trade stream for a symbol (`btcusdt@aggTrade`).
    #[must_use]
    pub fn aggregate_trade(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            name: format!("{}@aggTrade", symbol.to_lowercase()),
        }
    }

    /// Upper-case symbol this stream carries.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Exchange stream name used in the websocket path.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// =============================================================================
// Aggregate Trade
// =============================================================================

/// An exchange-reported aggregate trade.
///
/// Trade ids are strictly increasing and contiguous per symbol; every other
/// guarantee in the pipeline builds on that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateTrade {
    /// Aggregate trade id.
    pub trade_id: i64,
    /// Execution price.
    pub price: Decimal,
    /// Executed quantity.
    pub quantity: Decimal,
    /// Trade time.
    pub timestamp: DateTime<Utc>,
    /// True when the buyer was the resting (maker) side.
    pub is_buyer_market_maker: bool,
}

impl AggregateTrade {
    /// Convert to a tick, synthesizing the touch around the trade price.
    ///
    /// A buyer-maker trade hit the bid, so the bid is the trade price and the
    /// ask sits one increment above. Otherwise the trade lifted the ask and
    /// the bid sits one increment below.
    #[must_use]
    pub fn to_tick(&self, min_price_increment: Decimal) -> Tick {
        let (bid, ask) = if self.is_buyer_market_maker {
            (self.price, self.price + min_price_increment)
        } else {
            (self.price - min_price_increment, self.price)
        };

        Tick {
            price: self.price,
            bid,
            ask,
            volume: self.quantity,
            timestamp: self.timestamp,
        }
    }
}

// =============================================================================
// Tick
// =============================================================================

/// A normalized trade tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Trade price.
    pub price: Decimal,
    /// Synthesized bid.
    pub bid: Decimal,
    /// Synthesized ask.
    pub ask: Decimal,
    /// Traded quantity.
    pub volume: Decimal,
    /// Trade time, millisecond precision.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}
