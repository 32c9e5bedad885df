//! In-memory collaborators shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use binance_tick_provider::application::ports::{
    HistoricalTradesError, HistoricalTradesPort, TradeStreamError, TradeStreamPort,
    TradeSubscription,
};
use binance_tick_provider::{
    AggregateTrade, Clock, FsFileStore, Instrument, ManualClock, StreamInfo, TickProviderService,
};

/// Generous bound for anything a test awaits.
pub const WAIT: Duration = Duration::from_secs(5);

/// 2024-01-01 at `hour:minute` UTC.
pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap()
}

pub fn btc() -> Instrument {
    Instrument::new("BTCUSDT", Decimal::new(1, 2))
}

/// A trade whose price encodes its id, so ticks can be matched back.
pub fn trade(id: i64, timestamp: DateTime<Utc>) -> AggregateTrade {
    AggregateTrade {
        trade_id: id,
        price: Decimal::new(10_000 + id, 0),
        quantity: Decimal::ONE,
        timestamp,
        is_buyer_market_maker: id % 2 == 0,
    }
}

/// Trades `ids` spaced one minute apart starting at `first_at`.
pub fn minute_trades(ids: std::ops::RangeInclusive<i64>, first_at: DateTime<Utc>) -> Vec<AggregateTrade> {
    let start = *ids.start();
    ids.map(|id| trade(id, first_at + TimeDelta::minutes(id - start)))
        .collect()
}

/// Recover the trade id a tick was built from.
pub fn id_of(tick: &binance_tick_provider::Tick) -> i64 {
    use rust_decimal::prelude::ToPrimitive;
    tick.price.to_i64().unwrap() - 10_000
}

// =============================================================================
// History
// =============================================================================

/// Serves a fixed trade list by inclusive time range, like the exchange.
#[derive(Default)]
pub struct FakeHistory {
    trades: Vec<AggregateTrade>,
    calls: AtomicUsize,
    failing: AtomicBool,
    stalled: AtomicBool,
}

impl FakeHistory {
    pub fn new(trades: Vec<AggregateTrade>) -> Arc<Self> {
        Arc::new(Self {
            trades,
            ..Self::default()
        })
    }

    /// A history that answers every request with a network error.
    pub fn unreachable() -> Arc<Self> {
        let history = Self::default();
        history.failing.store(true, Ordering::SeqCst);
        Arc::new(history)
    }

    /// A history whose requests never complete.
    pub fn stalled() -> Arc<Self> {
        let history = Self::default();
        history.stalled.store(true, Ordering::SeqCst);
        Arc::new(history)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoricalTradesPort for FakeHistory {
    async fn get_aggregate_trades(
        &self,
        _symbol: &str,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<AggregateTrade>, HistoricalTradesError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(HistoricalTradesError::Network {
                message: "unreachable".to_string(),
            });
        }
        Ok(self
            .trades
            .iter()
            .filter(|t| t.timestamp >= from && t.timestamp <= until)
            .cloned()
            .collect())
    }
}

// =============================================================================
// Live Feed
// =============================================================================

/// Live feed whose trades are pushed by the test.
#[derive(Default)]
pub struct FakeFeed {
    buffered: Mutex<Vec<AggregateTrade>>,
    senders: Mutex<Vec<mpsc::Sender<AggregateTrade>>>,
}

impl FakeFeed {
    /// A feed that delivers `buffered` immediately on subscribe.
    pub fn with_buffered(buffered: Vec<AggregateTrade>) -> Arc<Self> {
        Arc::new(Self {
            buffered: Mutex::new(buffered),
            senders: Mutex::new(Vec::new()),
        })
    }

    /// Deliver a trade to every open subscription.
    pub fn send(&self, trade: AggregateTrade) {
        for sender in self.senders.lock().iter() {
            sender.try_send(trade.clone()).unwrap();
        }
    }

    /// Close every subscription.
    pub fn end(&self) {
        self.senders.lock().clear();
    }

    pub fn subscriptions(&self) -> usize {
        self.senders.lock().len()
    }
}

#[async_trait]
impl TradeStreamPort for FakeFeed {
    async fn subscribe(&self, stream: &StreamInfo) -> Result<TradeSubscription, TradeStreamError> {
        let (tx, rx) = mpsc::channel(1024);
        for trade in self.buffered.lock().iter() {
            tx.try_send(trade.clone()).unwrap();
        }
        self.senders.lock().push(tx);
        Ok(TradeSubscription::new(stream.clone(), rx, CancellationToken::new()))
    }
}

// =============================================================================
// Wiring
// =============================================================================

pub struct Harness {
    pub service: TickProviderService,
    pub clock: Arc<ManualClock>,
    pub history: Arc<FakeHistory>,
    pub feed: Arc<FakeFeed>,
}

pub fn harness(
    history: Arc<FakeHistory>,
    feed: Arc<FakeFeed>,
    cache_dir: &std::path::Path,
    now: DateTime<Utc>,
) -> Harness {
    let clock = Arc::new(ManualClock::new(now));
    let service = TickProviderService::new(
        Arc::clone(&history) as Arc<dyn HistoricalTradesPort>,
        Arc::clone(&feed) as Arc<dyn TradeStreamPort>,
        Arc::new(FsFileStore::new(cache_dir)),
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    Harness {
        service,
        clock,
        history,
        feed,
    }
}
