//! Live Provider
//!
//! Serves the current hour onward for one instrument. On start it
//! subscribes to the aggregate-trade feed, reads the first live trade `X`,
//! backfills `[hour start, X.time]` from history, writes the backfill
//! trades with ids below `X`, then `X`, then whatever the feed buffered
//! meanwhile. Only then is it ready; after that it appends every live trade
//! until disposed or the feed ends.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};

use crate::application::ports::{HistoricalTradesPort, TradeStreamPort, TradeSubscription};
use crate::domain::market::{AggregateTrade, Instrument, StreamInfo};
use crate::domain::provider::error::ProviderError;
use crate::domain::provider::lifecycle::Lifecycle;
use crate::domain::provider::{ProviderInfo, TickProvider, provider_name};
use crate::domain::tick_stream::{TickReader, TickStream};
use crate::domain::time::{Clock, floor_to_hour, one_hour};
use crate::infrastructure::metrics::{self, ProviderKind};

/// Collaborators shared by every live provider.
#[derive(Clone)]
pub struct LiveProviderDeps {
    /// Exchange history, used for the backfill.
    pub historical: Arc<dyn HistoricalTradesPort>,
    /// Live trade feed.
    pub feed: Arc<dyn TradeStreamPort>,
    /// Source of "now".
    pub clock: Arc<dyn Clock>,
}

/// Current hour plus the live feed for one instrument.
pub struct LiveProvider {
    info: ProviderInfo,
    lifecycle: Lifecycle,
    stream: Arc<TickStream>,
    first_tick_id: Arc<OnceLock<i64>>,
    latest_tick_id: Arc<AtomicI64>,
    feed_running: Arc<AtomicBool>,
    deps: LiveProviderDeps,
}

impl std::fmt::Debug for LiveProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveProvider")
            .field("info", &self.info)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl LiveProvider {
    /// Create a provider starting at the hour containing `clock.now()`.
    #[must_use]
    pub fn new(instrument: Instrument, deps: LiveProviderDeps) -> Self {
        let info = ProviderInfo::open(instrument, floor_to_hour(deps.clock.now()));
        let lifecycle = Lifecycle::new(provider_name("LiveProvider", &info));

        let stream = Arc::new(TickStream::new());
        let sealer = Arc::clone(&stream);
        lifecycle.on_dispose(move || {
            sealer.seal();
        });

        Self {
            info,
            lifecycle,
            stream,
            first_tick_id: Arc::new(OnceLock::new()),
            latest_tick_id: Arc::new(AtomicI64::new(-1)),
            feed_running: Arc::new(AtomicBool::new(false)),
            deps,
        }
    }

    /// Id of the most recent trade written, once any has been.
    #[must_use]
    pub fn latest_tick_id(&self) -> Option<i64> {
        let id = self.latest_tick_id.load(Ordering::Acquire);
        (id >= 0).then_some(id)
    }

    /// True while the feed task is alive. Cleared once the task returns or
    /// is dropped on disposal.
    #[must_use]
    pub fn is_feed_running(&self) -> bool {
        self.feed_running.load(Ordering::Acquire)
    }
}

/// Counts a running feed task in the live-feeds gauge until dropped.
struct FeedGauge {
    running: Arc<AtomicBool>,
}

impl FeedGauge {
    fn enter(running: Arc<AtomicBool>) -> Self {
        running.store(true, Ordering::Release);
        metrics::adjust_live_feeds(1.0);
        Self { running }
    }
}

impl Drop for FeedGauge {
    fn drop(&mut self) {
        metrics::adjust_live_feeds(-1.0);
        self.running.store(false, Ordering::Release);
    }
}

impl TickProvider for LiveProvider {
    fn info(&self) -> &ProviderInfo {
        &self.info
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn start(&self) {
        if !self.lifecycle.mark_started() {
            return;
        }
        let feed = LiveFeed {
            info: self.info.clone(),
            lifecycle: self.lifecycle.clone(),
            stream: Arc::clone(&self.stream),
            first_tick_id: Arc::clone(&self.first_tick_id),
            latest_tick_id: Arc::clone(&self.latest_tick_id),
            guard: SequenceGuard::new(&self.info.instrument.symbol),
            deps: self.deps.clone(),
        };
        let running = Arc::clone(&self.feed_running);
        self.lifecycle.spawn_supervised(async move {
            // Dropped with this future when disposal cancels it mid-run.
            let _gauge = FeedGauge::enter(running);
            let result = feed.run().await;
            if result.as_ref().is_err_and(|e| !matches!(e, ProviderError::Cancelled)) {
                metrics::record_provider_failure(ProviderKind::Live);
            }
            result
        });
    }

    fn first_tick_id(&self) -> Option<i64> {
        self.first_tick_id.get().copied()
    }

    /// Always `None`: the window is open-ended.
    fn last_tick_id(&self) -> Option<i64> {
        None
    }

    fn create_reader(&self) -> Result<TickReader, ProviderError> {
        if !self.lifecycle.is_ready() {
            return Err(ProviderError::NotReady {
                name: self.lifecycle.name().to_string(),
            });
        }
        Ok(self.stream.reader())
    }
}

// =============================================================================
// Sequencing
// =============================================================================

/// What to do with an incoming trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Next in sequence; write it.
    Accept,
    /// Already written; skip it.
    Duplicate,
}

/// Enforces strictly consecutive trade ids on the written stream.
#[derive(Debug, Clone)]
pub struct SequenceGuard {
    symbol: String,
    last: Option<i64>,
}

impl SequenceGuard {
    /// A guard that accepts any first id.
    #[must_use]
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            last: None,
        }
    }

    /// Last accepted id.
    #[must_use]
    pub const fn last(&self) -> Option<i64> {
        self.last
    }

    /// Check `trade_id` against the last accepted id.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::FeedGap`] when ids were skipped.
    pub fn admit(&mut self, trade_id: i64) -> Result<Admission, ProviderError> {
        match self.last {
            Some(last) if trade_id <= last => Ok(Admission::Duplicate),
            Some(last) if trade_id > last + 1 => Err(ProviderError::FeedGap {
                symbol: self.symbol.clone(),
                expected: last + 1,
                received: trade_id,
            }),
            _ => {
                self.last = Some(trade_id);
                Ok(Admission::Accept)
            }
        }
    }
}

// =============================================================================
// Feed Task
// =============================================================================

struct LiveFeed {
    info: ProviderInfo,
    lifecycle: Lifecycle,
    stream: Arc<TickStream>,
    first_tick_id: Arc<OnceLock<i64>>,
    latest_tick_id: Arc<AtomicI64>,
    guard: SequenceGuard,
    deps: LiveProviderDeps,
}

impl LiveFeed {
    async fn run(mut self) -> Result<(), ProviderError> {
        let symbol = self.info.instrument.symbol.clone();
        let stream_info = StreamInfo::aggregate_trade(&symbol);

        let mut subscription = self.deps.feed.subscribe(&stream_info).await.map_err(|e| {
            ProviderError::upstream(format!("subscribing to {}", stream_info.name()), e)
        })?;
        tracing::debug!(provider = %self.lifecycle.name(), stream = %stream_info.name(), "Live feed subscribed");

        let first_live = subscription
            .recv()
            .await
            .ok_or_else(|| ProviderError::FeedEnded {
                symbol: symbol.clone(),
            })?;

        let backfill = self.backfill(first_live.timestamp).await?;
        let backfilled = backfill.len();
        for trade in backfill
            .iter()
            .take_while(|t| t.trade_id < first_live.trade_id)
        {
            self.write(trade)?;
        }
        self.write(&first_live)?;
        while let Some(trade) = subscription.try_recv() {
            self.write(&trade)?;
        }

        self.lifecycle.set_ready();
        tracing::info!(
            provider = %self.lifecycle.name(),
            first_tick_id = ?self.first_tick_id.get(),
            backfilled,
            "Live provider ready"
        );

        self.follow(&mut subscription).await
    }

    /// Fetch `[from, until]` in windows no wider than one hour.
    async fn backfill(&self, until: DateTime<Utc>) -> Result<Vec<AggregateTrade>, ProviderError> {
        let symbol = &self.info.instrument.symbol;
        let mut trades = Vec::new();
        let mut from = self.info.from;

        while from <= until {
            let chunk_end = (from + one_hour()).min(until);
            let chunk = match self
                .deps
                .historical
                .get_aggregate_trades(symbol, from, chunk_end)
                .await
            {
                Ok(chunk) => {
                    metrics::record_history_fetch(true, chunk.len());
                    chunk
                }
                Err(e) => {
                    metrics::record_history_fetch(false, 0);
                    return Err(ProviderError::upstream(
                        format!("backfilling {}", self.lifecycle.name()),
                        e,
                    ));
                }
            };
            trades.extend(chunk);
            from = chunk_end + chrono::TimeDelta::milliseconds(1);
        }

        Ok(trades)
    }

    async fn follow(&mut self, subscription: &mut TradeSubscription) -> Result<(), ProviderError> {
        while let Some(trade) = subscription.recv().await {
            self.write(&trade)?;
        }
        Err(ProviderError::FeedEnded {
            symbol: self.info.instrument.symbol.clone(),
        })
    }

    fn write(&mut self, trade: &AggregateTrade) -> Result<(), ProviderError> {
        if self.guard.admit(trade.trade_id)? == Admission::Duplicate {
            tracing::trace!(provider = %self.lifecycle.name(), trade_id = trade.trade_id, "Skipping duplicate trade");
            return Ok(());
        }

        let tick = trade.to_tick(self.info.instrument.min_price_increment);
        self.stream.push(tick).map_err(|_| ProviderError::Cancelled)?;
        let _ = self.first_tick_id.set(trade.trade_id);
        self.latest_tick_id.store(trade.trade_id, Ordering::Release);
        metrics::record_ticks_written(ProviderKind::Live, 1);
        Ok(())
    }
}
