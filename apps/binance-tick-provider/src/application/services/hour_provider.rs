//! Hour Provider
//!
//! Serves one closed UTC hour of ticks for one instrument. Loads from the
//! hour cache when possible; otherwise fetches the hour's aggregate trades,
//! converts them to ticks and writes the cache before becoming ready.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::application::ports::{HistoricalTradesError, HistoricalTradesPort};
use crate::application::services::cache::HourCache;
use crate::domain::market::{AggregateTrade, Tick};
use crate::domain::provider::error::ProviderError;
use crate::domain::provider::lifecycle::Lifecycle;
use crate::domain::provider::{ProviderInfo, TickIdRange, TickProvider, provider_name};
use crate::domain::tick_stream::{TickReader, TickStream};
use crate::domain::time::{is_hour_aligned, one_hour};
use crate::infrastructure::metrics::{self, HourSource, ProviderKind};

/// Collaborators shared by every hour provider.
#[derive(Clone)]
pub struct HourProviderDeps {
    /// Exchange history.
    pub historical: Arc<dyn HistoricalTradesPort>,
    /// Local hour cache.
    pub cache: HourCache,
}

/// One closed hour of ticks.
pub struct HourProvider {
    info: ProviderInfo,
    until: DateTime<Utc>,
    lifecycle: Lifecycle,
    stream: Arc<TickStream>,
    ids: Arc<OnceLock<TickIdRange>>,
    deps: HourProviderDeps,
}

impl std::fmt::Debug for HourProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HourProvider")
            .field("info", &self.info)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl HourProvider {
    /// Create a provider for the hour described by `info`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidWindow`] unless `from` is on an hour
    /// boundary and `until` is exactly one hour later.
    pub fn new(info: ProviderInfo, deps: HourProviderDeps) -> Result<Self, ProviderError> {
        if !is_hour_aligned(info.from) {
            return Err(ProviderError::InvalidWindow(format!(
                "hour provider must start on an hour boundary, got {}",
                info.from
            )));
        }
        let until = info.from + one_hour();
        if info.until != Some(until) {
            return Err(ProviderError::InvalidWindow(format!(
                "hour provider must end one hour after {}, got {:?}",
                info.from, info.until
            )));
        }

        let lifecycle = Lifecycle::new(provider_name("HourProvider", &info));
        let stream = Arc::new(TickStream::new());
        let sealer = Arc::clone(&stream);
        lifecycle.on_dispose(move || {
            sealer.seal();
        });

        Ok(Self {
            info,
            until,
            lifecycle,
            stream,
            ids: Arc::new(OnceLock::new()),
            deps,
        })
    }

    /// Hour start.
    #[must_use]
    pub const fn hour(&self) -> DateTime<Utc> {
        self.info.from
    }
}

impl TickProvider for HourProvider {
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
        let load = HourLoad {
            info: self.info.clone(),
            until: self.until,
            lifecycle: self.lifecycle.clone(),
            stream: Arc::clone(&self.stream),
            ids: Arc::clone(&self.ids),
            deps: self.deps.clone(),
        };
        self.lifecycle.spawn_supervised(async move {
            let result = load.run().await;
            if result.as_ref().is_err_and(|e| !matches!(e, ProviderError::Cancelled)) {
                metrics::record_provider_failure(ProviderKind::Hour);
            }
            result
        });
    }

    fn first_tick_id(&self) -> Option<i64> {
        self.ids.get().map(|ids| ids.first)
    }

    fn last_tick_id(&self) -> Option<i64> {
        self.ids.get().map(|ids| ids.last)
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

/// State moved into the load task.
struct HourLoad {
    info: ProviderInfo,
    until: DateTime<Utc>,
    lifecycle: Lifecycle,
    stream: Arc<TickStream>,
    ids: Arc<OnceLock<TickIdRange>>,
    deps: HourProviderDeps,
}

impl HourLoad {
    async fn run(self) -> Result<(), ProviderError> {
        let started = Instant::now();
        let instrument = &self.info.instrument;

        let source = if let Some(cached) = self.deps.cache.read(instrument, self.info.from).await {
            metrics::record_cache_lookup(true);
            self.complete(cached.ids, cached.ticks)?;
            HourSource::Cache
        } else {
            metrics::record_cache_lookup(false);
            let trades = self.fetch().await?;
            let ids = TickIdRange {
                first: trades[0].trade_id,
                last: trades[trades.len() - 1].trade_id,
            };
            let increment = instrument.min_price_increment;
            self.complete(ids, trades.iter().map(|t| t.to_tick(increment)).collect())?;

            if let Err(e) = self
                .deps
                .cache
                .write(instrument, self.info.from, ids, &self.stream)
                .await
            {
                tracing::warn!(provider = %self.lifecycle.name(), error = %e, "Failed to write hour cache");
            }
            HourSource::Exchange
        };

        metrics::record_hour_load(source, started.elapsed());
        metrics::record_ticks_written(ProviderKind::Hour, self.stream.len() as u64);
        self.lifecycle.set_ready();
        tracing::info!(
            provider = %self.lifecycle.name(),
            source = ?source,
            ticks = self.stream.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "Hour loaded"
        );
        Ok(())
    }

    /// Fetch the hour and keep trades stamped inside `[from, until)`.
    async fn fetch(&self) -> Result<Vec<AggregateTrade>, ProviderError> {
        let symbol = &self.info.instrument.symbol;
        let result = self
            .deps
            .historical
            .get_aggregate_trades(symbol, self.info.from, self.until)
            .await;

        let trades = match result {
            Ok(trades) => {
                metrics::record_history_fetch(true, trades.len());
                trades
            }
            Err(e) => {
                metrics::record_history_fetch(false, 0);
                return Err(ProviderError::upstream(
                    format!("fetching aggregate trades for {}", self.lifecycle.name()),
                    e,
                ));
            }
        };

        let trades: Vec<AggregateTrade> = trades
            .into_iter()
            .filter(|t| t.timestamp >= self.info.from && t.timestamp < self.until)
            .collect();

        if trades.is_empty() {
            return Err(ProviderError::EmptyHour {
                symbol: symbol.clone(),
                hour: self.info.from,
            });
        }
        if let Some(pair) = trades.windows(2).find(|pair| pair[1].trade_id <= pair[0].trade_id) {
            return Err(ProviderError::upstream(
                format!("fetching aggregate trades for {}", self.lifecycle.name()),
                HistoricalTradesError::Decode {
                    message: format!(
                        "trade {} arrived after {}",
                        pair[1].trade_id, pair[0].trade_id
                    ),
                },
            ));
        }
        Ok(trades)
    }

    fn complete(&self, ids: TickIdRange, ticks: Vec<Tick>) -> Result<(), ProviderError> {
        let _ = self.ids.set(ids);
        self.stream
            .extend(ticks)
            .map_err(|_| ProviderError::Cancelled)?;
        self.stream.seal();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{FileStoreError, FileStorePort, MockHistoricalTradesPort};
    use crate::domain::market::Instrument;
    use crate::domain::provider::error::DisposeReason;
    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct MemoryFiles {
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl FileStorePort for MemoryFiles {
        async fn read_bytes(&self, path: &str) -> Result<Option<Vec<u8>>, FileStoreError> {
            Ok(self.files.lock().get(path).cloned())
        }

        async fn write_bytes(&self, path: &str, bytes: &[u8]) -> Result<(), FileStoreError> {
            self.files.lock().insert(path.to_string(), bytes.to_vec());
            Ok(())
        }
    }

    fn btc() -> Instrument {
        Instrument::new("BTCUSDT", Decimal::new(1, 2))
    }

    fn hour() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    fn trade(id: i64, offset: TimeDelta) -> AggregateTrade {
        AggregateTrade {
            trade_id: id,
            price: Decimal::new(100, 0),
            quantity: Decimal::ONE,
            timestamp: hour() + offset,
            is_buyer_market_maker: id % 2 == 0,
        }
    }

    fn deps(historical: MockHistoricalTradesPort, files: Arc<MemoryFiles>) -> HourProviderDeps {
        HourProviderDeps {
            historical: Arc::new(historical),
            cache: HourCache::new(files),
        }
    }

    async fn wait_ready(provider: &HourProvider) -> Result<(), ProviderError> {
        tokio::time::timeout(
            Duration::from_secs(2),
            provider.lifecycle().wait_ready(&CancellationToken::new()),
        )
        .await
        .unwrap()
    }

    #[test]
    fn rejects_unaligned_start() {
        let files = Arc::new(MemoryFiles::default());
        let info = ProviderInfo::new(btc(), hour() + TimeDelta::minutes(1), hour() + one_hour());
        let err = HourProvider::new(info, deps(MockHistoricalTradesPort::new(), files)).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidWindow(_)));
    }

    #[test]
    fn rejects_wrong_width() {
        let files = Arc::new(MemoryFiles::default());
        let info = ProviderInfo::new(btc(), hour(), hour() + TimeDelta::minutes(30));
        assert!(HourProvider::new(info, deps(MockHistoricalTradesPort::new(), files.clone())).is_err());

        let open = ProviderInfo::open(btc(), hour());
        assert!(HourProvider::new(open, deps(MockHistoricalTradesPort::new(), files)).is_err());
    }

    #[test]
    fn name_shows_symbol_and_hour() {
        let files = Arc::new(MemoryFiles::default());
        let provider = HourProvider::new(
            ProviderInfo::hour(btc(), hour()),
            deps(MockHistoricalTradesPort::new(), files),
        )
        .unwrap();
        assert_eq!(provider.name(), "HourProvider 'BTCUSDT' from 2024-06-01 08:00");
    }

    #[tokio::test]
    async fn fetches_converts_and_caches() {
        let mut historical = MockHistoricalTradesPort::new();
        historical
            .expect_get_aggregate_trades()
            .times(1)
            .returning(|_, _, _| {
                Ok(vec![
                    trade(10, TimeDelta::minutes(1)),
                    trade(11, TimeDelta::minutes(2)),
                    trade(12, TimeDelta::minutes(59)),
                ])
            });
        let files = Arc::new(MemoryFiles::default());
        let provider =
            HourProvider::new(ProviderInfo::hour(btc(), hour()), deps(historical, files.clone())).unwrap();

        provider.start();
        wait_ready(&provider).await.unwrap();

        assert_eq!(provider.first_tick_id(), Some(10));
        assert_eq!(provider.last_tick_id(), Some(12));
        let ticks = provider.create_reader().unwrap().read_available();
        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks[0].bid, Decimal::new(100, 0));
        assert_eq!(ticks[1].ask, Decimal::new(100, 0));
        assert_eq!(files.files.lock().len(), 2);
    }

    #[tokio::test]
    async fn second_load_uses_cache() {
        let files = Arc::new(MemoryFiles::default());
        let mut historical = MockHistoricalTradesPort::new();
        historical
            .expect_get_aggregate_trades()
            .times(1)
            .returning(|_, _, _| Ok(vec![trade(5, TimeDelta::minutes(3))]));
        let first =
            HourProvider::new(ProviderInfo::hour(btc(), hour()), deps(historical, files.clone())).unwrap();
        first.start();
        wait_ready(&first).await.unwrap();

        let mut offline = MockHistoricalTradesPort::new();
        offline.expect_get_aggregate_trades().never();
        let second = HourProvider::new(ProviderInfo::hour(btc(), hour()), deps(offline, files)).unwrap();
        second.start();
        wait_ready(&second).await.unwrap();

        assert_eq!(second.first_tick_id(), Some(5));
        assert_eq!(second.last_tick_id(), Some(5));
        assert_eq!(
            second.create_reader().unwrap().read_available(),
            first.create_reader().unwrap().read_available()
        );
    }

    #[tokio::test]
    async fn empty_hour_fails() {
        let mut historical = MockHistoricalTradesPort::new();
        historical
            .expect_get_aggregate_trades()
            .returning(|_, _, _| Ok(Vec::new()));
        let files = Arc::new(MemoryFiles::default());
        let provider =
            HourProvider::new(ProviderInfo::hour(btc(), hour()), deps(historical, files.clone())).unwrap();

        provider.start();
        let err = wait_ready(&provider).await.unwrap_err();

        match err {
            ProviderError::Failed { source, .. } => {
                assert!(matches!(*source, ProviderError::EmptyHour { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(files.files.lock().is_empty());
    }

    #[tokio::test]
    async fn trade_on_closing_boundary_is_excluded() {
        let mut historical = MockHistoricalTradesPort::new();
        historical.expect_get_aggregate_trades().returning(|_, _, _| {
            Ok(vec![trade(1, TimeDelta::zero()), trade(2, one_hour())])
        });
        let files = Arc::new(MemoryFiles::default());
        let provider =
            HourProvider::new(ProviderInfo::hour(btc(), hour()), deps(historical, files)).unwrap();

        provider.start();
        wait_ready(&provider).await.unwrap();
        assert_eq!(provider.last_tick_id(), Some(1));
    }

    #[tokio::test]
    async fn fetch_error_disposes_with_upstream_failure() {
        let mut historical = MockHistoricalTradesPort::new();
        historical.expect_get_aggregate_trades().returning(|_, _, _| {
            Err(HistoricalTradesError::Network {
                message: "connection reset".to_string(),
            })
        });
        let files = Arc::new(MemoryFiles::default());
        let provider =
            HourProvider::new(ProviderInfo::hour(btc(), hour()), deps(historical, files)).unwrap();

        provider.start();
        let err = wait_ready(&provider).await.unwrap_err();
        assert!(crate::domain::provider::error::error_chain(&err).contains("connection reset"));
    }

    #[tokio::test]
    async fn reader_before_ready_is_rejected() {
        let files = Arc::new(MemoryFiles::default());
        let provider = HourProvider::new(
            ProviderInfo::hour(btc(), hour()),
            deps(MockHistoricalTradesPort::new(), files),
        )
        .unwrap();
        assert!(matches!(
            provider.create_reader(),
            Err(ProviderError::NotReady { .. })
        ));
        provider.lifecycle().dispose(DisposeReason::Requested);
    }
}
