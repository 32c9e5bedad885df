//! Tick Provider Service
//!
//! Entry point for consumers. Owns the hour and live provider stores, wires
//! their collaborators, builds composites on request and periodically
//! evicts providers nobody holds.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{FileStorePort, HistoricalTradesPort, TradeStreamPort};
use crate::domain::market::Instrument;
use crate::domain::provider::error::ProviderError;
use crate::domain::provider::{ProviderInfo, ProviderRequest, ProviderStatus, TickProvider};
use crate::domain::time::Clock;
use crate::infrastructure::metrics;

use super::cache::HourCache;
use super::composite::{CompositeTickProvider, HourProviderStore, LiveProviderStore};
use super::hour_provider::{HourProvider, HourProviderDeps};
use super::live_provider::{LiveProvider, LiveProviderDeps};

/// Status of every stored provider.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    /// Hour providers.
    pub hours: Vec<ProviderStatus>,
    /// Live providers.
    pub live: Vec<ProviderStatus>,
}

/// Builds tick providers for arbitrary windows.
#[derive(Debug, Clone)]
pub struct TickProviderService {
    hours: Arc<HourProviderStore>,
    live: Arc<LiveProviderStore>,
    clock: Arc<dyn Clock>,
}

impl TickProviderService {
    /// Wire the stores to their collaborators.
    pub fn new(
        historical: Arc<dyn HistoricalTradesPort>,
        feed: Arc<dyn TradeStreamPort>,
        files: Arc<dyn FileStorePort>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let hour_deps = HourProviderDeps {
            historical: Arc::clone(&historical),
            cache: HourCache::new(files),
        };
        let hours = HourProviderStore::new("hour", move |info: &ProviderInfo| {
            HourProvider::new(info.clone(), hour_deps.clone())
        });

        let live_deps = LiveProviderDeps {
            historical,
            feed,
            clock: Arc::clone(&clock),
        };
        let live = LiveProviderStore::new("live", move |instrument: &Instrument| {
            Ok(LiveProvider::new(instrument.clone(), live_deps.clone()))
        });

        Self {
            hours: Arc::new(hours),
            live: Arc::new(live),
            clock,
        }
    }

    /// Build and start a provider for `request`.
    ///
    /// The returned provider is loading; await its lifecycle's
    /// `wait_ready` before reading. Dropping it releases its constituents.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the request cannot be served.
    pub fn get_tick_provider(
        &self,
        request: ProviderRequest,
    ) -> Result<CompositeTickProvider, ProviderError> {
        let composite =
            CompositeTickProvider::assemble(request, &self.hours, &self.live, self.clock.now())?;
        tracing::debug!(
            provider = %composite.name(),
            constituents = composite.constituents().len(),
            "Tick provider assembled"
        );
        composite.start();
        self.publish_store_sizes();
        Ok(composite)
    }

    /// The hour provider store.
    #[must_use]
    pub fn hour_store(&self) -> &Arc<HourProviderStore> {
        &self.hours
    }

    /// The live provider store.
    #[must_use]
    pub fn live_store(&self) -> &Arc<LiveProviderStore> {
        &self.live
    }

    /// Evict unreferenced providers from both stores.
    pub fn collect(&self) -> usize {
        let hours = self.hours.collect();
        let live = self.live.collect();
        if hours > 0 {
            metrics::record_evictions(self.hours.kind(), hours as u64);
        }
        if live > 0 {
            metrics::record_evictions(self.live.kind(), live as u64);
        }
        self.publish_store_sizes();
        if hours + live > 0 {
            tracing::debug!(hours, live, "Collected idle providers");
        }
        hours + live
    }

    /// Status of every stored provider.
    #[must_use]
    pub fn statuses(&self) -> ServiceStatus {
        ServiceStatus {
            hours: self.hours.statuses(),
            live: self.live.statuses(),
        }
    }

    /// Run [`collect`](Self::collect) every `interval` until `cancel` fires.
    #[must_use]
    pub fn spawn_collector(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        service.collect();
                    }
                }
            }
            tracing::debug!("Provider collector stopped");
        })
    }

    /// Dispose every stored provider.
    pub fn shutdown(&self) {
        self.hours.dispose_all();
        self.live.dispose_all();
        self.publish_store_sizes();
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_store_sizes(&self) {
        metrics::set_store_size(self.hours.kind(), self.hours.len() as f64);
        metrics::set_store_size(self.live.kind(), self.live.len() as f64);
    }
}
