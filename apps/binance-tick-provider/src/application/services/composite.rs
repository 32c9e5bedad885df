//! Composite Tick Provider
//!
//! Stitches the hour providers covering a request with, for open-ended
//! requests, the live provider. Becomes ready once every constituent is
//! ready and adjacent constituents join on consecutive trade ids; fails as
//! soon as any constituent fails.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{select_all, try_join_all};

use crate::domain::market::Instrument;
use crate::domain::provider::error::{DisposeReason, ProviderError};
use crate::domain::provider::lifecycle::{Lifecycle, UsageToken};
use crate::domain::provider::store::{ProviderLease, ProviderStore};
use crate::domain::provider::{
    ProviderInfo, ProviderRequest, ProviderStatus, StatusState, TickProvider, provider_name,
};
use crate::domain::tick_stream::TickReader;
use crate::domain::time::{floor_to_hour, one_hour};
use crate::infrastructure::metrics::{self, ProviderKind};

use super::hour_provider::HourProvider;
use super::live_provider::LiveProvider;

/// Store of hour providers keyed by their window.
pub type HourProviderStore = ProviderStore<ProviderInfo, HourProvider>;

/// Store of live providers keyed by instrument.
pub type LiveProviderStore = ProviderStore<Instrument, LiveProvider>;

/// A provider the composite reads from, pinned by its usage token.
pub struct Constituent {
    provider: Arc<dyn TickProvider>,
    token: UsageToken,
}

impl Constituent {
    /// Pair a provider with the token that keeps it alive.
    #[must_use]
    pub fn new(provider: Arc<dyn TickProvider>, token: UsageToken) -> Self {
        Self { provider, token }
    }

    /// Take over a store lease.
    #[must_use]
    pub fn from_lease<P: TickProvider + 'static>(lease: ProviderLease<P>) -> Self {
        let (provider, token) = lease.into_parts();
        Self::new(provider, token)
    }

    /// The provider.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn TickProvider> {
        &self.provider
    }
}

/// Tick provider for an arbitrary request window.
pub struct CompositeTickProvider {
    info: ProviderInfo,
    lifecycle: Lifecycle,
    providers: Vec<Arc<dyn TickProvider>>,
}

impl std::fmt::Debug for CompositeTickProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeTickProvider")
            .field("info", &self.info)
            .field("lifecycle", &self.lifecycle)
            .field("constituents", &self.providers.len())
            .finish()
    }
}

impl CompositeTickProvider {
    /// Gather the constituents covering `request` from the stores.
    ///
    /// Hours are taken from `floor(from)` up to, but excluding, the hour
    /// containing `now` (and never at or past `until`). Open-ended requests
    /// then append the live provider, first dropping trailing hours that
    /// overlap its start. An empty window takes no constituents.
    ///
    /// # Errors
    ///
    /// Returns validation errors from the request or the stores. Leases
    /// taken before the failure are released.
    pub fn assemble(
        request: ProviderRequest,
        hours: &HourProviderStore,
        live: &LiveProviderStore,
        now: DateTime<Utc>,
    ) -> Result<Self, ProviderError> {
        request.validate(now)?;
        if request.is_empty() {
            return Self::from_constituents(request, Vec::new());
        }

        let current_hour = floor_to_hour(now);
        let mut constituents = Vec::new();
        let mut hour = floor_to_hour(request.from);
        while hour < current_hour && request.until.is_none_or(|until| hour < until) {
            let lease = hours.get_or_create(&ProviderInfo::hour(request.instrument.clone(), hour))?;
            constituents.push(Constituent::from_lease(lease));
            hour += one_hour();
        }

        if request.is_open() {
            let lease = live.get_or_create(&request.instrument)?;
            let live_from = lease.info().from;
            while constituents
                .last()
                .is_some_and(|c| c.provider.info().until.is_some_and(|until| until > live_from))
            {
                if let Some(dropped) = constituents.pop() {
                    tracing::debug!(provider = %dropped.provider.name(), %live_from, "Dropping hour covered by live provider");
                }
            }
            constituents.push(Constituent::from_lease(lease));
        }

        Self::from_constituents(request, constituents)
    }

    /// Build a composite over explicit constituents, in read order.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidRequest`] if `constituents` is empty
    /// and the request window is not.
    pub fn from_constituents(
        request: ProviderRequest,
        constituents: Vec<Constituent>,
    ) -> Result<Self, ProviderError> {
        if constituents.is_empty() && !request.is_empty() {
            return Err(ProviderError::InvalidRequest(format!(
                "no providers cover {} from {} until {:?}",
                request.instrument, request.from, request.until
            )));
        }

        let name = match request.until {
            Some(until) => format!(
                "{} until {}",
                provider_name("TickProvider", &request),
                until.format("%Y-%m-%d %H:%M")
            ),
            None => provider_name("TickProvider", &request),
        };
        let lifecycle = Lifecycle::new(name);

        let (providers, tokens): (Vec<_>, Vec<_>) = constituents
            .into_iter()
            .map(|c| (c.provider, c.token))
            .unzip();
        lifecycle.on_dispose(move || drop(tokens));

        Ok(Self {
            info: request,
            lifecycle,
            providers,
        })
    }

    /// Constituents in read order.
    #[must_use]
    pub fn constituents(&self) -> &[Arc<dyn TickProvider>] {
        &self.providers
    }
}

impl TickProvider for CompositeTickProvider {
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
        let lifecycle = self.lifecycle.clone();
        let providers = self.providers.clone();
        self.lifecycle.spawn_supervised(async move {
            let result = supervise(&lifecycle, &providers).await;
            if result.as_ref().is_err_and(|e| !matches!(e, ProviderError::Cancelled)) {
                metrics::record_provider_failure(ProviderKind::Composite);
            }
            result
        });
    }

    fn first_tick_id(&self) -> Option<i64> {
        self.providers.first().and_then(|p| p.first_tick_id())
    }

    fn last_tick_id(&self) -> Option<i64> {
        self.providers.last().and_then(|p| p.last_tick_id())
    }

    /// Concatenate the constituents' readers and skip ticks before `from`.
    ///
    /// Ticks at or after a closed request's `until` are not trimmed; readers
    /// run to the end of the last hour.
    fn create_reader(&self) -> Result<TickReader, ProviderError> {
        if !self.lifecycle.is_ready() {
            return Err(ProviderError::NotReady {
                name: self.lifecycle.name().to_string(),
            });
        }
        let readers = self
            .providers
            .iter()
            .map(|p| p.create_reader())
            .collect::<Result<Vec<_>, _>>()?;
        let mut reader = TickReader::concat(readers);
        reader.skip_before(self.info.from);
        Ok(reader)
    }

    fn status(&self) -> ProviderStatus {
        let total = self.providers.len();
        let completed = self
            .providers
            .iter()
            .filter(|p| p.lifecycle().is_ready())
            .count();
        let mut status = ProviderStatus::from_lifecycle(&self.lifecycle, completed, total);
        if status.state == StatusState::Loading {
            status.summary = format!("waiting for providers ({completed}/{total} ready)");
        }
        status
    }
}

impl Drop for CompositeTickProvider {
    fn drop(&mut self) {
        self.lifecycle.dispose(DisposeReason::Requested);
    }
}

/// Wait for readiness, verify joins, then watch for the first failure.
async fn supervise(
    lifecycle: &Lifecycle,
    providers: &[Arc<dyn TickProvider>],
) -> Result<(), ProviderError> {
    let cancel = lifecycle.cancellation_token();

    try_join_all(providers.iter().map(|p| {
        let cancel = &cancel;
        async move { p.lifecycle().wait_ready(cancel).await }
    }))
    .await?;

    if let Err(e) = verify_contiguity(providers) {
        metrics::record_contiguity_violation();
        return Err(e);
    }

    lifecycle.set_ready();
    tracing::info!(provider = %lifecycle.name(), constituents = providers.len(), "Tick provider ready");

    if providers.is_empty() {
        cancel.cancelled().await;
        return Err(ProviderError::Cancelled);
    }

    let (failure, _, _) = select_all(
        providers
            .iter()
            .map(|p| Box::pin(p.lifecycle().wait_error(&cancel))),
    )
    .await;
    Err(failure?)
}

/// Check that each constituent's first id follows its predecessor's last.
///
/// Pairs are checked from the end backward; the first mismatch found is
/// reported.
///
/// # Errors
///
/// Returns [`ProviderError::Contiguity`] on a mismatch, or
/// [`ProviderError::MissingTickId`] if a boundary id is unknown.
pub fn verify_contiguity(providers: &[Arc<dyn TickProvider>]) -> Result<(), ProviderError> {
    for pair in providers.windows(2).rev() {
        let (earlier, later) = (&pair[0], &pair[1]);
        let last = earlier.last_tick_id().ok_or_else(|| ProviderError::MissingTickId {
            name: earlier.name().to_string(),
            boundary: "last",
        })?;
        let first = later.first_tick_id().ok_or_else(|| ProviderError::MissingTickId {
            name: later.name().to_string(),
            boundary: "first",
        })?;
        if first != last + 1 {
            return Err(ProviderError::Contiguity {
                earlier: earlier.name().to_string(),
                later: later.name().to_string(),
                last_tick_id: last,
                first_tick_id: first,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tick_stream::TickStream;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct StubProvider {
        info: ProviderInfo,
        lifecycle: Lifecycle,
        ids: (Option<i64>, Option<i64>),
        stream: Arc<TickStream>,
    }

    impl StubProvider {
        fn new(name: &str, first: i64, last: Option<i64>) -> Arc<Self> {
            Arc::new(Self {
                info: ProviderInfo::open(btc(), at(0)),
                lifecycle: Lifecycle::new(name),
                ids: (Some(first), last),
                stream: Arc::new(TickStream::sealed(Vec::new())),
            })
        }
    }

    impl TickProvider for StubProvider {
        fn info(&self) -> &ProviderInfo {
            &self.info
        }
        fn lifecycle(&self) -> &Lifecycle {
            &self.lifecycle
        }
        fn start(&self) {}
        fn first_tick_id(&self) -> Option<i64> {
            self.ids.0
        }
        fn last_tick_id(&self) -> Option<i64> {
            self.ids.1
        }
        fn create_reader(&self) -> Result<TickReader, ProviderError> {
            Ok(self.stream.reader())
        }
    }

    fn btc() -> Instrument {
        Instrument::new("BTCUSDT", Decimal::new(1, 2))
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, h, 0, 0).unwrap()
    }

    fn constituent(provider: &Arc<StubProvider>) -> Constituent {
        let token = provider.lifecycle.acquire_usage();
        Constituent::new(Arc::clone(provider) as Arc<dyn TickProvider>, token)
    }

    async fn settle(composite: &CompositeTickProvider) -> Result<(), ProviderError> {
        tokio::time::timeout(
            Duration::from_secs(2),
            composite.lifecycle().wait_ready(&CancellationToken::new()),
        )
        .await
        .unwrap()
    }

    #[test]
    fn contiguity_accepts_consecutive_ids() {
        let a = StubProvider::new("a", 1, Some(5)) as Arc<dyn TickProvider>;
        let b = StubProvider::new("b", 6, Some(9)) as Arc<dyn TickProvider>;
        let c = StubProvider::new("c", 10, None) as Arc<dyn TickProvider>;
        assert!(verify_contiguity(&[a, b, c]).is_ok());
    }

    #[test]
    fn contiguity_reports_latest_gap_first() {
        let a = StubProvider::new("a", 1, Some(5)) as Arc<dyn TickProvider>;
        let b = StubProvider::new("b", 7, Some(9)) as Arc<dyn TickProvider>;
        let c = StubProvider::new("c", 11, None) as Arc<dyn TickProvider>;

        match verify_contiguity(&[a, b, c]).unwrap_err() {
            ProviderError::Contiguity { earlier, later, .. } => {
                assert_eq!(earlier, "b");
                assert_eq!(later, "c");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn empty_constituents_are_rejected() {
        let err = CompositeTickProvider::from_constituents(
            ProviderInfo::new(btc(), at(1), at(2)),
            Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn empty_window_is_ready_with_nothing_to_read() {
        let composite = CompositeTickProvider::from_constituents(
            ProviderInfo::new(btc(), at(1), at(1)),
            Vec::new(),
        )
        .unwrap();
        composite.start();
        settle(&composite).await.unwrap();

        let reader = composite.create_reader().unwrap();
        assert!(reader.is_finished());
        assert_eq!(composite.first_tick_id(), None);
    }

    #[tokio::test]
    async fn ready_after_all_constituents_ready() {
        let a = StubProvider::new("a", 1, Some(5));
        let b = StubProvider::new("b", 6, None);
        let composite = CompositeTickProvider::from_constituents(
            ProviderInfo::open(btc(), at(1)),
            vec![constituent(&a), constituent(&b)],
        )
        .unwrap();
        composite.start();

        a.lifecycle.set_ready();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!composite.lifecycle().is_ready());
        assert_eq!(composite.status().completed, 1);

        b.lifecycle.set_ready();
        settle(&composite).await.unwrap();
        assert_eq!(composite.status().state, StatusState::Ready);
        assert_eq!(composite.first_tick_id(), Some(1));
    }

    #[tokio::test]
    async fn non_contiguous_constituents_fail() {
        let a = StubProvider::new("a", 1, Some(5));
        let b = StubProvider::new("b", 8, None);
        a.lifecycle.set_ready();
        b.lifecycle.set_ready();

        let composite = CompositeTickProvider::from_constituents(
            ProviderInfo::open(btc(), at(1)),
            vec![constituent(&a), constituent(&b)],
        )
        .unwrap();
        composite.start();

        let err = settle(&composite).await.unwrap_err();
        match err {
            ProviderError::Failed { source, .. } => {
                assert!(matches!(*source, ProviderError::Contiguity { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn constituent_failure_after_ready_disposes_composite() {
        let a = StubProvider::new("a", 1, None);
        a.lifecycle.set_ready();
        let composite = CompositeTickProvider::from_constituents(
            ProviderInfo::open(btc(), at(1)),
            vec![constituent(&a)],
        )
        .unwrap();
        composite.start();
        settle(&composite).await.unwrap();

        a.lifecycle.dispose(DisposeReason::from_error(ProviderError::FeedEnded {
            symbol: "BTCUSDT".to_string(),
        }));

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            composite.lifecycle().wait_error(&CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        let chain = crate::domain::provider::error::error_chain(&err);
        assert!(chain.contains("live feed for BTCUSDT ended"), "{chain}");
        assert_eq!(composite.status().state, StatusState::Error);
    }

    #[tokio::test]
    async fn dispose_releases_tokens() {
        let a = StubProvider::new("a", 1, None);
        let composite = CompositeTickProvider::from_constituents(
            ProviderInfo::open(btc(), at(1)),
            vec![constituent(&a)],
        )
        .unwrap();
        assert_eq!(a.lifecycle.use_count(), 1);

        drop(composite);
        assert_eq!(a.lifecycle.use_count(), 0);
    }
}
