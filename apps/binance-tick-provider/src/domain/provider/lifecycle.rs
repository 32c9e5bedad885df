//! Provider lifecycle state machine.
//!
//! Every provider moves `Loading -> Ready -> Disposed` or
//! `Loading -> Disposed`. Disposal happens exactly once; the first reason
//! recorded wins and later calls are no-ops. Waiters observe transitions
//! through a `watch` channel, and the background load task is cancelled
//! through a [`CancellationToken`] owned by the lifecycle.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::error::{DisposeReason, ProviderError};

/// Observable lifecycle state.
#[derive(Debug, Clone)]
pub enum LifecycleState {
    /// Loading has not finished.
    Loading,
    /// Data is available to readers.
    Ready,
    /// Terminal state.
    Disposed(DisposeReason),
}

impl LifecycleState {
    /// Short lowercase label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Disposed(DisposeReason::Failed(_)) => "error",
            Self::Disposed(_) => "disposed",
        }
    }
}

type DisposeHook = Box<dyn FnOnce() + Send>;

struct Inner {
    name: String,
    state: watch::Sender<LifecycleState>,
    cancel: CancellationToken,
    started: AtomicBool,
    usage: Arc<AtomicUsize>,
    // `None` once disposal has begun.
    hooks: Mutex<Option<Vec<DisposeHook>>>,
}

/// Shared handle to one provider's lifecycle.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("name", &self.inner.name)
            .field("state", &self.state().label())
            .field("use_count", &self.use_count())
            .finish_non_exhaustive()
    }
}

impl Lifecycle {
    /// Create a lifecycle in the `Loading` state.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(LifecycleState::Loading);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state,
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                usage: Arc::new(AtomicUsize::new(0)),
                hooks: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    /// Human-readable provider name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.state.borrow().clone()
    }

    /// True once ready and not yet disposed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(*self.inner.state.borrow(), LifecycleState::Ready)
    }

    /// True once disposed for any reason.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.hooks.lock().is_none()
    }

    /// Claim the right to start background work. Only the first call
    /// returns true.
    pub fn mark_started(&self) -> bool {
        !self.inner.started.swap(true, Ordering::AcqRel)
    }

    /// Move `Loading -> Ready`. Returns false from any other state.
    pub fn set_ready(&self) -> bool {
        let ready = self.inner.state.send_if_modified(|state| {
            if matches!(state, LifecycleState::Loading) {
                *state = LifecycleState::Ready;
                true
            } else {
                false
            }
        });
        if ready {
            tracing::debug!(provider = %self.inner.name, "Provider ready");
        }
        ready
    }

    /// Dispose with `reason`. Returns false if already disposed, in which
    /// case the original reason is kept.
    pub fn dispose(&self, reason: DisposeReason) -> bool {
        let Some(hooks) = self.inner.hooks.lock().take() else {
            return false;
        };

        match &reason {
            DisposeReason::Failed(err) => {
                tracing::warn!(provider = %self.inner.name, error = %err, "Provider failed");
            }
            DisposeReason::Cancelled => {
                tracing::debug!(provider = %self.inner.name, "Provider cancelled");
            }
            DisposeReason::Requested => {
                tracing::debug!(provider = %self.inner.name, "Provider disposed");
            }
        }

        self.inner
            .state
            .send_replace(LifecycleState::Disposed(reason));
        self.inner.cancel.cancel();
        for hook in hooks {
            hook();
        }
        true
    }

    /// Run `hook` once on disposal, or immediately if already disposed.
    pub fn on_dispose(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.inner.hooks.lock();
        if let Some(pending) = hooks.as_mut() {
            pending.push(Box::new(hook));
            return;
        }
        drop(hooks);
        hook();
    }

    /// Token cancelled when the provider is disposed.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Wait until the provider is ready.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Cancelled`] if `cancel` fires first, or the
    /// error describing the disposal if the provider never becomes ready.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let mut rx = self.inner.state.subscribe();
        let state = tokio::select! {
            biased;
            settled = rx.wait_for(|s| !matches!(s, LifecycleState::Loading)) => {
                settled.map(|s| (*s).clone())
            }
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        match state {
            Ok(LifecycleState::Ready | LifecycleState::Loading) => Ok(()),
            Ok(LifecycleState::Disposed(reason)) => Err(reason.to_error(&self.inner.name)),
            Err(_) => Err(DisposeReason::Requested.to_error(&self.inner.name)),
        }
    }

    /// Wait until the provider is disposed and return the error a dependent
    /// should surface.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Cancelled`] if `cancel` fires first.
    pub async fn wait_error(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ProviderError, ProviderError> {
        let mut rx = self.inner.state.subscribe();
        let state = tokio::select! {
            biased;
            settled = rx.wait_for(|s| matches!(s, LifecycleState::Disposed(_))) => {
                settled.map(|s| (*s).clone())
            }
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        Ok(match state {
            Ok(LifecycleState::Disposed(reason)) => reason.to_error(&self.inner.name),
            _ => DisposeReason::Requested.to_error(&self.inner.name),
        })
    }

    /// Register one more user of this provider.
    #[must_use]
    pub fn acquire_usage(&self) -> UsageToken {
        self.inner.usage.fetch_add(1, Ordering::AcqRel);
        UsageToken {
            counter: Arc::clone(&self.inner.usage),
        }
    }

    /// Number of live [`UsageToken`]s.
    #[must_use]
    pub fn use_count(&self) -> usize {
        self.inner.usage.load(Ordering::Acquire)
    }

    /// Spawn the provider's background work.
    ///
    /// The work is aborted when the provider is disposed. If it returns an
    /// error or panics, the provider is disposed with that failure.
    pub fn spawn_supervised<F>(&self, work: F)
    where
        F: Future<Output = Result<(), ProviderError>> + Send + 'static,
    {
        let cancel = self.cancellation_token();
        let guarded = async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(ProviderError::Cancelled),
                result = work => result,
            }
        };
        let handle = tokio::spawn(guarded);

        let lifecycle = self.clone();
        tokio::spawn(async move {
            let reason = match handle.await {
                Ok(Ok(())) => return,
                Ok(Err(err)) => DisposeReason::from_error(err),
                Err(join_err) => {
                    tracing::error!(provider = %lifecycle.name(), error = %join_err, "Provider task panicked");
                    DisposeReason::Failed(Arc::new(ProviderError::Panicked(join_err.to_string())))
                }
            };
            lifecycle.dispose(reason);
        });
    }
}

/// Keeps a provider alive in its store while held.
#[derive(Debug)]
#[must_use = "dropping the token releases the provider immediately"]
pub struct UsageToken {
    counter: Arc<AtomicUsize>,
}

impl Drop for UsageToken {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn failure() -> ProviderError {
        ProviderError::FeedEnded {
            symbol: "BTCUSDT".to_string(),
        }
    }

    #[test]
    fn starts_loading() {
        let lifecycle = Lifecycle::new("p");
        assert!(matches!(lifecycle.state(), LifecycleState::Loading));
        assert!(!lifecycle.is_ready());
        assert!(!lifecycle.is_disposed());
    }

    #[test]
    fn mark_started_only_once() {
        let lifecycle = Lifecycle::new("p");
        assert!(lifecycle.mark_started());
        assert!(!lifecycle.mark_started());
    }

    #[test]
    fn first_dispose_reason_wins() {
        let lifecycle = Lifecycle::new("p");
        assert!(lifecycle.dispose(DisposeReason::from_error(failure())));
        assert!(!lifecycle.dispose(DisposeReason::Requested));

        match lifecycle.state() {
            LifecycleState::Disposed(DisposeReason::Failed(err)) => {
                assert!(matches!(*err, ProviderError::FeedEnded { .. }));
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn ready_is_not_reachable_after_dispose() {
        let lifecycle = Lifecycle::new("p");
        lifecycle.dispose(DisposeReason::Requested);
        assert!(!lifecycle.set_ready());
        assert!(lifecycle.is_disposed());
    }

    #[test]
    fn dispose_runs_hooks_once_and_cancels() {
        let lifecycle = Lifecycle::new("p");
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        lifecycle.on_dispose(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        lifecycle.dispose(DisposeReason::Requested);
        lifecycle.dispose(DisposeReason::Cancelled);

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(lifecycle.cancellation_token().is_cancelled());
    }

    #[test]
    fn hook_registered_after_dispose_runs_immediately() {
        let lifecycle = Lifecycle::new("p");
        lifecycle.dispose(DisposeReason::Requested);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        lifecycle.on_dispose(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn usage_tokens_count_holders() {
        let lifecycle = Lifecycle::new("p");
        let a = lifecycle.acquire_usage();
        let b = lifecycle.acquire_usage();
        assert_eq!(lifecycle.use_count(), 2);
        drop(a);
        assert_eq!(lifecycle.use_count(), 1);
        drop(b);
        assert_eq!(lifecycle.use_count(), 0);
    }

    #[tokio::test]
    async fn wait_ready_returns_once_ready() {
        let lifecycle = Lifecycle::new("p");
        let signal = lifecycle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            signal.set_ready();
        });

        let cancel = CancellationToken::new();
        tokio::time::timeout(Duration::from_secs(1), lifecycle.wait_ready(&cancel))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn wait_ready_reports_failure() {
        let lifecycle = Lifecycle::new("p");
        lifecycle.dispose(DisposeReason::from_error(failure()));

        let err = lifecycle
            .wait_ready(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Failed { ref name, .. } if name == "p"));
    }

    #[tokio::test]
    async fn wait_ready_honours_caller_cancellation() {
        let lifecycle = Lifecycle::new("p");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = lifecycle.wait_ready(&cancel).await.unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
        assert!(!lifecycle.is_disposed());
    }

    #[tokio::test]
    async fn wait_error_resolves_on_failure() {
        let lifecycle = Lifecycle::new("p");
        lifecycle.set_ready();
        let failing = lifecycle.clone();
        tokio::spawn(async move {
            failing.dispose(DisposeReason::from_error(failure()));
        });

        let err = tokio::time::timeout(
            Duration::from_secs(1),
            lifecycle.wait_error(&CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(matches!(err, ProviderError::Failed { .. }));
    }

    #[tokio::test]
    async fn supervised_error_disposes_provider() {
        let lifecycle = Lifecycle::new("p");
        lifecycle.spawn_supervised(async { Err(failure()) });

        let err = tokio::time::timeout(
            Duration::from_secs(1),
            lifecycle.wait_ready(&CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, ProviderError::Failed { .. }));
    }

    #[tokio::test]
    async fn supervised_panic_disposes_provider() {
        let lifecycle = Lifecycle::new("p");
        lifecycle.spawn_supervised(async { panic!("boom") });

        let err = tokio::time::timeout(
            Duration::from_secs(1),
            lifecycle.wait_error(&CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        match err {
            ProviderError::Failed { source, .. } => {
                assert!(matches!(*source, ProviderError::Panicked(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispose_aborts_supervised_work() {
        let lifecycle = Lifecycle::new("p");
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        lifecycle.spawn_supervised(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        lifecycle.dispose(DisposeReason::Requested);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!finished.load(Ordering::SeqCst));
        assert!(matches!(
            lifecycle.state(),
            LifecycleState::Disposed(DisposeReason::Requested)
        ));
    }
}
