//! Provider errors and disposal reasons.

use std::error::Error as StdError;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Boxed upstream failure carried inside [`ProviderError`].
pub type UpstreamSource = Arc<dyn StdError + Send + Sync + 'static>;

/// Errors produced while building, loading or reading tick providers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// A provider was constructed with a window it cannot serve.
    #[error("invalid provider window: {0}")]
    InvalidWindow(String),

    /// A tick provider request was rejected up front.
    #[error("invalid tick provider request: {0}")]
    InvalidRequest(String),

    /// An exchange or storage collaborator failed.
    #[error("{context}")]
    Upstream {
        /// What was being attempted.
        context: String,
        /// Underlying failure.
        #[source]
        source: UpstreamSource,
    },

    /// The exchange reported no trades for an hour that has elapsed.
    #[error("there were no trades for {symbol} in the hour starting {hour}")]
    EmptyHour {
        /// Instrument symbol.
        symbol: String,
        /// Start of the empty hour.
        hour: DateTime<Utc>,
    },

    /// Adjacent providers do not join on consecutive trade ids.
    #[error(
        "tick ids are not contiguous: '{earlier}' ends at {last_tick_id} but '{later}' starts at {first_tick_id}"
    )]
    Contiguity {
        /// Name of the earlier provider.
        earlier: String,
        /// Name of the later provider.
        later: String,
        /// Last trade id of the earlier provider.
        last_tick_id: i64,
        /// First trade id of the later provider.
        first_tick_id: i64,
    },

    /// A ready provider did not report the trade ids needed to join it.
    #[error("provider '{name}' has no {boundary} tick id")]
    MissingTickId {
        /// Provider name.
        name: String,
        /// "first" or "last".
        boundary: &'static str,
    },

    /// The live feed skipped trade ids.
    #[error("live feed for {symbol} skipped trade ids: expected {expected}, received {received}")]
    FeedGap {
        /// Instrument symbol.
        symbol: String,
        /// Trade id that should have come next.
        expected: i64,
        /// Trade id that actually arrived.
        received: i64,
    },

    /// The live feed closed.
    #[error("live feed for {symbol} ended")]
    FeedEnded {
        /// Instrument symbol.
        symbol: String,
    },

    /// Readers were requested before the provider became ready.
    #[error("provider '{name}' is not ready")]
    NotReady {
        /// Provider name.
        name: String,
    },

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A provider was cancelled before it finished loading.
    #[error("provider '{name}' was cancelled")]
    ProviderCancelled {
        /// Provider name.
        name: String,
    },

    /// A provider was disposed on request.
    #[error("provider '{name}' was disposed")]
    Disposed {
        /// Provider name.
        name: String,
    },

    /// A provider failed; the cause is the source.
    #[error("provider '{name}' failed")]
    Failed {
        /// Provider name.
        name: String,
        /// Why it failed.
        #[source]
        source: Arc<Self>,
    },

    /// A background task panicked.
    #[error("background task panicked: {0}")]
    Panicked(String),
}

impl ProviderError {
    /// Wrap a collaborator failure with context.
    pub fn upstream<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Upstream {
            context: context.into(),
            source: Arc::new(source),
        }
    }
}

/// Why a provider was disposed.
#[derive(Debug, Clone)]
pub enum DisposeReason {
    /// Its owner released it.
    Requested,
    /// Loading was cancelled.
    Cancelled,
    /// It failed.
    Failed(Arc<ProviderError>),
}

impl DisposeReason {
    /// Classify the outcome of a failed background task.
    #[must_use]
    pub fn from_error(err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled => Self::Cancelled,
            other => Self::Failed(Arc::new(other)),
        }
    }

    /// True for [`DisposeReason::Failed`].
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// The error a waiter on the named provider should observe.
    #[must_use]
    pub fn to_error(&self, name: &str) -> ProviderError {
        match self {
            Self::Requested => ProviderError::Disposed {
                name: name.to_string(),
            },
            Self::Cancelled => ProviderError::ProviderCancelled {
                name: name.to_string(),
            },
            Self::Failed(source) => ProviderError::Failed {
                name: name.to_string(),
                source: Arc::clone(source),
            },
        }
    }
}

/// Render an error and all of its sources as `outer: inner: root`.
#[must_use]
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(rendered, ": {cause}");
        source = cause.source();
    }
    rendered
}
