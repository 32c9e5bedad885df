//! Tick Providers
//!
//! A tick provider serves the ticks of one instrument over a time window.
//! Concrete providers (hourly history, live feed, composite) live in the
//! application layer; this module defines the contract they share, their
//! lifecycle and the store that deduplicates them.

/// Provider errors and disposal reasons.
pub mod error;

/// Lifecycle state machine and usage tokens.
pub mod lifecycle;

/// Keyed, reference-counted provider cache.
pub mod store;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::market::Instrument;
use crate::domain::tick_stream::TickReader;
use crate::domain::time::{floor_to_hour, one_hour};
use error::{DisposeReason, ProviderError, error_chain};
use lifecycle::{Lifecycle, LifecycleState};

// =============================================================================
// Windows
// =============================================================================

/// Instrument and time window a provider covers.
///
/// `until` is exclusive. `None` means the window is open-ended and follows
/// the live feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderInfo {
    /// Instrument served.
    pub instrument: Instrument,
    /// Inclusive start.
    pub from: DateTime<Utc>,
    /// Exclusive end, or `None` for open-ended.
    pub until: Option<DateTime<Utc>>,
}

/// A caller's request for ticks; same shape as [`ProviderInfo`].
pub type ProviderRequest = ProviderInfo;

impl ProviderInfo {
    /// A closed window `[from, until)`.
    #[must_use]
    pub const fn new(instrument: Instrument, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            instrument,
            from,
            until: Some(until),
        }
    }

    /// An open-ended window starting at `from`.
    #[must_use]
    pub const fn open(instrument: Instrument, from: DateTime<Utc>) -> Self {
        Self {
            instrument,
            from,
            until: None,
        }
    }

    /// The one-hour window starting at `hour`.
    #[must_use]
    pub fn hour(instrument: Instrument, hour: DateTime<Utc>) -> Self {
        Self::new(instrument, hour, hour + one_hour())
    }

    /// True when the window has no end.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.until.is_none()
    }

    /// Reject windows that can never be served at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidRequest`] when `from` is after `now`,
    /// `until` comes before `from`, or `until` reaches past the start of the
    /// current hour. `from == until` is an empty window and is accepted.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ProviderError> {
        if self.from > now {
            return Err(ProviderError::InvalidRequest(format!(
                "{} starts at {} which is after {now}",
                self.instrument, self.from
            )));
        }
        let Some(until) = self.until else {
            return Ok(());
        };
        if until < self.from {
            return Err(ProviderError::InvalidRequest(format!(
                "{} window ends at {until}, before its start {}",
                self.instrument, self.from
            )));
        }
        let current_hour = floor_to_hour(now);
        if until > current_hour {
            return Err(ProviderError::InvalidRequest(format!(
                "{} window ends at {until}, past the current hour {current_hour}",
                self.instrument
            )));
        }
        Ok(())
    }

    /// True for a closed window with `from == until`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.until == Some(self.from)
    }
}

/// First and last trade id held by a loaded provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickIdRange {
    /// First trade id.
    pub first: i64,
    /// Last trade id.
    pub last: i64,
}

// =============================================================================
// Status
// =============================================================================

/// Coarse state reported in status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    /// Still loading.
    Loading,
    /// Serving readers.
    Ready,
    /// Disposed after a failure.
    Error,
    /// Disposed on request or cancellation.
    Disposed,
}

/// Point-in-time view of a provider for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderStatus {
    /// Provider name.
    pub name: String,
    /// Coarse state.
    pub state: StatusState,
    /// One-line description; the full error chain on failure.
    pub summary: String,
    /// Completed units of work.
    pub completed: usize,
    /// Total units of work.
    pub total: usize,
}

impl ProviderStatus {
    /// Build a status from a lifecycle and a progress count.
    #[must_use]
    pub fn from_lifecycle(lifecycle: &Lifecycle, completed: usize, total: usize) -> Self {
        let (state, summary) = match lifecycle.state() {
            LifecycleState::Loading => (StatusState::Loading, "loading".to_string()),
            LifecycleState::Ready => (StatusState::Ready, "ready".to_string()),
            LifecycleState::Disposed(DisposeReason::Failed(err)) => {
                (StatusState::Error, error_chain(err.as_ref()))
            }
            LifecycleState::Disposed(DisposeReason::Cancelled) => {
                (StatusState::Disposed, "cancelled".to_string())
            }
            LifecycleState::Disposed(DisposeReason::Requested) => {
                (StatusState::Disposed, "disposed".to_string())
            }
        };
        Self {
            name: lifecycle.name().to_string(),
            state,
            summary,
            completed,
            total,
        }
    }
}

// =============================================================================
// Provider Contract
// =============================================================================

/// A source of ticks over a window.
pub trait TickProvider: Send + Sync {
    /// Instrument and window served.
    fn info(&self) -> &ProviderInfo;

    /// Lifecycle handle.
    fn lifecycle(&self) -> &Lifecycle;

    /// Begin loading. Calling more than once has no further effect.
    fn start(&self);

    /// First trade id written, once known.
    fn first_tick_id(&self) -> Option<i64>;

    /// Last trade id written, once the provider is complete.
    fn last_tick_id(&self) -> Option<i64>;

    /// Open a reader over the provider's ticks.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NotReady`] before the provider is ready.
    fn create_reader(&self) -> Result<TickReader, ProviderError>;

    /// Human-readable name.
    fn name(&self) -> &str {
        self.lifecycle().name()
    }

    /// Status snapshot.
    fn status(&self) -> ProviderStatus {
        let done = usize::from(self.lifecycle().is_ready());
        ProviderStatus::from_lifecycle(self.lifecycle(), done, 1)
    }
}

/// Display name of a provider: `<kind> '<SYMBOL>' from yyyy-MM-dd HH:mm`.
#[must_use]
pub fn provider_name(kind: &str, info: &ProviderInfo) -> String {
    format!(
        "{kind} '{}' from {}",
        info.instrument,
        info.from.format("%Y-%m-%d %H:%M")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use test_case::test_case;

    fn btc() -> Instrument {
        Instrument::new("BTCUSDT", Decimal::new(1, 2))
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    #[test]
    fn hour_window_spans_one_hour() {
        let info = ProviderInfo::hour(btc(), at(10, 0));
        assert_eq!(info.until, Some(at(11, 0)));
        assert!(!info.is_open());
    }

    #[test_case(ProviderInfo::open(btc(), at(12, 0)) ; "open request in a future hour")]
    #[test_case(ProviderInfo::open(btc(), at(11, 45)) ; "open request later in the current hour")]
    #[test_case(ProviderInfo::new(btc(), at(9, 0), at(13, 0)) ; "until past the current hour")]
    #[test_case(ProviderInfo::new(btc(), at(9, 0), at(11, 15)) ; "until inside the current hour")]
    #[test_case(ProviderInfo::new(btc(), at(10, 0), at(10, 0) - TimeDelta::minutes(1)) ; "until before from")]
    fn unservable_requests_are_rejected(request: ProviderRequest) {
        assert!(matches!(
            request.validate(at(11, 30)),
            Err(ProviderError::InvalidRequest(_))
        ));
    }

    #[test_case(ProviderInfo::open(btc(), at(11, 30)) ; "open request starting now")]
    #[test_case(ProviderInfo::open(btc(), at(11, 10)) ; "open request earlier in the current hour")]
    #[test_case(ProviderInfo::new(btc(), at(9, 0), at(11, 0)) ; "until at the current hour")]
    #[test_case(ProviderInfo::new(btc(), at(10, 20), at(10, 20)) ; "empty window")]
    fn servable_requests_are_accepted(request: ProviderRequest) {
        assert!(request.validate(at(11, 30)).is_ok());
    }

    #[test]
    fn only_equal_bounds_make_an_empty_window() {
        assert!(ProviderInfo::new(btc(), at(10, 0), at(10, 0)).is_empty());
        assert!(!ProviderInfo::hour(btc(), at(10, 0)).is_empty());
        assert!(!ProviderInfo::open(btc(), at(10, 0)).is_empty());
    }

    #[test]
    fn provider_name_formats_minutes() {
        let info = ProviderInfo::hour(btc(), at(9, 0));
        assert_eq!(
            provider_name("HourProvider", &info),
            "HourProvider 'BTCUSDT' from 2024-05-01 09:00"
        );
    }

    #[test]
    fn failed_status_reports_error_chain() {
        let lifecycle = Lifecycle::new("HourProvider 'BTCUSDT'");
        lifecycle.dispose(DisposeReason::Failed(Arc::new(ProviderError::EmptyHour {
            symbol: "BTCUSDT".to_string(),
            hour: at(3, 0),
        })));

        let status = ProviderStatus::from_lifecycle(&lifecycle, 0, 1);
        assert_eq!(status.state, StatusState::Error);
        assert!(status.summary.contains("no trades for BTCUSDT"));
    }
}
