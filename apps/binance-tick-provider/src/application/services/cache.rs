//! Hour Cache
//!
//! Persists completed hours as two files under
//! `binance_historical_trades/<SYMBOL>/<increment>/<yyyyMMddHHmm>`:
//!
//! - `.meta`: 16 bytes, first then last trade id, little-endian `i64`
//! - `.ticks`: the hour's ticks as `MessagePack`
//!
//! Bid and ask depend on the price increment, so instruments sharing a
//! symbol but not an increment never share files.
//!
//! Reads never fail: anything missing, truncated or undecodable is a miss
//! and the hour is fetched again.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::application::ports::{FileStoreError, FileStorePort};
use crate::domain::market::{Instrument, Tick};
use crate::domain::provider::TickIdRange;
use crate::domain::tick_stream::TickStream;

const ROOT_DIR: &str = "binance_historical_trades";
const META_LEN: usize = 16;

/// A cached hour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedHour {
    /// First and last trade id.
    pub ids: TickIdRange,
    /// Ticks in trade-id order.
    pub ticks: Vec<Tick>,
}

/// Relative paths of one hour's cache files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    /// Metadata file.
    pub meta: String,
    /// Tick payload file.
    pub ticks: String,
}

impl CachePaths {
    /// Paths for `instrument` at `hour`.
    #[must_use]
    pub fn for_hour(instrument: &Instrument, hour: DateTime<Utc>) -> Self {
        let stem = format!(
            "{ROOT_DIR}/{}/{}/{}",
            instrument.symbol,
            instrument.min_price_increment.normalize(),
            hour.format("%Y%m%d%H%M")
        );
        Self {
            meta: format!("{stem}.meta"),
            ticks: format!("{stem}.ticks"),
        }
    }
}

/// Cache read or write failure.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Underlying storage failed.
    #[error(transparent)]
    Store(#[from] FileStoreError),

    /// The metadata file is malformed.
    #[error("invalid cache metadata: {0}")]
    Metadata(String),

    /// The tick payload is malformed.
    #[error("invalid cache payload: {0}")]
    Payload(String),
}

/// Encode a trade-id range as cache metadata.
#[must_use]
pub fn encode_metadata(ids: TickIdRange) -> [u8; META_LEN] {
    let mut bytes = [0_u8; META_LEN];
    bytes[..8].copy_from_slice(&ids.first.to_le_bytes());
    bytes[8..].copy_from_slice(&ids.last.to_le_bytes());
    bytes
}

/// Decode cache metadata.
///
/// # Errors
///
/// Returns [`CacheError::Metadata`] unless the input is exactly 16 bytes
/// holding non-negative ids with `last >= first`.
pub fn decode_metadata(bytes: &[u8]) -> Result<TickIdRange, CacheError> {
    let bytes: &[u8; META_LEN] = bytes
        .try_into()
        .map_err(|_| CacheError::Metadata(format!("expected {META_LEN} bytes, got {}", bytes.len())))?;

    let mut first = [0_u8; 8];
    let mut last = [0_u8; 8];
    first.copy_from_slice(&bytes[..8]);
    last.copy_from_slice(&bytes[8..]);
    let ids = TickIdRange {
        first: i64::from_le_bytes(first),
        last: i64::from_le_bytes(last),
    };

    if ids.first < 0 || ids.last < ids.first {
        return Err(CacheError::Metadata(format!(
            "ids {}..{} out of order",
            ids.first, ids.last
        )));
    }
    Ok(ids)
}

/// Reads and writes cached hours through a [`FileStorePort`].
#[derive(Clone)]
pub struct HourCache {
    files: Arc<dyn FileStorePort>,
}

impl std::fmt::Debug for HourCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HourCache").finish_non_exhaustive()
    }
}

impl HourCache {
    /// Create a cache over `files`.
    #[must_use]
    pub fn new(files: Arc<dyn FileStorePort>) -> Self {
        Self { files }
    }

    /// Load a cached hour, or `None` on any miss.
    pub async fn read(&self, instrument: &Instrument, hour: DateTime<Utc>) -> Option<CachedHour> {
        let paths = CachePaths::for_hour(instrument, hour);
        match self.try_read(&paths).await {
            Ok(Some(cached)) => Some(cached),
            Ok(None) => {
                tracing::debug!(path = %paths.meta, "Hour cache miss");
                None
            }
            Err(e) => {
                tracing::debug!(path = %paths.meta, error = %e, "Ignoring unusable hour cache");
                None
            }
        }
    }

    async fn try_read(&self, paths: &CachePaths) -> Result<Option<CachedHour>, CacheError> {
        let Some(meta) = self.files.read_bytes(&paths.meta).await? else {
            return Ok(None);
        };
        let ids = decode_metadata(&meta)?;

        let Some(payload) = self.files.read_bytes(&paths.ticks).await? else {
            return Ok(None);
        };
        let ticks = TickStream::decode(&payload).map_err(|e| CacheError::Payload(e.to_string()))?;
        if ticks.is_empty() {
            return Err(CacheError::Payload("no ticks".to_string()));
        }

        Ok(Some(CachedHour { ids, ticks }))
    }

    /// Persist a completed hour. The payload is written before the metadata
    /// so a present `.meta` always has its `.ticks` beside it.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or either write fails.
    pub async fn write(
        &self,
        instrument: &Instrument,
        hour: DateTime<Utc>,
        ids: TickIdRange,
        stream: &TickStream,
    ) -> Result<(), CacheError> {
        let paths = CachePaths::for_hour(instrument, hour);
        let payload = stream
            .to_bytes()
            .map_err(|e| CacheError::Payload(e.to_string()))?;

        self.files.write_bytes(&paths.ticks, &payload).await?;
        self.files
            .write_bytes(&paths.meta, &encode_metadata(ids))
            .await?;

        tracing::debug!(path = %paths.ticks, bytes = payload.len(), "Hour cached");
        Ok(())
    }
}
