//! Append-only tick streams and cursor-based readers.
//!
//! A [`TickStream`] is written by exactly one producer and read by any
//! number of [`TickReader`]s. Readers observe a prefix of the stream at all
//! times and can wait for more ticks until the stream is sealed. Several
//! readers can be concatenated into one that drains each segment in order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::domain::market::Tick;

/// Returned when appending to a sealed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("tick stream is sealed")]
pub struct StreamSealed;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Progress {
    len: usize,
    sealed: bool,
}

#[derive(Debug, Default)]
struct Buffer {
    ticks: Vec<Tick>,
    sealed: bool,
}

/// Single-writer, many-reader tick buffer.
#[derive(Debug)]
pub struct TickStream {
    buffer: RwLock<Buffer>,
    progress: watch::Sender<Progress>,
}

impl Default for TickStream {
    fn default() -> Self {
        Self::new()
    }
}

impl TickStream {
    /// Create an empty, open stream.
    #[must_use]
    pub fn new() -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            buffer: RwLock::new(Buffer::default()),
            progress,
        }
    }

    /// Create a sealed stream holding `ticks`.
    #[must_use]
    pub fn sealed(ticks: Vec<Tick>) -> Self {
        let progress = Progress {
            len: ticks.len(),
            sealed: true,
        };
        let (progress, _) = watch::channel(progress);
        Self {
            buffer: RwLock::new(Buffer {
                ticks,
                sealed: true,
            }),
            progress,
        }
    }

    /// Append one tick and wake waiting readers.
    ///
    /// # Errors
    ///
    /// Returns [`StreamSealed`] once the stream has been sealed.
    pub fn push(&self, tick: Tick) -> Result<(), StreamSealed> {
        self.extend(std::iter::once(tick))
    }

    /// Append a batch of ticks with a single wake-up.
    ///
    /// # Errors
    ///
    /// Returns [`StreamSealed`] once the stream has been sealed.
    pub fn extend(&self, ticks: impl IntoIterator<Item = Tick>) -> Result<(), StreamSealed> {
        let mut buffer = self.buffer.write();
        if buffer.sealed {
            return Err(StreamSealed);
        }
        buffer.ticks.extend(ticks);
        let len = buffer.ticks.len();
        self.progress.send_modify(|p| p.len = len);
        Ok(())
    }

    /// Mark the stream complete. Returns false if it was already sealed.
    pub fn seal(&self) -> bool {
        let mut buffer = self.buffer.write();
        if buffer.sealed {
            return false;
        }
        buffer.sealed = true;
        self.progress.send_modify(|p| p.sealed = true);
        true
    }

    /// Number of ticks written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.read().ticks.len()
    }

    /// True when nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once no more ticks will be appended.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.buffer.read().sealed
    }

    /// Copy of everything written so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Tick> {
        self.buffer.read().ticks.clone()
    }

    /// Serialize the current contents as `MessagePack`.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(&self.buffer.read().ticks)
    }

    /// Decode a `MessagePack` payload produced by [`Self::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a tick sequence.
    pub fn decode(bytes: &[u8]) -> Result<Vec<Tick>, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }

    /// Open a reader positioned at the first tick.
    #[must_use]
    pub fn reader(self: &Arc<Self>) -> TickReader {
        TickReader {
            segments: vec![Cursor {
                stream: Arc::clone(self),
                position: 0,
                progress: self.progress.subscribe(),
            }],
            current: 0,
            not_before: None,
        }
    }
}

// =============================================================================
// Readers
// =============================================================================

#[derive(Debug)]
struct Cursor {
    stream: Arc<TickStream>,
    position: usize,
    progress: watch::Receiver<Progress>,
}

impl Cursor {
    fn peek(&self) -> Option<Tick> {
        self.stream.buffer.read().ticks.get(self.position).copied()
    }

    fn is_finished(&self) -> bool {
        let buffer = self.stream.buffer.read();
        buffer.sealed && self.position >= buffer.ticks.len()
    }

    async fn wait(&mut self) {
        let position = self.position;
        // The sender lives inside the stream we hold, so this cannot close.
        let _ = self
            .progress
            .wait_for(|p| p.len > position || p.sealed)
            .await;
    }
}

/// Forward-only cursor over one or more tick streams.
#[derive(Debug)]
pub struct TickReader {
    segments: Vec<Cursor>,
    current: usize,
    not_before: Option<DateTime<Utc>>,
}

impl TickReader {
    /// A reader over nothing; it is finished immediately.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            segments: Vec::new(),
            current: 0,
            not_before: None,
        }
    }

    /// Chain readers so each is drained before the next is touched.
    ///
    /// A segment is left only after its stream is sealed and fully read, so
    /// an open segment in the middle blocks everything behind it. Only the
    /// first reader's floor is kept.
    #[must_use]
    pub fn concat(readers: impl IntoIterator<Item = Self>) -> Self {
        let mut not_before = None;
        let segments = readers
            .into_iter()
            .enumerate()
            .flat_map(|(i, mut reader)| {
                if i == 0 {
                    not_before = reader.not_before;
                }
                reader.segments.split_off(reader.current)
            })
            .collect();
        Self {
            segments,
            current: 0,
            not_before,
        }
    }

    /// Next tick without consuming it, if one is available now.
    ///
    /// Ticks stamped before the [`skip_before`](Self::skip_before) floor are
    /// consumed and dropped here until the first tick at or after it shows up.
    pub fn peek(&mut self) -> Option<Tick> {
        loop {
            let tick = self.peek_segment()?;
            match self.not_before {
                Some(floor) if tick.timestamp < floor => {
                    self.segments[self.current].position += 1;
                }
                Some(_) => {
                    self.not_before = None;
                    return Some(tick);
                }
                None => return Some(tick),
            }
        }
    }

    fn peek_segment(&mut self) -> Option<Tick> {
        loop {
            let segment = self.segments.get(self.current)?;
            if let Some(tick) = segment.peek() {
                return Some(tick);
            }
            if segment.is_finished() && self.current + 1 < self.segments.len() {
                self.current += 1;
            } else {
                return None;
            }
        }
    }

    /// Consume the next tick if one is available now.
    pub fn read_next(&mut self) -> Option<Tick> {
        let tick = self.peek()?;
        self.segments[self.current].position += 1;
        Some(tick)
    }

    /// Drain everything currently available without waiting.
    pub fn read_available(&mut self) -> Vec<Tick> {
        std::iter::from_fn(|| self.read_next()).collect()
    }

    /// Wait for the next tick. Returns `None` once every segment is sealed
    /// and drained.
    pub async fn next(&mut self) -> Option<Tick> {
        loop {
            if let Some(tick) = self.read_next() {
                return Some(tick);
            }
            let segment = self.segments.get_mut(self.current)?;
            if segment.is_finished() {
                return None;
            }
            segment.wait().await;
        }
    }

    /// Never yield a tick stamped before `from`.
    ///
    /// Ticks already available are dropped now and counted. Until a tick at
    /// or after `from` is seen, ticks that arrive later are dropped as well.
    pub fn skip_before(&mut self, from: DateTime<Utc>) -> usize {
        let mut skipped = 0;
        while let Some(tick) = self.peek_segment() {
            if tick.timestamp >= from {
                return skipped;
            }
            self.segments[self.current].position += 1;
            skipped += 1;
        }
        self.not_before = Some(from);
        skipped
    }

    /// True once every remaining segment is sealed and drained.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.segments
            .get(self.current..)
            .is_none_or(|rest| rest.iter().all(Cursor::is_finished))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn tick(ms: i64) -> Tick {
        Tick {
            price: Decimal::new(ms, 0),
            bid: Decimal::new(ms, 0),
            ask: Decimal::new(ms + 1, 0),
            volume: Decimal::ONE,
            timestamp: DateTime::from_timestamp_millis(ms).unwrap(),
        }
    }

    fn times(ticks: &[Tick]) -> Vec<i64> {
        ticks.iter().map(|t| t.timestamp.timestamp_millis()).collect()
    }

    #[test]
    fn push_after_seal_is_rejected() {
        let stream = TickStream::new();
        stream.push(tick(1)).unwrap();
        assert!(stream.seal());
        assert!(!stream.seal());
        assert_eq!(stream.push(tick(2)), Err(StreamSealed));
        assert_eq!(stream.len(), 1);
    }

    #[test]
    fn reader_sees_prefix_then_growth() {
        let stream = Arc::new(TickStream::new());
        stream.extend([tick(1), tick(2)]).unwrap();

        let mut reader = stream.reader();
        assert_eq!(times(&reader.read_available()), vec![1, 2]);
        assert!(reader.read_next().is_none());
        assert!(!reader.is_finished());

        stream.push(tick(3)).unwrap();
        assert_eq!(reader.read_next(), Some(tick(3)));

        stream.seal();
        assert!(reader.is_finished());
    }

    #[test]
    fn concat_drains_segments_in_order() {
        let a = Arc::new(TickStream::sealed(vec![tick(1), tick(2)]));
        let b = Arc::new(TickStream::sealed(vec![tick(3)]));
        let c = Arc::new(TickStream::new());
        c.push(tick(4)).unwrap();

        let mut reader = TickReader::concat([a.reader(), b.reader(), c.reader()]);
        assert_eq!(times(&reader.read_available()), vec![1, 2, 3, 4]);
        assert!(!reader.is_finished());
    }

    #[test]
    fn open_segment_blocks_later_segments() {
        let open = Arc::new(TickStream::new());
        open.push(tick(1)).unwrap();
        let later = Arc::new(TickStream::sealed(vec![tick(5)]));

        let mut reader = TickReader::concat([open.reader(), later.reader()]);
        assert_eq!(times(&reader.read_available()), vec![1]);

        open.seal();
        assert_eq!(times(&reader.read_available()), vec![5]);
        assert!(reader.is_finished());
    }

    #[test]
    fn skip_before_crosses_segments() {
        let a = Arc::new(TickStream::sealed(vec![tick(10), tick(20)]));
        let b = Arc::new(TickStream::sealed(vec![tick(30), tick(40)]));
        let mut reader = TickReader::concat([a.reader(), b.reader()]);

        let skipped = reader.skip_before(DateTime::from_timestamp_millis(30).unwrap());
        assert_eq!(skipped, 2);
        assert_eq!(reader.read_next(), Some(tick(30)));
    }

    #[test]
    fn skip_before_keeps_exact_match() {
        let stream = Arc::new(TickStream::sealed(vec![tick(10), tick(20)]));
        let mut reader = stream.reader();
        assert_eq!(reader.skip_before(DateTime::from_timestamp_millis(10).unwrap()), 0);
        assert_eq!(reader.read_next(), Some(tick(10)));
    }

    #[test]
    fn late_ticks_before_the_floor_are_dropped() {
        let stream = Arc::new(TickStream::new());
        stream.push(tick(10)).unwrap();
        let mut reader = stream.reader();

        assert_eq!(reader.skip_before(DateTime::from_timestamp_millis(30).unwrap()), 1);
        assert!(reader.read_next().is_none());

        stream.extend([tick(20), tick(30), tick(25)]).unwrap();
        assert_eq!(times(&reader.read_available()), vec![30, 25]);
    }

    #[tokio::test]
    async fn next_waits_past_late_ticks_before_the_floor() {
        let stream = Arc::new(TickStream::new());
        let mut reader = stream.reader();
        reader.skip_before(DateTime::from_timestamp_millis(50).unwrap());

        let writer = Arc::clone(&stream);
        tokio::spawn(async move {
            writer.push(tick(40)).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.push(tick(60)).unwrap();
        });

        let first = tokio::time::timeout(Duration::from_secs(1), reader.next())
            .await
            .unwrap();
        assert_eq!(first, Some(tick(60)));
    }

    #[test]
    fn empty_reader_is_finished() {
        let mut reader = TickReader::empty();
        assert!(reader.is_finished());
        assert!(reader.read_next().is_none());
    }

    #[test]
    fn bytes_round_trip_through_messagepack() {
        let stream = TickStream::sealed(vec![tick(1_700_000_000_001), tick(1_700_000_000_002)]);
        let bytes = stream.to_bytes().unwrap();
        assert_eq!(TickStream::decode(&bytes).unwrap(), stream.snapshot());
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(TickStream::decode(&[0xc1, 0x00, 0x13]).is_err());
    }

    #[tokio::test]
    async fn next_waits_for_writer() {
        let stream = Arc::new(TickStream::new());
        let mut reader = stream.reader();

        let writer = Arc::clone(&stream);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.push(tick(7)).unwrap();
            writer.seal();
        });

        let first = tokio::time::timeout(Duration::from_secs(1), reader.next())
            .await
            .unwrap();
        assert_eq!(first, Some(tick(7)));
        let end = tokio::time::timeout(Duration::from_secs(1), reader.next())
            .await
            .unwrap();
        assert_eq!(end, None);
    }
}
