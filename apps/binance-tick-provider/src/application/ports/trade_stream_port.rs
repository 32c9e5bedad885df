//! Trade Stream Port (Driven Port)
//!
//! Interface for subscribing to live aggregate trades.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::domain::market::{AggregateTrade, StreamInfo};

/// Live subscription error.
#[derive(Debug, thiserror::Error)]
pub enum TradeStreamError {
    /// The connection could not be established.
    #[error("failed to connect to {stream}: {message}")]
    Connect {
        /// Stream name.
        stream: String,
        /// Error details.
        message: String,
    },
}

/// An open live subscription.
///
/// Dropping the subscription closes the underlying connection.
#[derive(Debug)]
pub struct TradeSubscription {
    stream: StreamInfo,
    receiver: mpsc::Receiver<AggregateTrade>,
    closer: CancellationToken,
}

impl TradeSubscription {
    /// Wrap a trade channel. `closer` is cancelled when the subscription is
    /// closed or dropped.
    #[must_use]
    pub const fn new(
        stream: StreamInfo,
        receiver: mpsc::Receiver<AggregateTrade>,
        closer: CancellationToken,
    ) -> Self {
        Self {
            stream,
            receiver,
            closer,
        }
    }

    /// Stream this subscription reads.
    #[must_use]
    pub const fn stream(&self) -> &StreamInfo {
        &self.stream
    }

    /// Wait for the next trade. `None` once the feed has ended.
    pub async fn recv(&mut self) -> Option<AggregateTrade> {
        self.receiver.recv().await
    }

    /// Take a trade that is already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<AggregateTrade> {
        match self.receiver.try_recv() {
            Ok(trade) => Some(trade),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Close the connection.
    pub fn close(&self) {
        self.closer.cancel();
    }
}

impl Drop for TradeSubscription {
    fn drop(&mut self) {
        self.closer.cancel();
    }
}

/// Port for live aggregate-trade feeds.
#[async_trait]
pub trait TradeStreamPort: Send + Sync {
    /// Open a subscription to `stream`.
    async fn subscribe(&self, stream: &StreamInfo) -> Result<TradeSubscription, TradeStreamError>;
}
