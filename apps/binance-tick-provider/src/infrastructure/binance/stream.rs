//! Binance Trade Stream Client
//!
//! Implements [`TradeStreamPort`] with one websocket connection per
//! subscription. The connection is never re-established: a dropped socket
//! ends the subscription and the owner decides what to do next.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::messages::AggTradeMessage;
use crate::application::ports::{TradeStreamError, TradeStreamPort, TradeSubscription};
use crate::domain::market::{AggregateTrade, StreamInfo};
use crate::infrastructure::config::BinanceSettings;

/// Buffered trades per subscription before the reader applies backpressure.
const CHANNEL_CAPACITY: usize = 4096;

/// Websocket client for live aggregate trades.
#[derive(Debug, Clone)]
pub struct BinanceStreamClient {
    base_url: String,
}

impl BinanceStreamClient {
    /// Create a client from settings.
    #[must_use]
    pub fn new(settings: &BinanceSettings) -> Self {
        Self {
            base_url: settings.stream_url.trim_end_matches('/').to_string(),
        }
    }

    /// Full URL of a stream.
    #[must_use]
    pub fn stream_url(&self, stream: &StreamInfo) -> String {
        format!("{}/{}", self.base_url, stream.name())
    }
}

#[async_trait]
impl TradeStreamPort for BinanceStreamClient {
    async fn subscribe(&self, stream: &StreamInfo) -> Result<TradeSubscription, TradeStreamError> {
        let url = self.stream_url(stream);
        tracing::info!(%url, "Connecting to trade stream");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| TradeStreamError::Connect {
                stream: stream.name().to_string(),
                message: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let closer = CancellationToken::new();
        tokio::spawn(pump(ws_stream, tx, closer.clone(), stream.name().to_string()));

        Ok(TradeSubscription::new(stream.clone(), rx, closer))
    }
}

/// Forward decoded trades until the socket ends or the subscription closes.
async fn pump<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    tx: mpsc::Sender<AggregateTrade>,
    closer: CancellationToken,
    stream: String,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            () = closer.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                tracing::debug!(%stream, "Trade stream closed by subscriber");
                return;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Some(trade) = decode_trade(&text) else {
                            continue;
                        };
                        if tx.send(trade).await.is_err() {
                            tracing::debug!(%stream, "Subscriber gone");
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            tracing::warn!(%stream, error = %e, "Failed to answer ping");
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(%stream, ?frame, "Server sent close frame");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(%stream, error = %e, "Trade stream error");
                        return;
                    }
                    None => {
                        tracing::info!(%stream, "Trade stream ended");
                        return;
                    }
                }
            }
        }
    }
}

/// Decode one text frame. Frames that are not aggregate trades are skipped.
fn decode_trade(text: &str) -> Option<AggregateTrade> {
    let msg = match serde_json::from_str::<AggTradeMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(error = %e, len = text.len(), "Ignoring non-trade frame");
            return None;
        }
    };
    if msg.event_type.as_deref().is_some_and(|e| e != "aggTrade") {
        return None;
    }
    match AggregateTrade::try_from(msg) {
        Ok(trade) => Some(trade),
        Err(e) => {
            tracing::warn!(error = %e, "Dropping malformed trade");
            None
        }
    }
}
