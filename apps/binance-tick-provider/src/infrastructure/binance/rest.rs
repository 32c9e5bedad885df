//! Binance REST Client
//!
//! Implements [`HistoricalTradesPort`] over `GET /api/v3/aggTrades`. The
//! first page is selected by time range; later pages continue by trade id
//! until a page comes back short or passes the end of the range.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};

use super::backoff::{RetryConfig, RetryPolicy};
use super::messages::{AggTradeMessage, ApiErrorBody};
use crate::application::ports::{HistoricalTradesError, HistoricalTradesPort};
use crate::domain::market::AggregateTrade;
use crate::domain::time::one_hour;
use crate::infrastructure::config::{BinanceSettings, Credentials, RestSettings};
use crate::infrastructure::metrics;

const AGG_TRADES_PATH: &str = "/api/v3/aggTrades";
const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const USED_WEIGHT_HEADER: &str = "x-mbx-used-weight-1m";

/// REST client for aggregate trade history.
#[derive(Debug, Clone)]
pub struct BinanceRestClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    retry: RetryConfig,
    page_limit: u16,
}

impl BinanceRestClient {
    /// Create a client from settings.
    ///
    /// # Errors
    ///
    /// Returns [`HistoricalTradesError::Network`] if the HTTP client cannot
    /// be built.
    pub fn new(binance: &BinanceSettings, rest: &RestSettings) -> Result<Self, HistoricalTradesError> {
        let client = Client::builder()
            .timeout(rest.request_timeout)
            .build()
            .map_err(|e| HistoricalTradesError::Network {
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: binance.rest_url.trim_end_matches('/').to_string(),
            credentials: binance.credentials.clone(),
            retry: RetryConfig::from_rest_settings(rest),
            page_limit: rest.page_limit,
        })
    }

    /// Fetch one page, retrying transient failures.
    async fn fetch_page(
        &self,
        query: &[(&str, String)],
    ) -> Result<Vec<AggTradeMessage>, HistoricalTradesError> {
        let url = format!("{}{AGG_TRADES_PATH}", self.base_url);
        let mut policy = RetryPolicy::new(self.retry.clone());

        loop {
            let mut request = self.client.get(&url).query(query);
            if let Some(credentials) = &self.credentials {
                request = request.header(API_KEY_HEADER, credentials.api_key());
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    if let Some(delay) = policy.next_delay(None) {
                        tracing::warn!(error = %e, delay_ms = delay.as_millis(), retry = policy.retries(), "Network error, retrying");
                        metrics::record_history_retry("network");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(HistoricalTradesError::RetriesExhausted {
                        attempts: policy.retries() + 1,
                        last_error: e.to_string(),
                    });
                }
            };

            if let Some(weight) = header_f64(&response, USED_WEIGHT_HEADER) {
                metrics::set_rest_used_weight(weight);
            }

            let status = response.status();
            if status.is_success() {
                let text = response
                    .text()
                    .await
                    .map_err(|e| HistoricalTradesError::Network {
                        message: e.to_string(),
                    })?;
                return serde_json::from_str(&text).map_err(|e| HistoricalTradesError::Decode {
                    message: e.to_string(),
                });
            }

            let retry_after = header_f64(&response, "Retry-After")
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64);
            let body = response.text().await.unwrap_or_default();
            let error = api_error(status, &body);

            let delay = match categorize_status(status) {
                ErrorCategory::RateLimited => policy.next_delay(retry_after),
                ErrorCategory::Retryable => policy.next_delay(None),
                ErrorCategory::NonRetryable => return Err(error),
            };
            let Some(delay) = delay else {
                return Err(HistoricalTradesError::RetriesExhausted {
                    attempts: policy.retries() + 1,
                    last_error: error.to_string(),
                });
            };

            tracing::warn!(status = status.as_u16(), error = %error, delay_ms = delay.as_millis(), "Exchange error, retrying");
            metrics::record_history_retry(if status == StatusCode::TOO_MANY_REQUESTS {
                "rate_limited"
            } else {
                "server_error"
            });
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl HistoricalTradesPort for BinanceRestClient {
    async fn get_aggregate_trades(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<AggregateTrade>, HistoricalTradesError> {
        if until - from > one_hour() {
            return Err(HistoricalTradesError::RangeTooWide { from, until });
        }
        if until < from {
            return Ok(Vec::new());
        }

        let limit = self.page_limit.to_string();
        let mut trades: Vec<AggregateTrade> = Vec::new();
        let mut query = vec![
            ("symbol", symbol.to_uppercase()),
            ("startTime", from.timestamp_millis().to_string()),
            ("endTime", until.timestamp_millis().to_string()),
            ("limit", limit.clone()),
        ];
        let mut pages = 0_u32;

        loop {
            let page = self.fetch_page(&query).await?;
            pages += 1;
            let full_page = page.len() >= usize::from(self.page_limit);

            let mut passed_end = false;
            for msg in page {
                let trade = AggregateTrade::try_from(msg).map_err(|e| HistoricalTradesError::Decode {
                    message: e.to_string(),
                })?;
                if trade.timestamp > until {
                    passed_end = true;
                    break;
                }
                if trades.last().is_some_and(|last| trade.trade_id <= last.trade_id) {
                    continue;
                }
                trades.push(trade);
            }

            let Some(last) = trades.last() else { break };
            if !full_page || passed_end {
                break;
            }
            query = vec![
                ("symbol", symbol.to_uppercase()),
                ("fromId", (last.trade_id + 1).to_string()),
                ("limit", limit.clone()),
            ];
        }

        tracing::debug!(symbol, %from, %until, trades = trades.len(), pages, "Fetched aggregate trades");
        Ok(trades)
    }
}

/// Retry classification of an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorCategory {
    RateLimited,
    Retryable,
    NonRetryable,
}

/// 429 and 418 (IP ban) carry `Retry-After`; 5xx are transient.
const fn categorize_status(status: StatusCode) -> ErrorCategory {
    match status.as_u16() {
        418 | 429 => ErrorCategory::RateLimited,
        408 | 500..=599 => ErrorCategory::Retryable,
        _ => ErrorCategory::NonRetryable,
    }
}

fn api_error(status: StatusCode, body: &str) -> HistoricalTradesError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(err) => HistoricalTradesError::Api {
            status: status.as_u16(),
            code: Some(err.code),
            message: err.msg,
        },
        Err(_) => HistoricalTradesError::Api {
            status: status.as_u16(),
            code: None,
            message: if body.is_empty() {
                status.canonical_reason().unwrap_or("unknown").to_string()
            } else {
                body.to_string()
            },
        },
    }
}

fn header_f64(response: &reqwest::Response, name: &str) -> Option<f64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
