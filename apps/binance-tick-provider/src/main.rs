//! Binance Tick Provider Binary
//!
//! Follows one instrument from a few hours back into the live feed and
//! serves provider status over HTTP.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin binance-tick-provider
//! ```
//!
//! # Environment Variables
//!
//! All optional.
//! - `BINANCE_API_KEY`: Sent as `X-MBX-APIKEY` on REST requests
//! - `BINANCE_REST_URL`: REST base URL (default: <https://api.binance.com>)
//! - `BINANCE_STREAM_URL`: Websocket base URL (default: <wss://stream.binance.com:9443/ws>)
//! - `BINANCE_REQUEST_TIMEOUT_SECS`, `BINANCE_MAX_RETRIES`,
//!   `BINANCE_RETRY_DELAY_INITIAL_MS`, `BINANCE_RETRY_DELAY_MAX_SECS`,
//!   `BINANCE_PAGE_LIMIT`: REST client tuning
//! - `TICK_CACHE_DIR`: Hour cache directory (default: data)
//! - `TICK_PROVIDER_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `TICK_PROVIDER_COLLECT_INTERVAL_SECS`: Idle provider eviction period (default: 60)
//! - `TICK_SYMBOL`: Instrument to follow (default: BTCUSDT)
//! - `TICK_SIZE`: Minimum price increment (default: 0.01)
//! - `TICK_LOOKBACK_HOURS`: Whole hours of history before the current one (default: 2)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`: Span export
//! - `RUST_LOG`: Log filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use binance_tick_provider::domain::time::{Clock, floor_to_hour};
use binance_tick_provider::infrastructure::telemetry;
use binance_tick_provider::{
    BinanceRestClient, BinanceStreamClient, FsFileStore, HealthServer, HealthServerState,
    Instrument, ProviderConfig, ProviderRequest, SystemClock, TickProvider, TickProviderService,
    init_metrics,
};
use chrono::TimeDelta;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Log a progress line every this many ticks.
const PROGRESS_EVERY: u64 = 10_000;

/// Upper bound on `TICK_LOOKBACK_HOURS`.
const MAX_LOOKBACK_HOURS: u32 = 24 * 365;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("telemetry setup failed")?;

    tracing::info!("Starting Binance tick provider");

    let _metrics_handle = init_metrics().context("metrics setup failed")?;

    let config = ProviderConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let historical = Arc::new(BinanceRestClient::new(&config.binance, &config.rest)?);
    let feed = Arc::new(BinanceStreamClient::new(&config.binance));
    let files = Arc::new(FsFileStore::new(&config.server.cache_dir));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = TickProviderService::new(historical, feed, files, Arc::clone(&clock));

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        service.clone(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let collector =
        service.spawn_collector(config.server.collect_interval, shutdown_token.clone());

    let lookback_hours = i64::from(config.follow.lookback_hours.min(MAX_LOOKBACK_HOURS));
    let from = floor_to_hour(clock.now()) - TimeDelta::hours(lookback_hours);
    let request = ProviderRequest::open(
        Instrument::new(config.follow.symbol.clone(), config.follow.tick_size),
        from,
    );

    let follower = tokio::spawn(follow(service.clone(), request, shutdown_token.clone()));

    tracing::info!("Tick provider ready");

    tokio::select! {
        () = await_shutdown() => {}
        result = follower => {
            match result {
                Ok(Ok(())) => tracing::info!("Follower finished"),
                Ok(Err(e)) => tracing::error!(error = %e, "Follower failed"),
                Err(e) => tracing::error!(error = %e, "Follower panicked"),
            }
        }
    }

    shutdown_token.cancel();
    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
    service.shutdown();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, collector).await.is_err() {
        tracing::warn!("Collector did not stop in time");
    }

    tracing::info!("Tick provider stopped");
    Ok(())
}

/// Read the requested window until cancelled or the provider fails.
async fn follow(
    service: TickProviderService,
    request: ProviderRequest,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let provider = service.get_tick_provider(request)?;
    tracing::info!(provider = %provider.name(), "Waiting for provider");

    provider.lifecycle().wait_ready(&cancel).await?;
    let mut reader = provider.create_reader()?;
    tracing::info!(provider = %provider.name(), first_tick_id = ?provider.first_tick_id(), "Provider ready");

    let failure = provider.lifecycle().wait_error(&cancel);
    tokio::pin!(failure);

    let mut count: u64 = 0;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            error = &mut failure => {
                return match error {
                    Ok(e) => Err(e.into()),
                    Err(_) => Ok(()),
                };
            }
            tick = reader.next() => {
                let Some(tick) = tick else {
                    tracing::info!(ticks = count, "Tick stream finished");
                    return Ok(());
                };
                count += 1;
                if count % PROGRESS_EVERY == 0 {
                    tracing::info!(
                        ticks = count,
                        price = %tick.price,
                        time = %tick.timestamp,
                        "Following"
                    );
                }
            }
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ProviderConfig) {
    tracing::info!(
        symbol = %config.follow.symbol,
        lookback_hours = config.follow.lookback_hours,
        cache_dir = %config.server.cache_dir.display(),
        health_port = config.server.health_port,
        authenticated = config.binance.credentials.is_some(),
        "Configuration loaded"
    );
    tracing::debug!(
        rest_url = %config.binance.rest_url,
        stream_url = %config.binance.stream_url,
        "Binance endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for SIGTERM or SIGINT.
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
