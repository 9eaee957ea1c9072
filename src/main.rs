use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use tokio::time::{interval, Duration};

use ibsbot::aggregator::{floor_to_hour, floor_to_minute, HourlyAggregator};
use ibsbot::config::BotConfig;
use ibsbot::db::Database;
use ibsbot::exchange::{HyperliquidClient, PaperGateway};
use ibsbot::execution::{ExecutionConfig, ExecutionEngine};
use ibsbot::models::HourlyCandle;
use ibsbot::signal::{SignalConfig, SignalEngine};
use ibsbot::Result;

#[derive(Parser)]
#[command(name = "ibsbot", about = "IBS mean-reversion bot for Hyperliquid perpetuals")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run ingestion and trading loops together (default)
    Run,
    /// Market-data ingestion and hourly aggregation only
    Ingest,
    /// Signal derivation and order execution only
    Trade,
    /// Prune minute candles older than the retention window
    Maintain {
        /// Minute candles older than this many hours are deleted
        #[arg(long, default_value_t = 48)]
        retention_hours: i64,
    },
    /// Insert a finalized hourly candle by hand (gap repair, backfill)
    PublishCandle {
        /// Bucket open time, RFC 3339 (floored to the hour)
        #[arg(long)]
        open_time: DateTime<Utc>,
        #[arg(long)]
        open: f64,
        #[arg(long)]
        high: f64,
        #[arg(long)]
        low: f64,
        #[arg(long)]
        close: f64,
        #[arg(long, default_value_t = 0.0)]
        volume: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let config = BotConfig::from_env()?;
    let db = Database::new(&config.database_url).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(db, config).await,
        Command::Ingest => {
            ingest_loop(db, config).await;
            Ok(())
        }
        Command::Trade => {
            trade_loop(db, config).await;
            Ok(())
        }
        Command::Maintain { retention_hours } => maintain(db, &config, retention_hours).await,
        Command::PublishCandle {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        } => {
            let candle = HourlyCandle {
                instrument: config.instrument.clone(),
                open_time: floor_to_hour(open_time),
                open,
                high,
                low,
                close,
                volume,
                is_final: true,
            };
            publish_candle(db, candle).await
        }
    }
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ibsbot=info")),
        )
        .init();
}

async fn run(db: Database, config: BotConfig) -> Result<()> {
    tracing::info!("🚀 ibsbot starting");
    tracing::info!("📊 Configuration:");
    tracing::info!("  Instrument: {}", config.instrument);
    tracing::info!("  Open threshold: IBS < {}", config.open_threshold);
    tracing::info!(
        "  Leverage: {} * (1 - ibs)^{}, capped at {}x",
        config.leverage_base,
        config.leverage_exponent,
        config.leverage_base
    );
    tracing::info!("  Hold period: {}h", config.hold_period_hours);
    tracing::info!("  Paper equity: ${:.2}", config.paper_equity);

    let ingest_task = {
        let db = db.clone();
        let config = config.clone();
        tokio::spawn(async move {
            ingest_loop(db, config).await;
        })
    };

    let trade_task = tokio::spawn(async move {
        trade_loop(db, config).await;
    });

    tracing::info!("✅ Ingestion and trading loops spawned. Press Ctrl+C to stop.");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        }
        result = ingest_task => {
            tracing::error!("Ingestion loop exited: {:?}", result);
        }
        result = trade_task => {
            tracing::error!("Trading loop exited: {:?}", result);
        }
    }

    tracing::info!("👋 ibsbot stopped");
    Ok(())
}

/// Poll minute candles from the exchange, fold them into hourly buckets and
/// finalize every bucket whose hour has fully elapsed.
async fn ingest_loop(db: Database, config: BotConfig) {
    let client = HyperliquidClient::new(&config.api_url);
    let mut aggregator = HourlyAggregator::new(db.clone(), &config.instrument);

    if let Err(e) = aggregator.restore(Utc::now()).await {
        tracing::error!("Failed to restore aggregator state: {}", e);
        return;
    }

    let mut ticker = interval(Duration::from_secs(config.ingest_interval_secs));
    loop {
        ticker.tick().await;
        if let Err(e) = ingest_once(&db, &client, &mut aggregator, &config, Utc::now()).await {
            tracing::error!("Ingestion cycle failed: {}", e);
        }
    }
}

async fn ingest_once(
    db: &Database,
    client: &HyperliquidClient,
    aggregator: &mut HourlyAggregator,
    config: &BotConfig,
    now: DateTime<Utc>,
) -> Result<()> {
    // Only fully closed minutes: the candle for the current minute is still
    // mutating on the exchange, and the store keeps whatever version it saw
    // first, so freezing it mid-minute would corrupt the hourly bar
    let end = floor_to_minute(now);

    // Resume from the newest stored candle so a restart re-fetches nothing
    // it already has; a fresh database backfills a couple of hours
    let start = match db.latest_minute_open_time(&config.instrument).await? {
        Some(latest) => latest + ChronoDuration::minutes(1),
        None => end - ChronoDuration::hours(config.backfill_hours),
    };

    if start < end {
        let candles = client.minute_candles(&config.instrument, start, end).await?;
        let fetched = candles.len();
        for candle in candles {
            aggregator.ingest(candle).await?;
        }
        if fetched > 0 {
            tracing::debug!(fetched, "Ingested minute candles");
        }
    }

    let finalized = aggregator.finalize_due_buckets(now).await?;
    if finalized > 0 {
        tracing::info!("Finalized {} hourly candle(s)", finalized);
    }

    Ok(())
}

/// Derive signals from newly finalized hourly candles and execute whatever
/// is pending against the paper account.
async fn trade_loop(db: Database, config: BotConfig) {
    let client = HyperliquidClient::new(&config.api_url);
    let gateway = PaperGateway::with_live_quotes(client, config.paper_equity);

    let signals = SignalEngine::new(
        db.clone(),
        &config.instrument,
        SignalConfig {
            open_threshold: config.open_threshold,
            hold_period: ChronoDuration::hours(config.hold_period_hours),
            leverage_base: config.leverage_base,
            leverage_exponent: config.leverage_exponent,
        },
    );
    let executor = ExecutionEngine::new(db.clone(), gateway, ExecutionConfig::from(&config));

    let mut ticker = interval(Duration::from_secs(config.trade_interval_secs));
    loop {
        ticker.tick().await;

        if let Err(e) = signals.poll_once().await {
            tracing::error!("Signal derivation failed: {}", e);
            continue;
        }
        if let Err(e) = executor.execute_pending_signals().await {
            tracing::error!("Execution failed: {}", e);
        }
    }
}

async fn maintain(db: Database, config: &BotConfig, retention_hours: i64) -> Result<()> {
    let cutoff = Utc::now() - ChronoDuration::hours(retention_hours);
    let deleted = db.prune_minute_candles(&config.instrument, cutoff).await?;
    tracing::info!("Pruned {} minute candle(s) older than {}", deleted, cutoff);
    Ok(())
}

async fn publish_candle(db: Database, candle: HourlyCandle) -> Result<()> {
    if candle.high < candle.low {
        return Err(format!("high {} < low {}", candle.high, candle.low).into());
    }

    if db.insert_hourly_candle(&candle).await? {
        tracing::info!("Published hourly candle at {}", candle.open_time);
    } else {
        tracing::warn!(
            "Hourly candle at {} already exists, left unchanged",
            candle.open_time
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn candle_json(open_time: DateTime<Utc>, close: f64) -> serde_json::Value {
        json!({
            "t": open_time.timestamp_millis(),
            "T": open_time.timestamp_millis() + 60_000,
            "s": "BTC", "i": "1m",
            "o": (close - 1.0).to_string(), "h": (close + 1.0).to_string(),
            "l": (close - 2.0).to_string(), "c": close.to_string(),
            "v": "1.0", "n": 5
        })
    }

    #[tokio::test]
    async fn test_ingest_skips_still_open_minute() {
        let mut server = mockito::Server::new_async().await;
        // Mid-minute: 14:30 is still forming, 14:29 is the last closed one
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 14, 30, 25).unwrap();
        let closed = Utc.with_ymd_and_hms(2025, 1, 15, 14, 29, 0).unwrap();
        let forming = Utc.with_ymd_and_hms(2025, 1, 15, 14, 30, 0).unwrap();

        let body = json!([
            candle_json(closed, 96_000.0),
            // The exchange reports the in-progress minute too
            candle_json(forming, 96_100.0),
        ]);
        let _mock = server
            .mock("POST", "/info")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let config = BotConfig {
            api_url: server.url(),
            ..Default::default()
        };
        let db = Database::in_memory().await.unwrap();
        let client = HyperliquidClient::new(server.url());
        let mut aggregator = HourlyAggregator::new(db.clone(), &config.instrument);

        ingest_once(&db, &client, &mut aggregator, &config, now)
            .await
            .unwrap();

        // The forming minute stays out of the store until it closes; only
        // then can it be fetched in its final shape
        assert_eq!(
            db.latest_minute_open_time("BTC").await.unwrap(),
            Some(closed)
        );
    }
}
