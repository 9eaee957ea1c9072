use crate::error::TradingError;
use crate::models::{
    HourlyCandle, MinuteCandle, PositionSide, SignalKind, SignalStatus, TradeSignal,
};
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use uuid::Uuid;

/// SQLite persistence for candles, signals and the processing watermark.
///
/// The store is the sole synchronization point between the ingestion path
/// and the decision/execution path, so every operation here is a single
/// short transaction.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to SQLite and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to SQLite at {}", database_url);

        Ok(Self { pool })
    }

    /// In-memory database for tests. Single connection, because each
    /// `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    // ==================== MINUTE CANDLES ====================

    /// Insert a minute candle. Returns `false` if a candle for this
    /// (instrument, open_time) already exists — the row is left untouched,
    /// which is how re-delivered ticks after a reconnect are deduplicated.
    pub async fn insert_minute_candle(&self, candle: &MinuteCandle) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO minute_candles
                (instrument, open_time, open, high, low, close, volume)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&candle.instrument)
        .bind(candle.open_time)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Minute candles with `start <= open_time < end`, oldest first.
    pub async fn minute_candles_between(
        &self,
        instrument: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MinuteCandle>> {
        let rows = sqlx::query(
            r#"
            SELECT instrument, open_time, open, high, low, close, volume
            FROM minute_candles
            WHERE instrument = ?1 AND open_time >= ?2 AND open_time < ?3
            ORDER BY open_time ASC
            "#,
        )
        .bind(instrument)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_minute_candle).collect()
    }

    /// Open time of the newest stored minute candle, if any.
    pub async fn latest_minute_open_time(&self, instrument: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MAX(open_time) AS open_time FROM minute_candles WHERE instrument = ?1",
        )
        .bind(instrument)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("open_time"))
    }

    /// Delete minute candles older than `cutoff`. Hourly candles and signals
    /// are kept forever; minute data is only aggregation input.
    pub async fn prune_minute_candles(
        &self,
        instrument: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM minute_candles WHERE instrument = ?1 AND open_time < ?2")
                .bind(instrument)
                .bind(cutoff)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    // ==================== HOURLY CANDLES ====================

    /// Insert a finalized hourly candle. Returns `false` when a row for this
    /// (instrument, open_time) already exists; the existing row is never
    /// modified, so re-finalizing a bucket is a no-op.
    pub async fn insert_hourly_candle(&self, candle: &HourlyCandle) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO hourly_candles
                (instrument, open_time, open, high, low, close, volume, is_final)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&candle.instrument)
        .bind(candle.open_time)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .bind(candle.is_final)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn hourly_candle(
        &self,
        instrument: &str,
        open_time: DateTime<Utc>,
    ) -> Result<Option<HourlyCandle>> {
        let row = sqlx::query(
            r#"
            SELECT instrument, open_time, open, high, low, close, volume, is_final
            FROM hourly_candles
            WHERE instrument = ?1 AND open_time = ?2
            "#,
        )
        .bind(instrument)
        .bind(open_time)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_hourly_candle).transpose()
    }

    /// Newest finalized hourly candle, used for the carry-forward policy and
    /// to restore the aggregator's finalization cursor on startup.
    pub async fn latest_final_hourly_candle(
        &self,
        instrument: &str,
    ) -> Result<Option<HourlyCandle>> {
        let row = sqlx::query(
            r#"
            SELECT instrument, open_time, open, high, low, close, volume, is_final
            FROM hourly_candles
            WHERE instrument = ?1 AND is_final = 1
            ORDER BY open_time DESC
            LIMIT 1
            "#,
        )
        .bind(instrument)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_hourly_candle).transpose()
    }

    /// Finalized hourly candles strictly newer than `after` (all of them if
    /// `after` is None), oldest first. This is the signal engine's feed.
    pub async fn final_hourly_candles_after(
        &self,
        instrument: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<HourlyCandle>> {
        let rows = match after {
            Some(after) => {
                sqlx::query(
                    r#"
                    SELECT instrument, open_time, open, high, low, close, volume, is_final
                    FROM hourly_candles
                    WHERE instrument = ?1 AND is_final = 1 AND open_time > ?2
                    ORDER BY open_time ASC
                    "#,
                )
                .bind(instrument)
                .bind(after)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT instrument, open_time, open, high, low, close, volume, is_final
                    FROM hourly_candles
                    WHERE instrument = ?1 AND is_final = 1
                    ORDER BY open_time ASC
                    "#,
                )
                .bind(instrument)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(row_to_hourly_candle).collect()
    }

    // ==================== TRADE SIGNALS ====================

    /// Append a trade signal. A second pending signal for the same
    /// instrument trips the partial unique index and surfaces as an
    /// `InvariantViolation` — the engine must never get there.
    pub async fn insert_trade_signal(&self, signal: &TradeSignal) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO trade_signals
                (id, instrument, kind, side, price, leverage,
                 created_at, source_candle_open_time, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(signal.id)
        .bind(&signal.instrument)
        .bind(signal.kind.as_str())
        .bind(signal.side.as_str())
        .bind(signal.price)
        .bind(signal.leverage)
        .bind(signal.created_at)
        .bind(signal.source_candle_open_time)
        .bind(signal.status.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                tracing::info!(
                    instrument = %signal.instrument,
                    kind = signal.kind.as_str(),
                    price = signal.price,
                    leverage = signal.leverage,
                    "Inserted trade signal {}",
                    signal.id
                );
                Ok(())
            }
            Err(e) => {
                if e.as_database_error()
                    .is_some_and(|db| db.is_unique_violation())
                {
                    Err(Box::new(TradingError::InvariantViolation(format!(
                        "duplicate pending signal for {}",
                        signal.instrument
                    ))))
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// All pending signals, oldest first.
    pub async fn pending_signals(&self) -> Result<Vec<TradeSignal>> {
        let rows = sqlx::query(
            r#"
            SELECT id, instrument, kind, side, price, leverage,
                   created_at, source_candle_open_time, status
            FROM trade_signals
            WHERE status = 'pending'
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_trade_signal).collect()
    }

    pub async fn pending_signal_for(&self, instrument: &str) -> Result<Option<TradeSignal>> {
        let row = sqlx::query(
            r#"
            SELECT id, instrument, kind, side, price, leverage,
                   created_at, source_candle_open_time, status
            FROM trade_signals
            WHERE instrument = ?1 AND status = 'pending'
            LIMIT 1
            "#,
        )
        .bind(instrument)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_trade_signal).transpose()
    }

    /// Most recent executed signal, from which the per-instrument position
    /// state is derived after a restart.
    pub async fn latest_executed_signal(&self, instrument: &str) -> Result<Option<TradeSignal>> {
        let row = sqlx::query(
            r#"
            SELECT id, instrument, kind, side, price, leverage,
                   created_at, source_candle_open_time, status
            FROM trade_signals
            WHERE instrument = ?1 AND status = 'executed'
            ORDER BY created_at DESC, source_candle_open_time DESC
            LIMIT 1
            "#,
        )
        .bind(instrument)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_trade_signal).transpose()
    }

    pub async fn mark_signal_executed(&self, id: Uuid) -> Result<()> {
        self.set_signal_status(id, SignalStatus::Executed).await
    }

    pub async fn mark_signal_failed(&self, id: Uuid) -> Result<()> {
        self.set_signal_status(id, SignalStatus::Failed).await
    }

    async fn set_signal_status(&self, id: Uuid, status: SignalStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE trade_signals SET status = ?1 WHERE id = ?2 AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(format!("signal {} not found or not pending", id).into());
        }

        tracing::info!("Marked signal {} as {}", id, status.as_str());
        Ok(())
    }

    // ==================== WATERMARK ====================

    /// Last hourly open_time the signal engine has processed.
    pub async fn get_watermark(&self, instrument: &str) -> Result<Option<DateTime<Utc>>> {
        let row =
            sqlx::query("SELECT last_open_time FROM signal_watermarks WHERE instrument = ?1")
                .bind(instrument)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|r| r.get("last_open_time")))
    }

    pub async fn set_watermark(&self, instrument: &str, open_time: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO signal_watermarks (instrument, last_open_time)
            VALUES (?1, ?2)
            ON CONFLICT (instrument) DO UPDATE SET last_open_time = excluded.last_open_time
            "#,
        )
        .bind(instrument)
        .bind(open_time)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_minute_candle(row: &sqlx::sqlite::SqliteRow) -> Result<MinuteCandle> {
    Ok(MinuteCandle {
        instrument: row.get("instrument"),
        open_time: row.get("open_time"),
        open: row.get("open"),
        high: row.get("high"),
        low: row.get("low"),
        close: row.get("close"),
        volume: row.get("volume"),
    })
}

fn row_to_hourly_candle(row: &sqlx::sqlite::SqliteRow) -> Result<HourlyCandle> {
    Ok(HourlyCandle {
        instrument: row.get("instrument"),
        open_time: row.get("open_time"),
        open: row.get("open"),
        high: row.get("high"),
        low: row.get("low"),
        close: row.get("close"),
        volume: row.get("volume"),
        is_final: row.get("is_final"),
    })
}

fn row_to_trade_signal(row: &sqlx::sqlite::SqliteRow) -> Result<TradeSignal> {
    let kind_str: String = row.get("kind");
    let side_str: String = row.get("side");
    let status_str: String = row.get("status");

    let kind =
        SignalKind::parse(&kind_str).ok_or_else(|| format!("invalid signal kind {kind_str}"))?;
    let side = PositionSide::parse(&side_str)
        .ok_or_else(|| format!("invalid signal side {side_str}"))?;
    let status = SignalStatus::parse(&status_str)
        .ok_or_else(|| format!("invalid signal status {status_str}"))?;

    Ok(TradeSignal {
        id: row.get("id"),
        instrument: row.get("instrument"),
        kind,
        side,
        price: row.get("price"),
        leverage: row.get("leverage"),
        created_at: row.get("created_at"),
        source_candle_open_time: row.get("source_candle_open_time"),
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn minute(open_time: DateTime<Utc>, close: f64) -> MinuteCandle {
        MinuteCandle {
            instrument: "BTC".to_string(),
            open_time,
            open: close - 1.0,
            high: close + 2.0,
            low: close - 2.0,
            close,
            volume: 10.0,
        }
    }

    fn hourly(open_time: DateTime<Utc>) -> HourlyCandle {
        HourlyCandle {
            instrument: "BTC".to_string(),
            open_time,
            open: 100.0,
            high: 110.0,
            low: 95.0,
            close: 97.0,
            volume: 500.0,
            is_final: true,
        }
    }

    fn signal(kind: SignalKind, created_at: DateTime<Utc>) -> TradeSignal {
        TradeSignal {
            id: Uuid::new_v4(),
            instrument: "BTC".to_string(),
            kind,
            side: PositionSide::Long,
            price: 97.0,
            leverage: 3.0,
            created_at,
            source_candle_open_time: created_at,
            status: SignalStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_minute_candle_insert_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let t = Utc.with_ymd_and_hms(2025, 1, 15, 14, 0, 0).unwrap();

        assert!(db.insert_minute_candle(&minute(t, 100.0)).await.unwrap());
        // Same open_time again: ignored, original row kept
        assert!(!db.insert_minute_candle(&minute(t, 999.0)).await.unwrap());

        let candles = db
            .minute_candles_between("BTC", t, t + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 100.0);
    }

    #[tokio::test]
    async fn test_minute_candles_range_is_half_open() {
        let db = Database::in_memory().await.unwrap();
        let start = Utc.with_ymd_and_hms(2025, 1, 15, 14, 0, 0).unwrap();

        for i in 0..60 {
            db.insert_minute_candle(&minute(start + Duration::minutes(i), 100.0 + i as f64))
                .await
                .unwrap();
        }
        // First minute of the next hour must not be included
        db.insert_minute_candle(&minute(start + Duration::hours(1), 500.0))
            .await
            .unwrap();

        let candles = db
            .minute_candles_between("BTC", start, start + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(candles.len(), 60);
        assert_eq!(candles[0].close, 100.0);
        assert_eq!(candles[59].close, 159.0);
    }

    #[tokio::test]
    async fn test_hourly_candle_finalization_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let t = Utc.with_ymd_and_hms(2025, 1, 15, 14, 0, 0).unwrap();

        assert!(db.insert_hourly_candle(&hourly(t)).await.unwrap());

        // Second finalization attempt with different values: no-op
        let mut mutated = hourly(t);
        mutated.close = 12345.0;
        assert!(!db.insert_hourly_candle(&mutated).await.unwrap());

        let stored = db.hourly_candle("BTC", t).await.unwrap().unwrap();
        assert_eq!(stored.close, 97.0);
    }

    #[tokio::test]
    async fn test_final_hourly_candles_after_watermark() {
        let db = Database::in_memory().await.unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();

        for i in 0..3 {
            db.insert_hourly_candle(&hourly(t0 + Duration::hours(i)))
                .await
                .unwrap();
        }

        let all = db.final_hourly_candles_after("BTC", None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].open_time, t0);

        let newer = db
            .final_hourly_candles_after("BTC", Some(t0))
            .await
            .unwrap();
        assert_eq!(newer.len(), 2);
        assert_eq!(newer[0].open_time, t0 + Duration::hours(1));
    }

    #[tokio::test]
    async fn test_duplicate_pending_signal_is_invariant_violation() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();

        db.insert_trade_signal(&signal(SignalKind::Open, now))
            .await
            .unwrap();

        let err = db
            .insert_trade_signal(&signal(SignalKind::Open, now + Duration::seconds(1)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invariant violation"));
    }

    #[tokio::test]
    async fn test_pending_signal_allowed_after_terminal_status() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();

        let open = signal(SignalKind::Open, now);
        db.insert_trade_signal(&open).await.unwrap();
        db.mark_signal_executed(open.id).await.unwrap();

        // Pending slot is free again
        db.insert_trade_signal(&signal(SignalKind::Close, now + Duration::hours(1)))
            .await
            .unwrap();

        let pending = db.pending_signals().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, SignalKind::Close);

        let executed = db.latest_executed_signal("BTC").await.unwrap().unwrap();
        assert_eq!(executed.id, open.id);
    }

    #[tokio::test]
    async fn test_pending_signals_ordered_oldest_first() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();

        let mut first = signal(SignalKind::Open, now);
        first.instrument = "ETH".to_string();
        let second = signal(SignalKind::Open, now + Duration::seconds(5));

        db.insert_trade_signal(&second).await.unwrap();
        db.insert_trade_signal(&first).await.unwrap();

        let pending = db.pending_signals().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].instrument, "ETH");
    }

    #[tokio::test]
    async fn test_mark_signal_failed() {
        let db = Database::in_memory().await.unwrap();
        let s = signal(SignalKind::Open, Utc::now());
        db.insert_trade_signal(&s).await.unwrap();

        db.mark_signal_failed(s.id).await.unwrap();
        assert!(db.pending_signal_for("BTC").await.unwrap().is_none());

        // Terminal statuses are final
        assert!(db.mark_signal_executed(s.id).await.is_err());
    }

    #[tokio::test]
    async fn test_watermark_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let t = Utc.with_ymd_and_hms(2025, 1, 15, 14, 0, 0).unwrap();

        assert!(db.get_watermark("BTC").await.unwrap().is_none());

        db.set_watermark("BTC", t).await.unwrap();
        assert_eq!(db.get_watermark("BTC").await.unwrap(), Some(t));

        db.set_watermark("BTC", t + Duration::hours(1)).await.unwrap();
        assert_eq!(
            db.get_watermark("BTC").await.unwrap(),
            Some(t + Duration::hours(1))
        );
    }

    #[tokio::test]
    async fn test_prune_minute_candles_keeps_recent() {
        let db = Database::in_memory().await.unwrap();
        let old = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let recent = Utc.with_ymd_and_hms(2025, 1, 20, 0, 0, 0).unwrap();

        db.insert_minute_candle(&minute(old, 100.0)).await.unwrap();
        db.insert_minute_candle(&minute(recent, 101.0)).await.unwrap();

        let cutoff = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        let deleted = db.prune_minute_candles("BTC", cutoff).await.unwrap();
        assert_eq!(deleted, 1);

        assert_eq!(db.latest_minute_open_time("BTC").await.unwrap(), Some(recent));
    }
}
