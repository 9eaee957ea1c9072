use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use std::collections::BTreeMap;

use crate::db::Database;
use crate::models::{HourlyCandle, MinuteCandle};
use crate::Result;

/// Floor a timestamp to the start of its UTC hour.
pub fn floor_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(t.timestamp() - i64::from(t.minute()) * 60 - i64::from(t.second()), 0)
        .single()
        .unwrap_or(t)
}

/// Floor a timestamp to the start of its UTC minute.
pub fn floor_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(t.timestamp() - i64::from(t.second()), 0)
        .single()
        .unwrap_or(t)
}

/// Running OHLCV state for one in-progress hourly bucket.
#[derive(Debug, Clone)]
struct BucketAccumulator {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    minutes: u32,
}

impl BucketAccumulator {
    fn from_minute(candle: &MinuteCandle) -> Self {
        Self {
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            minutes: 1,
        }
    }

    fn fold(&mut self, candle: &MinuteCandle) {
        self.high = self.high.max(candle.high);
        self.low = self.low.min(candle.low);
        self.close = candle.close;
        self.volume += candle.volume;
        self.minutes += 1;
    }

    fn into_candle(self, instrument: &str, open_time: DateTime<Utc>) -> HourlyCandle {
        HourlyCandle {
            instrument: instrument.to_string(),
            open_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            is_final: true,
        }
    }
}

/// Buckets live minute candles into UTC-aligned hourly bars and finalizes
/// each bar exactly once.
///
/// Every minute candle is persisted before it is folded into the in-memory
/// accumulator, and the store deduplicates re-delivered minutes, so a
/// reconnect cannot double-count and a crash mid-hour loses nothing:
/// `restore` rebuilds the accumulator from the minute table.
///
/// Empty-bucket policy: an hour with no minute data between two known hours
/// is finalized as a synthetic flat bar carrying forward the previous close
/// with volume 0. Without a previous close there is nothing to carry and the
/// hour is skipped entirely.
pub struct HourlyAggregator {
    db: Database,
    instrument: String,
    buckets: BTreeMap<DateTime<Utc>, BucketAccumulator>,
    last_finalized: Option<DateTime<Utc>>,
    prev_close: Option<f64>,
}

impl HourlyAggregator {
    pub fn new(db: Database, instrument: impl Into<String>) -> Self {
        Self {
            db,
            instrument: instrument.into(),
            buckets: BTreeMap::new(),
            last_finalized: None,
            prev_close: None,
        }
    }

    /// Rebuild state from the store: the finalization cursor from the hourly
    /// table and the in-progress accumulators from the minute table.
    pub async fn restore(&mut self, now: DateTime<Utc>) -> Result<()> {
        if let Some(last) = self.db.latest_final_hourly_candle(&self.instrument).await? {
            self.last_finalized = Some(last.open_time);
            self.prev_close = Some(last.close);
        }

        let start = self
            .last_finalized
            .map(|t| t + Duration::hours(1))
            .unwrap_or_else(|| {
                Utc.timestamp_opt(0, 0)
                    .single()
                    .unwrap_or_else(Utc::now)
            });

        let minutes = self
            .db
            .minute_candles_between(&self.instrument, start, now + Duration::hours(1))
            .await?;

        for candle in &minutes {
            let bucket = floor_to_hour(candle.open_time);
            self.buckets
                .entry(bucket)
                .and_modify(|acc| acc.fold(candle))
                .or_insert_with(|| BucketAccumulator::from_minute(candle));
        }

        tracing::info!(
            instrument = %self.instrument,
            minutes = minutes.len(),
            buckets = self.buckets.len(),
            last_finalized = ?self.last_finalized,
            "Restored aggregator state from store"
        );

        Ok(())
    }

    /// Fold one minute candle into its hourly bucket.
    ///
    /// The candle is persisted first; a duplicate delivery (same instrument
    /// and open_time) is detected by the store and not folded a second time.
    /// Minute data for an already-finalized bucket is dropped.
    pub async fn ingest(&mut self, candle: MinuteCandle) -> Result<()> {
        let bucket = floor_to_hour(candle.open_time);

        if let Some(last) = self.last_finalized {
            if bucket <= last {
                tracing::warn!(
                    instrument = %candle.instrument,
                    open_time = %candle.open_time,
                    "Dropping late minute candle for finalized bucket"
                );
                return Ok(());
            }
        }

        if !self.db.insert_minute_candle(&candle).await? {
            tracing::debug!(
                open_time = %candle.open_time,
                "Duplicate minute candle, already folded"
            );
            return Ok(());
        }

        self.buckets
            .entry(bucket)
            .and_modify(|acc| acc.fold(&candle))
            .or_insert_with(|| BucketAccumulator::from_minute(&candle));

        Ok(())
    }

    /// Finalize every bucket whose end boundary has passed, in ascending
    /// open_time order. Safe to invoke repeatedly: a bucket that is already
    /// final in the store stays untouched.
    ///
    /// Returns the number of hourly rows actually written.
    pub async fn finalize_due_buckets(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let due: Vec<DateTime<Utc>> = self
            .buckets
            .keys()
            .copied()
            .filter(|bucket| *bucket + Duration::hours(1) <= now)
            .collect();

        if due.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        let mut cursor = self
            .last_finalized
            .map(|t| t + Duration::hours(1))
            .unwrap_or(due[0]);

        for bucket in due {
            // Hours with no minute data between the cursor and the next real
            // bucket get the carry-forward treatment.
            while cursor < bucket {
                written += self.finalize_gap_hour(cursor).await? as usize;
                self.last_finalized = Some(cursor);
                cursor += Duration::hours(1);
            }

            let acc = match self.buckets.remove(&bucket) {
                Some(acc) => acc,
                None => continue,
            };
            let minutes = acc.minutes;
            let candle = acc.into_candle(&self.instrument, bucket);

            if self.db.insert_hourly_candle(&candle).await? {
                written += 1;
                tracing::info!(
                    instrument = %self.instrument,
                    open_time = %candle.open_time,
                    close = candle.close,
                    minutes,
                    "Finalized hourly candle"
                );
            } else {
                tracing::debug!(
                    open_time = %candle.open_time,
                    "Bucket already finalized, skipping"
                );
            }

            self.prev_close = Some(candle.close);
            self.last_finalized = Some(bucket);
            cursor = bucket + Duration::hours(1);
        }

        Ok(written)
    }

    async fn finalize_gap_hour(&mut self, open_time: DateTime<Utc>) -> Result<bool> {
        let prev_close = match self.prev_close {
            Some(close) => close,
            None => {
                tracing::debug!(
                    open_time = %open_time,
                    "Empty bucket with no previous close, skipping"
                );
                return Ok(false);
            }
        };

        let candle = HourlyCandle {
            instrument: self.instrument.clone(),
            open_time,
            open: prev_close,
            high: prev_close,
            low: prev_close,
            close: prev_close,
            volume: 0.0,
            is_final: true,
        };

        let inserted = self.db.insert_hourly_candle(&candle).await?;
        if inserted {
            tracing::warn!(
                instrument = %self.instrument,
                open_time = %open_time,
                close = prev_close,
                "Data gap: finalized empty hour with carried-forward close"
            );
        }
        Ok(inserted)
    }

    /// Number of in-progress (not yet finalized) buckets.
    pub fn open_bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
