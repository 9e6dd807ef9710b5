use crate::store::RollupStore;
use crate::telemetry::{Channel, Channels};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One raw reading as read back for aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub channels: Channels,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollupBucket {
    pub device_id: String,
    pub bucket_start: DateTime<Utc>,
    pub channels: Channels,
    pub samples: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupReport {
    pub devices: usize,
    pub buckets: usize,
    pub inserted: u64,
}

pub fn align_down(ts: DateTime<Utc>, interval_seconds: i64) -> DateTime<Utc> {
    let interval_ms = interval_seconds.max(1) * 1000;
    let ts_ms = ts.timestamp_millis();
    let bucket_ms = ts_ms.div_euclid(interval_ms) * interval_ms;
    Utc.timestamp_millis_opt(bucket_ms).single().unwrap_or(ts)
}

/// First wall-clock boundary strictly after `now`, e.g. :00 and :30 for a
/// 30 minute period.
pub fn next_boundary(now: DateTime<Utc>, period_seconds: i64) -> DateTime<Utc> {
    let period_seconds = period_seconds.max(1);
    align_down(now, period_seconds) + ChronoDuration::seconds(period_seconds)
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[derive(Default)]
struct Accumulator {
    sums: [f64; 8],
    counts: [u32; 8],
    samples: i64,
}

/// Groups rows into aligned buckets per device. Continuous channels are
/// averaged and rounded to one decimal; the totalizer keeps its maximum.
pub fn aggregate_buckets(rows: &[RawRow], bucket_seconds: i64) -> Vec<RollupBucket> {
    let mut grouped: BTreeMap<(String, DateTime<Utc>), Accumulator> = BTreeMap::new();
    for row in rows {
        let start = align_down(row.timestamp, bucket_seconds);
        let acc = grouped.entry((row.device_id.clone(), start)).or_default();
        acc.samples += 1;
        for (channel, value) in row.channels.iter() {
            let idx = channel as usize;
            if channel == Channel::TotalVolume {
                if acc.counts[idx] == 0 || value > acc.sums[idx] {
                    acc.sums[idx] = value;
                }
            } else {
                acc.sums[idx] += value;
            }
            acc.counts[idx] += 1;
        }
    }

    grouped
        .into_iter()
        .map(|((device_id, bucket_start), acc)| {
            let mut channels = Channels::default();
            for channel in Channel::ALL {
                let idx = channel as usize;
                if acc.counts[idx] == 0 {
                    continue;
                }
                let value = if channel == Channel::TotalVolume {
                    acc.sums[idx]
                } else {
                    round_one_decimal(acc.sums[idx] / f64::from(acc.counts[idx]))
                };
                channels.set(channel, value);
            }
            RollupBucket {
                device_id,
                bucket_start,
                channels,
                samples: acc.samples,
            }
        })
        .collect()
}

pub struct RollupAggregator {
    store: Arc<dyn RollupStore>,
    window: ChronoDuration,
    device_batch: usize,
}

impl RollupAggregator {
    pub fn new(store: Arc<dyn RollupStore>, window_seconds: i64, device_batch: usize) -> Self {
        Self {
            store,
            window: ChronoDuration::seconds(window_seconds.max(1)),
            device_batch: device_batch.max(1),
        }
    }

    /// Aggregates the last closed window before `now`: `now` is aligned down
    /// to a window boundary and only rows in `[boundary - window, boundary)`
    /// are read, so every bucket is computed from its full window. Buckets
    /// that already exist are left untouched, so re-running is a no-op.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RollupReport> {
        let until = align_down(now, self.window.num_seconds());
        let since = until - self.window;
        let devices = self
            .store
            .active_devices(since, until)
            .await
            .context("failed to list active devices")?;
        if devices.is_empty() {
            tracing::warn!(%since, %until, "no active devices in rollup window");
            return Ok(RollupReport::default());
        }
        tracing::info!(devices = devices.len(), "rolling up active devices");

        let mut report = RollupReport {
            devices: devices.len(),
            ..RollupReport::default()
        };
        for chunk in devices.chunks(self.device_batch) {
            let rows = self
                .store
                .readings_between(chunk, since, until)
                .await
                .context("failed to read raw readings")?;
            let buckets = aggregate_buckets(&rows, self.window.num_seconds());
            let inserted = self
                .store
                .insert_buckets(&buckets)
                .await
                .context("failed to insert rollup buckets")?;
            tracing::info!(
                devices = chunk.len(),
                buckets = buckets.len(),
                inserted,
                "rollup chunk processed"
            );
            report.buckets += buckets.len();
            report.inserted += inserted;
        }
        Ok(report)
    }

    /// Runs on wall-clock boundaries of `period`. A boundary missed because a
    /// run overran is skipped.
    pub fn spawn(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let period_seconds = i64::try_from(period.as_secs()).unwrap_or(86_400).clamp(1, 86_400);
        tokio::spawn(async move {
            let mut boundary = next_boundary(Utc::now(), period_seconds);
            loop {
                let wait = (boundary - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        match self.run_once(boundary).await {
                            Ok(report) => tracing::debug!(?report, %boundary, "rollup run finished"),
                            Err(err) => tracing::error!(error = %format!("{err:#}"), %boundary, "rollup run failed"),
                        }
                        // The sleep can wake a hair before the wall clock reaches
                        // the boundary; never schedule the same boundary twice.
                        boundary = next_boundary(Utc::now().max(boundary), period_seconds);
                    }
                }
            }
        })
    }
}
