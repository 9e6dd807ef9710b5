use crate::alerts::AlertLogRecord;
use crate::ingest::DeviceActivity;
use crate::pipeline::BatchSink;
use crate::rollup::{RawRow, RollupBucket};
use crate::rules::AlertRuleRow;
use crate::telemetry::{Channel, Channels, Reading};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder, Row};

// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;
const READING_COLUMNS: usize = 12;
const ALERT_LOG_COLUMNS: usize = 12;
const ROLLUP_COLUMNS: usize = 11;

const NOTIFIED: &str = "yes";
const SENT_STATUS: &str = "sent";

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn set_device_status(&self, device_uid: &str, status: &str) -> Result<u64>;
    /// Every registered device with its stored status and newest raw reading.
    async fn device_activity(&self) -> Result<Vec<DeviceActivity>>;
}

#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn load_enabled_rules(&self) -> Result<Vec<AlertRuleRow>>;
}

#[async_trait]
pub trait RollupStore: Send + Sync {
    /// Devices with at least one reading in `[since, until)`.
    async fn active_devices(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<String>>;
    async fn readings_between(
        &self,
        device_ids: &[String],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<RawRow>>;
    /// Inserts buckets that do not exist yet and returns how many were new.
    async fn insert_buckets(&self, buckets: &[RollupBucket]) -> Result<u64>;
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn rows_per_statement(columns: usize) -> usize {
    MAX_BIND_PARAMS / columns
}

fn notified(enabled: bool) -> Option<&'static str> {
    enabled.then_some(NOTIFIED)
}

fn channels_from_row(row: &sqlx::postgres::PgRow) -> Result<Channels> {
    let mut channels = Channels::default();
    for channel in Channel::ALL {
        if let Some(value) = row.try_get::<Option<f64>, _>(channel.column())? {
            channels.set(channel, value);
        }
    }
    Ok(channels)
}

#[async_trait]
impl BatchSink<Reading> for PgStore {
    async fn write_batch(&self, items: &[Reading]) -> Result<u64> {
        let mut written = 0;
        for chunk in items.chunks(rows_per_statement(READING_COLUMNS)) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"INSERT INTO readings (device_id, "timestamp", temperature, temperature_r, temperature_y, temperature_b, humidity, flow_rate, pressure, total_volume, ip_address, status) "#,
            );
            builder.push_values(chunk.iter(), |mut b, reading| {
                b.push_bind(&reading.device_id)
                    .push_bind(reading.captured_at)
                    .push_bind(reading.channels.get(Channel::Temperature))
                    .push_bind(reading.channels.get(Channel::TemperatureR))
                    .push_bind(reading.channels.get(Channel::TemperatureY))
                    .push_bind(reading.channels.get(Channel::TemperatureB))
                    .push_bind(reading.channels.get(Channel::Humidity))
                    .push_bind(reading.channels.get(Channel::FlowRate))
                    .push_bind(reading.channels.get(Channel::Pressure))
                    .push_bind(reading.channels.get(Channel::TotalVolume))
                    .push_bind(&reading.ip_address)
                    .push_bind(&reading.status);
            });
            written += builder.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(written)
    }
}

#[async_trait]
impl BatchSink<AlertLogRecord> for PgStore {
    async fn write_batch(&self, items: &[AlertLogRecord]) -> Result<u64> {
        let mut written = 0;
        for chunk in items.chunks(rows_per_statement(ALERT_LOG_COLUMNS)) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO alert_logs (device_id, user_id, input_name, triggered_value, condition, threshold, sent_to_email, sent_to_whatsapp, sent_to_sms, sent_status, action_taken, created_at) ",
            );
            builder.push_values(chunk.iter(), |mut b, record| {
                b.push_bind(record.device_id)
                    .push_bind(record.user_id)
                    .push_bind(&record.input_name)
                    .push_bind(record.triggered_value)
                    .push_bind(record.condition.as_str())
                    .push_bind(record.threshold)
                    .push_bind(notified(record.notify_email))
                    .push_bind(notified(record.notify_whatsapp))
                    .push_bind(notified(record.notify_sms))
                    .push_bind(SENT_STATUS)
                    .push_bind(record.action_taken)
                    .push_bind(record.triggered_at);
            });
            written += builder.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(written)
    }
}

#[async_trait]
impl DeviceRegistry for PgStore {
    async fn set_device_status(&self, device_uid: &str, status: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE devices SET status = $1 WHERE device_uid = $2")
            .bind(status)
            .bind(device_uid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn device_activity(&self) -> Result<Vec<DeviceActivity>> {
        let rows: Vec<DeviceActivity> = sqlx::query_as(
            r#"
            SELECT
                d.device_uid,
                d.status,
                MAX(r."timestamp") AS last_reading_at
            FROM devices d
            LEFT JOIN readings r ON r.device_id = d.device_uid
            GROUP BY d.device_uid, d.status
            ORDER BY d.device_uid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl RuleSource for PgStore {
    async fn load_enabled_rules(&self) -> Result<Vec<AlertRuleRow>> {
        let rows: Vec<AlertRuleRow> = sqlx::query_as(
            r#"
            SELECT
                r.id,
                d.id AS device_id,
                d.device_uid,
                d.device_name,
                r.user_id,
                r.threshold_type,
                r.condition,
                r.threshold_value::float8 AS threshold_value,
                r.interval_minutes::int4 AS interval_minutes,
                r.notify_email,
                r.notify_whatsapp,
                r.notify_sms
            FROM alert_rules r
            JOIN devices d ON r.device_id = d.id
            WHERE r.enabled = true
            ORDER BY r.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl RollupStore for PgStore {
    async fn active_devices(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<String>> {
        let devices: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT device_id
            FROM readings
            WHERE "timestamp" >= $1
              AND "timestamp" < $2
            ORDER BY device_id
            "#,
        )
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;
        Ok(devices)
    }

    async fn readings_between(
        &self,
        device_ids: &[String],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<RawRow>> {
        let rows = sqlx::query(
            r#"
            SELECT device_id, "timestamp", temperature, temperature_r, temperature_y,
                   temperature_b, humidity, flow_rate, pressure, total_volume
            FROM readings
            WHERE "timestamp" >= $1
              AND "timestamp" < $2
              AND device_id = ANY($3)
            ORDER BY device_id, "timestamp"
            "#,
        )
        .bind(since)
        .bind(until)
        .bind(device_ids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(RawRow {
                    device_id: row.try_get("device_id")?,
                    timestamp: row.try_get("timestamp")?,
                    channels: channels_from_row(row)?,
                })
            })
            .collect()
    }

    async fn insert_buckets(&self, buckets: &[RollupBucket]) -> Result<u64> {
        let mut inserted = 0;
        for chunk in buckets.chunks(rows_per_statement(ROLLUP_COLUMNS)) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO reading_rollups (device_id, bucket_start, temperature, temperature_r, temperature_y, temperature_b, humidity, flow_rate, pressure, total_volume, samples) ",
            );
            builder.push_values(chunk.iter(), |mut b, bucket| {
                b.push_bind(&bucket.device_id).push_bind(bucket.bucket_start);
                for channel in Channel::ALL {
                    b.push_bind(bucket.channels.get(channel));
                }
                b.push_bind(bucket.samples);
            });
            builder.push(" ON CONFLICT (device_id, bucket_start) DO NOTHING");
            inserted += builder.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(inserted)
    }
}
