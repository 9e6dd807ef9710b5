use super::{spawn_status_writer, DebouncePolicy, TelemetryIngestor};
use crate::alerts::{AlertEvaluator, AlertLogRecord};
use crate::pipeline::{BatchSink, Batcher, FlushOutcome};
use crate::rollup::{align_down, RollupAggregator};
use crate::rules::RuleSnapshotStore;
use crate::store::{DeviceRegistry, PgStore};
use crate::telemetry::{parse_payload, Reading};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::env;
use std::sync::Arc;

async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
        .execute(&admin_pool)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA {}", schema))
        .execute(&admin_pool)
        .await?;
    drop(admin_pool);

    let schema_name = schema.to_string();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            let schema = schema_name.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {}", schema))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE readings (
            id bigserial primary key,
            device_id text not null,
            "timestamp" timestamptz not null,
            temperature double precision null,
            temperature_r double precision null,
            temperature_y double precision null,
            temperature_b double precision null,
            humidity double precision null,
            flow_rate double precision null,
            pressure double precision null,
            total_volume double precision null,
            ip_address text null,
            status text null
        )
        "#,
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE devices (
            id bigserial primary key,
            device_uid text not null unique,
            device_name text null,
            status text not null default 'offline'
        )
        "#,
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE alert_rules (
            id bigserial primary key,
            device_id bigint not null references devices(id),
            user_id bigint not null,
            threshold_type text null,
            condition text null,
            threshold_value numeric null,
            interval_minutes smallint null,
            notify_email boolean null,
            notify_whatsapp boolean null,
            notify_sms boolean null,
            enabled boolean not null default true
        )
        "#,
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE alert_logs (
            id bigserial primary key,
            device_id bigint not null,
            user_id bigint not null,
            input_name text not null,
            triggered_value double precision not null,
            condition text not null,
            threshold double precision not null,
            sent_to_email text null,
            sent_to_whatsapp text null,
            sent_to_sms text null,
            sent_status text not null,
            action_taken boolean not null,
            created_at timestamptz not null
        )
        "#,
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE reading_rollups (
            device_id text not null,
            bucket_start timestamptz not null,
            temperature double precision null,
            temperature_r double precision null,
            temperature_y double precision null,
            temperature_b double precision null,
            humidity double precision null,
            flow_rate double precision null,
            pressure double precision null,
            total_volume double precision null,
            samples bigint not null,
            unique (device_id, bucket_start)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    Ok(pool)
}

fn test_database_url() -> Option<String> {
    if env::var("PIPELINE_INTEGRATION_TEST").ok().as_deref() != Some("1") {
        return None;
    }
    env::var("PIPELINE_TEST_DATABASE_URL").ok()
}

async fn seed_rule(pool: &PgPool, device_uid: &str, channel: &str, condition: &str, threshold: f64) -> Result<i64> {
    let device_id: i64 = sqlx::query_scalar(
        "INSERT INTO devices (device_uid, device_name) VALUES ($1, $2) RETURNING id",
    )
    .bind(device_uid)
    .bind(format!("{device_uid} tank"))
    .fetch_one(pool)
    .await?;
    sqlx::query(
        r#"
        INSERT INTO alert_rules
            (device_id, user_id, threshold_type, condition, threshold_value, interval_minutes, notify_email, notify_sms)
        VALUES ($1, 42, $2, $3, $4, 10, true, false)
        "#,
    )
    .bind(device_id)
    .bind(channel)
    .bind(condition)
    .bind(threshold)
    .execute(pool)
    .await?;
    Ok(device_id)
}

fn reading(payload: &str, at: chrono::DateTime<Utc>) -> Vec<Reading> {
    let mut bytes = payload.as_bytes().to_vec();
    parse_payload(&mut bytes, at, "10.1.1.1").expect("valid payload")
}

#[tokio::test]
async fn test_pipeline_persists_readings_alerts_and_status() -> Result<()> {
    let Some(database_url) = test_database_url() else {
        return Ok(());
    };
    let schema = format!("pipeline_test_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;
    let store = Arc::new(PgStore::new(pool.clone()));
    let device_id = seed_rule(&pool, "D1", "Temp", ">", 50.0).await?;

    let rules = Arc::new(RuleSnapshotStore::new(store.clone(), 10));
    rules.refresh().await?;
    assert_eq!(rules.snapshot().rules_for("D1").len(), 1);

    let readings = Arc::new(Batcher::new(
        "readings",
        store.clone() as Arc<dyn BatchSink<Reading>>,
    ));
    let alert_logs = Arc::new(Batcher::new(
        "alert_logs",
        store.clone() as Arc<dyn BatchSink<AlertLogRecord>>,
    ));
    let (status_tx, status_handle) = spawn_status_writer(store.clone() as Arc<dyn DeviceRegistry>);
    let mut ingestor = TelemetryIngestor::new(
        DebouncePolicy::default(),
        AlertEvaluator::new(rules),
        readings.clone(),
        alert_logs.clone(),
        status_tx,
    );

    let t0 = Utc::now();
    let payload = r#"{"Meter_1":{"DeviceUID":"D1","temp":55.5,"Totalizer":120},"Meter_2":{"DeviceUID":"D2","Hum":40}}"#;
    for reading in reading(payload, t0) {
        ingestor.ingest(reading);
    }

    assert!(matches!(readings.try_flush().await, FlushOutcome::Flushed { len: 2, written: 2 }));
    assert!(matches!(alert_logs.try_flush().await, FlushOutcome::Flushed { len: 1, written: 1 }));

    let rows: Vec<(String, Option<f64>, Option<f64>, Option<f64>, String, String)> = sqlx::query_as(
        "SELECT device_id, temperature, humidity, total_volume, ip_address, status FROM readings ORDER BY device_id",
    )
    .fetch_all(&pool)
    .await?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], ("D1".to_string(), Some(55.5), None, Some(120.0), "10.1.1.1".to_string(), "online".to_string()));
    assert_eq!(rows[1].2, Some(40.0));

    let log: (i64, i64, String, f64, String, Option<String>, Option<String>, String, bool) = sqlx::query_as(
        "SELECT device_id, user_id, input_name, triggered_value, condition, sent_to_email, sent_to_sms, sent_status, action_taken FROM alert_logs",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(log.0, device_id);
    assert_eq!(log.1, 42);
    assert_eq!(log.2, "Temp");
    assert_eq!(log.3, 55.5);
    assert_eq!(log.4, ">");
    assert_eq!(log.5.as_deref(), Some("yes"));
    assert_eq!(log.6, None);
    assert_eq!(log.7, "sent");
    assert!(!log.8);

    drop(ingestor);
    status_handle.await?;
    let status: String = sqlx::query_scalar("SELECT status FROM devices WHERE device_uid = 'D1'")
        .fetch_one(&pool)
        .await?;
    assert_eq!(status, "online");

    let activity = store.device_activity().await?;
    assert_eq!(activity.len(), 1);
    assert_eq!(activity[0].device_uid, "D1");
    assert_eq!(activity[0].status.as_deref(), Some("online"));
    assert!(activity[0].last_reading_at.is_some());

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_rollup_is_idempotent_against_postgres() -> Result<()> {
    let Some(database_url) = test_database_url() else {
        return Ok(());
    };
    let schema = format!("pipeline_rollup_test_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;
    let store = Arc::new(PgStore::new(pool.clone()));

    let boundary = align_down(Utc::now(), 1800);
    let sink = store.clone() as Arc<dyn BatchSink<Reading>>;
    let mut batch = Vec::new();
    for (offset, temp) in [(1, 20.0), (2, 20.25), (3, 20.1)] {
        batch.extend(reading(
            &format!(r#"{{"DeviceUID":"R1","Temperature":{temp},"TotalVolume":{}}}"#, offset * 10),
            boundary - ChronoDuration::seconds(offset),
        ));
    }
    // Belongs to the next, still open, window.
    batch.extend(reading(r#"{"DeviceUID":"R1","Temperature":99}"#, boundary));
    assert_eq!(sink.write_batch(&batch).await?, 4);

    let aggregator = RollupAggregator::new(store.clone(), 1800, 500);
    let first = aggregator.run_once(boundary).await?;
    assert_eq!(first.devices, 1);
    assert_eq!(first.inserted, 1);

    let second = aggregator.run_once(boundary).await?;
    assert_eq!(second.inserted, 0);

    let rollup: (f64, f64, i64) = sqlx::query_as(
        "SELECT temperature, total_volume, samples FROM reading_rollups WHERE device_id = 'R1'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(rollup, (20.1, 30.0, 3));

    pool.close().await;
    Ok(())
}
