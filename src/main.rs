mod alerts;
mod config;
mod ingest;
mod mqtt;
mod pipeline;
mod rollup;
mod rules;
mod store;
mod telemetry;

use crate::alerts::{AlertEvaluator, AlertLogRecord};
use crate::config::Config;
use crate::ingest::{spawn_status_reconciler, spawn_status_writer, TelemetryIngestor};
use crate::pipeline::{BatchSink, BatchStats, Batcher};
use crate::rollup::RollupAggregator;
use crate::rules::RuleSnapshotStore;
use crate::store::{build_pool, DeviceRegistry, PgStore, RollupStore, RuleSource};
use crate::telemetry::Reading;
use anyhow::{Context, Result};
use futures::future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_pipeline=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "telemetry-pipeline"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

fn log_batch_stats(name: &str, stats: &BatchStats) {
    tracing::info!(
        batcher = name,
        queue_depth = stats.queue_depth.load(Ordering::Relaxed),
        last_batch_len = stats.last_batch_len.load(Ordering::Relaxed),
        last_flush_unix_ms = stats.last_flush_unix_ms.load(Ordering::Relaxed),
        inflight_flushes = stats.inflight_flushes.load(Ordering::Relaxed),
        written = stats.written_items.load(Ordering::Relaxed),
        dropped = stats.dropped_items.load(Ordering::Relaxed),
        skipped_flushes = stats.skipped_flushes.load(Ordering::Relaxed),
        average_flush_micros = stats.average_flush_micros.load(Ordering::Relaxed),
        last_error = stats.last_error().as_deref().unwrap_or(""),
        "batcher stats"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, config_warnings) = Config::from_env()?;
    init_tracing(&config)?;
    for warning in &config_warnings {
        tracing::warn!("{warning}");
    }
    tracing::info!(
        topics = ?config.mqtt_topics,
        fallback_ip = %config.fallback_ip,
        rollup = config.enable_rollup,
        "starting telemetry pipeline"
    );

    let pool = build_pool(&config.database_url, config.db_pool_size)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PgStore::new(pool.clone()));

    let flush_cancel = CancellationToken::new();
    let readings = Arc::new(Batcher::new(
        "readings",
        store.clone() as Arc<dyn BatchSink<Reading>>,
    ));
    let alert_logs = Arc::new(Batcher::new(
        "alert_logs",
        store.clone() as Arc<dyn BatchSink<AlertLogRecord>>,
    ));
    let flushers = vec![
        readings
            .clone()
            .spawn_flusher(config.reading_flush_interval(), flush_cancel.clone()),
        alert_logs
            .clone()
            .spawn_flusher(config.alert_flush_interval(), flush_cancel.clone()),
    ];

    let shutdown = CancellationToken::new();
    let rules = Arc::new(RuleSnapshotStore::new(
        store.clone() as Arc<dyn RuleSource>,
        config.default_alert_interval_minutes,
    ));
    if let Err(err) = rules.refresh().await {
        tracing::warn!(error = %err, "initial alert rule load failed; starting with no rules");
    }
    let refresher = rules
        .clone()
        .spawn_refresher(config.rule_refresh_interval(), shutdown.clone());

    let (status_tx, status_handle) = spawn_status_writer(store.clone() as Arc<dyn DeviceRegistry>);
    let reconciler = spawn_status_reconciler(
        store.clone() as Arc<dyn DeviceRegistry>,
        status_tx.clone(),
        config.debounce_policy().offline_after,
        config.status_reconcile_interval(),
        shutdown.clone(),
    );
    let ingestor = TelemetryIngestor::new(
        config.debounce_policy(),
        AlertEvaluator::new(rules),
        readings.clone(),
        alert_logs.clone(),
        status_tx,
    );
    let (tx, rx) = mpsc::channel::<Vec<Reading>>(config.ingest_queue.max(1));
    let ingest_handle = tokio::spawn(ingestor.run(rx));

    let rollup_handle = if config.enable_rollup {
        let aggregator = Arc::new(RollupAggregator::new(
            store.clone() as Arc<dyn RollupStore>,
            config.rollup_window_seconds as i64,
            config.rollup_device_batch,
        ));
        Some(aggregator.spawn(config.rollup_interval(), shutdown.clone()))
    } else {
        None
    };

    let mut mqtt_handle = {
        let config = config.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move { mqtt::run_listener(config, tx, cancel).await })
    };

    let mut mqtt_finished = false;
    tokio::select! {
        res = &mut mqtt_handle => {
            mqtt_finished = true;
            match res {
                Ok(Ok(())) => tracing::warn!("MQTT listener exited"),
                Ok(Err(err)) => tracing::error!(error = %err, "MQTT listener failed"),
                Err(err) => tracing::error!(error = %err, "MQTT task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    shutdown.cancel();
    if !mqtt_finished {
        if let Err(err) = mqtt_handle.await {
            tracing::warn!(error = %err, "MQTT task failed during shutdown");
        }
    }
    match ingest_handle.await {
        Ok(counters) => tracing::info!(?counters, "ingest totals"),
        Err(err) => tracing::warn!(error = %err, "ingest task failed"),
    }
    let _ = reconciler.await;
    let _ = status_handle.await;
    let _ = refresher.await;
    if let Some(handle) = rollup_handle {
        let _ = handle.await;
    }

    flush_cancel.cancel();
    future::join_all(flushers).await;
    log_batch_stats(readings.name(), &readings.stats());
    log_batch_stats(alert_logs.name(), &alert_logs.stats());

    pool.close().await;
    tracing::info!("telemetry pipeline stopped");
    Ok(())
}
