use super::{StatusChange, STATUS_OFFLINE, STATUS_ONLINE};
use crate::store::DeviceRegistry;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::FromRow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// A registered device as seen by the status reconciler.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct DeviceActivity {
    pub device_uid: String,
    pub status: Option<String>,
    pub last_reading_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub devices: usize,
    pub changed: usize,
}

pub fn status_for(
    last_reading_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    offline_after: ChronoDuration,
) -> &'static str {
    match last_reading_at {
        Some(at) if at >= now - offline_after => STATUS_ONLINE,
        _ => STATUS_OFFLINE,
    }
}

/// Recomputes every registered device's status from its newest stored
/// reading. Only differences are sent, through the same channel as the
/// ingest loop's status changes, so registry writes stay ordered.
pub async fn reconcile_statuses(
    registry: &dyn DeviceRegistry,
    status_tx: &mpsc::UnboundedSender<StatusChange>,
    now: DateTime<Utc>,
    offline_after: ChronoDuration,
) -> Result<ReconcileReport> {
    let devices = registry
        .device_activity()
        .await
        .context("failed to load device activity")?;
    let mut report = ReconcileReport {
        devices: devices.len(),
        changed: 0,
    };
    for device in devices {
        let status = status_for(device.last_reading_at, now, offline_after);
        if device.status.as_deref() == Some(status) {
            continue;
        }
        let change = StatusChange {
            device_uid: device.device_uid,
            status,
        };
        if status_tx.send(change).is_err() {
            tracing::warn!("status writer is gone; stopping reconciliation pass");
            break;
        }
        report.changed += 1;
    }
    Ok(report)
}

/// Reconciles once immediately, then every `period` until `cancel` fires.
/// Covers devices that were online before a restart and never report again.
pub fn spawn_status_reconciler(
    registry: Arc<dyn DeviceRegistry>,
    status_tx: mpsc::UnboundedSender<StatusChange>,
    offline_after: Duration,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let offline_after = ChronoDuration::from_std(offline_after).unwrap_or(ChronoDuration::minutes(30));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match reconcile_statuses(registry.as_ref(), &status_tx, Utc::now(), offline_after).await {
                        Ok(report) if report.changed > 0 => {
                            tracing::info!(devices = report.devices, changed = report.changed, "device statuses reconciled");
                        }
                        Ok(report) => tracing::debug!(devices = report.devices, "device statuses unchanged"),
                        Err(err) => tracing::error!(error = %format!("{err:#}"), "device status reconciliation failed"),
                    }
                }
            }
        }
    })
}
