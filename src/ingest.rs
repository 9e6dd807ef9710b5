mod ingestor;
mod liveness;
mod reconcile;
mod rolling;
mod state;

#[cfg(test)]
mod tests;

pub use ingestor::TelemetryIngestor;
pub use liveness::DebouncePolicy;
pub use reconcile::{spawn_status_reconciler, DeviceActivity};

use crate::store::DeviceRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub device_uid: String,
    pub status: &'static str,
}

impl StatusChange {
    pub fn online(device_uid: impl Into<String>) -> Self {
        Self {
            device_uid: device_uid.into(),
            status: STATUS_ONLINE,
        }
    }

    pub fn offline(device_uid: impl Into<String>) -> Self {
        Self {
            device_uid: device_uid.into(),
            status: STATUS_OFFLINE,
        }
    }
}

/// Applies registry status changes off the ingest loop, in the order they were
/// sent. Exits once every sender is dropped.
pub fn spawn_status_writer(
    registry: Arc<dyn DeviceRegistry>,
) -> (mpsc::UnboundedSender<StatusChange>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<StatusChange>();
    let handle = tokio::spawn(async move {
        while let Some(change) = rx.recv().await {
            match registry
                .set_device_status(&change.device_uid, change.status)
                .await
            {
                Ok(0) => tracing::debug!(device = %change.device_uid, "status change for unregistered device"),
                Ok(_) => tracing::info!(device = %change.device_uid, status = change.status, "device status updated"),
                Err(err) => tracing::warn!(
                    device = %change.device_uid,
                    status = change.status,
                    error = %err,
                    "failed to update device status"
                ),
            }
        }
    });
    (tx, handle)
}
