use super::liveness::{DebouncePolicy, LivenessCache, PersistDecision};
use super::StatusChange;
use crate::alerts::{AlertEvaluator, AlertLogRecord};
use crate::pipeline::Batcher;
use crate::telemetry::Reading;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub persisted: bool,
    pub alerts: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestCounters {
    pub received: u64,
    pub persisted: u64,
    pub debounced: u64,
    pub alerts: u64,
    pub went_offline: u64,
}

/// Owns the per-device state and the evaluator cooldowns. Only the task
/// running [`TelemetryIngestor::run`] touches them.
pub struct TelemetryIngestor {
    liveness: LivenessCache,
    evaluator: AlertEvaluator,
    readings: Arc<Batcher<Reading>>,
    alert_logs: Arc<Batcher<AlertLogRecord>>,
    status_tx: mpsc::UnboundedSender<StatusChange>,
    counters: IngestCounters,
}

impl TelemetryIngestor {
    pub fn new(
        policy: DebouncePolicy,
        evaluator: AlertEvaluator,
        readings: Arc<Batcher<Reading>>,
        alert_logs: Arc<Batcher<AlertLogRecord>>,
        status_tx: mpsc::UnboundedSender<StatusChange>,
    ) -> Self {
        Self {
            liveness: LivenessCache::new(policy),
            evaluator,
            readings,
            alert_logs,
            status_tx,
            counters: IngestCounters::default(),
        }
    }

    #[cfg(test)]
    pub fn counters(&self) -> IngestCounters {
        self.counters
    }

    pub fn ingest(&mut self, reading: Reading) -> IngestOutcome {
        let now = reading.captured_at;
        self.counters.received += 1;

        let observation = self.liveness.observe(&reading.device_id, now);
        if observation.came_online {
            tracing::debug!(device = %reading.device_id, "device online");
            self.send_status(StatusChange::online(reading.device_id.as_str()));
        }

        let alerts = self.evaluator.evaluate(&reading, now);
        let alert_count = alerts.len();
        for record in alerts {
            self.alert_logs.enqueue(record);
        }
        self.counters.alerts += alert_count as u64;

        let persisted = observation.decision == PersistDecision::Persist;
        if persisted {
            self.counters.persisted += 1;
            self.readings.enqueue(reading);
        } else {
            self.counters.debounced += 1;
            tracing::trace!(
                device = %reading.device_id,
                min_interval_ms = observation.min_interval.num_milliseconds(),
                "debounced reading"
            );
        }

        IngestOutcome {
            persisted,
            alerts: alert_count,
        }
    }

    pub fn expire(&mut self, device_id: &str) {
        self.counters.went_offline += 1;
        tracing::info!(device = %device_id, "device went offline");
        self.send_status(StatusChange::offline(device_id));
    }

    fn send_status(&self, change: StatusChange) {
        if self.status_tx.send(change).is_err() {
            tracing::warn!("status writer is gone; dropping status change");
        }
    }

    /// Processes normalized readings until the channel closes, interleaved
    /// with offline expiries. Due expiries are handled before queued readings
    /// so a busy channel cannot hold them back. Pending expiries are abandoned
    /// on exit.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Vec<Reading>>) -> IngestCounters {
        loop {
            tokio::select! {
                biased;
                device_id = self.liveness.next_expired() => {
                    self.expire(&device_id);
                }
                batch = rx.recv() => {
                    let Some(readings) = batch else {
                        break;
                    };
                    for reading in readings {
                        self.ingest(reading);
                    }
                }
            }
        }
        tracing::info!(counters = ?self.counters, tracked_devices = self.liveness.len(), "ingest loop stopped");
        self.counters
    }
}
