use super::rolling::ArrivalWindow;
use chrono::{DateTime, Utc};
use tokio_util::time::delay_queue;

#[derive(Debug)]
pub(in crate::ingest) struct DeviceLivenessEntry {
    pub(in crate::ingest) last_seen_at: DateTime<Utc>,
    pub(in crate::ingest) last_persisted_at: Option<DateTime<Utc>>,
    /// Handle of the device's one pending offline timer.
    pub(in crate::ingest) expiry: delay_queue::Key,
    pub(in crate::ingest) arrivals: ArrivalWindow,
}

impl DeviceLivenessEntry {
    pub(in crate::ingest) fn new(expiry: delay_queue::Key, now: DateTime<Utc>, window: usize) -> Self {
        let mut arrivals = ArrivalWindow::new(window);
        arrivals.record(now);
        Self {
            last_seen_at: now,
            last_persisted_at: None,
            expiry,
            arrivals,
        }
    }
}
