use super::rolling::ArrivalWindow;
use super::state::DeviceLivenessEntry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::time::DelayQueue;

#[derive(Debug, Clone)]
pub struct DebouncePolicy {
    pub fast_interval: ChronoDuration,
    pub slow_interval: ChronoDuration,
    /// Devices whose mean arrival gap is below this use `fast_interval`.
    pub high_frequency_gap: ChronoDuration,
    pub arrival_window: usize,
    pub offline_after: Duration,
}

impl Default for DebouncePolicy {
    fn default() -> Self {
        Self {
            fast_interval: ChronoDuration::seconds(1),
            slow_interval: ChronoDuration::seconds(60),
            high_frequency_gap: ChronoDuration::seconds(30),
            arrival_window: 5,
            offline_after: Duration::from_secs(30 * 60),
        }
    }
}

impl DebouncePolicy {
    pub(in crate::ingest) fn min_interval(&self, arrivals: &ArrivalWindow) -> ChronoDuration {
        match arrivals.mean_gap() {
            Some(gap) if gap < self.high_frequency_gap => self.fast_interval,
            _ => self.slow_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistDecision {
    Persist,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub decision: PersistDecision,
    /// True when the device had no entry, either new or back after expiry.
    pub came_online: bool,
    pub min_interval: ChronoDuration,
}

/// Per-device liveness and debounce state with one offline timer per device.
pub struct LivenessCache {
    policy: DebouncePolicy,
    entries: HashMap<String, DeviceLivenessEntry>,
    timers: DelayQueue<String>,
}

impl LivenessCache {
    pub fn new(policy: DebouncePolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
            timers: DelayQueue::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, device_id: &str) -> bool {
        self.entries.contains_key(device_id)
    }

    #[cfg(test)]
    pub fn last_seen(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(device_id).map(|entry| entry.last_seen_at)
    }

    /// Records a message from `device_id` and decides whether its reading is
    /// persisted. Every call pushes the device's offline deadline out by the
    /// full threshold.
    pub fn observe(&mut self, device_id: &str, now: DateTime<Utc>) -> Observation {
        let Some(entry) = self.entries.get_mut(device_id) else {
            let expiry = self
                .timers
                .insert(device_id.to_string(), self.policy.offline_after);
            let mut entry = DeviceLivenessEntry::new(expiry, now, self.policy.arrival_window);
            entry.last_persisted_at = Some(now);
            let min_interval = self.policy.min_interval(&entry.arrivals);
            self.entries.insert(device_id.to_string(), entry);
            return Observation {
                decision: PersistDecision::Persist,
                came_online: true,
                min_interval,
            };
        };

        self.timers.reset(&entry.expiry, self.policy.offline_after);
        entry.last_seen_at = now;
        entry.arrivals.record(now);
        let min_interval = self.policy.min_interval(&entry.arrivals);
        let due = match entry.last_persisted_at {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(last);
                // A clock step backwards restarts the debounce from `now`.
                elapsed < ChronoDuration::zero() || elapsed >= min_interval
            }
        };
        let decision = if due {
            entry.last_persisted_at = Some(now);
            PersistDecision::Persist
        } else {
            PersistDecision::Skip
        };
        Observation {
            decision,
            came_online: false,
            min_interval,
        }
    }

    /// Resolves with the next device whose offline timer ran out, removing
    /// its entry. Pending while no timers are armed. Cancel safe.
    pub async fn next_expired(&mut self) -> String {
        loop {
            if self.timers.is_empty() {
                return std::future::pending().await;
            }
            let expired = std::future::poll_fn(|cx| self.timers.poll_expired(cx)).await;
            if let Some(expired) = expired {
                let device_id = expired.into_inner();
                self.entries.remove(&device_id);
                return device_id;
            }
        }
    }
}
