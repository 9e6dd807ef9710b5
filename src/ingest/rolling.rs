use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;

/// The last few arrival times of one device, used to estimate how often it
/// reports.
#[derive(Debug, Clone)]
pub(in crate::ingest) struct ArrivalWindow {
    capacity: usize,
    arrivals: VecDeque<DateTime<Utc>>,
}

impl ArrivalWindow {
    pub(in crate::ingest) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            arrivals: VecDeque::with_capacity(capacity),
        }
    }

    pub(in crate::ingest) fn record(&mut self, at: DateTime<Utc>) {
        if self.arrivals.len() == self.capacity {
            self.arrivals.pop_front();
        }
        self.arrivals.push_back(at);
    }

    #[cfg(test)]
    pub(in crate::ingest) fn len(&self) -> usize {
        self.arrivals.len()
    }

    /// Mean gap between consecutive arrivals, or `None` with fewer than two.
    pub(in crate::ingest) fn mean_gap(&self) -> Option<ChronoDuration> {
        if self.arrivals.len() < 2 {
            return None;
        }
        let first = *self.arrivals.front()?;
        let last = *self.arrivals.back()?;
        let gaps = (self.arrivals.len() - 1) as i32;
        Some((last - first) / gaps)
    }
}
