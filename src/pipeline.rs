use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Destination of a drained batch. One call per flush; the implementation
/// decides how many statements that takes.
#[async_trait]
pub trait BatchSink<T>: Send + Sync {
    async fn write_batch(&self, items: &[T]) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    /// Another flush was in flight; the queue is left for the next tick.
    Skipped,
    Flushed { len: usize, written: u64 },
    /// The sink failed. The drained items are gone.
    Dropped { len: usize },
}

#[derive(Debug)]
pub struct BatchStats {
    pub queue_depth: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub inflight_flushes: AtomicU64,
    pub skipped_flushes: AtomicU64,
    pub written_items: AtomicU64,
    pub dropped_items: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl BatchStats {
    pub fn new() -> Self {
        Self {
            queue_depth: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            inflight_flushes: AtomicU64::new(0),
            skipped_flushes: AtomicU64::new(0),
            written_items: AtomicU64::new(0),
            dropped_items: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}

impl Default for BatchStats {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory queue drained as a whole on every flush, with at most one flush
/// in flight. Used for both raw readings and alert log rows.
pub struct Batcher<T> {
    name: &'static str,
    queue: Mutex<Vec<T>>,
    flushing: AtomicBool,
    sink: Arc<dyn BatchSink<T>>,
    stats: Arc<BatchStats>,
}

struct FlushingGuard<'a>(&'a AtomicBool);

impl Drop for FlushingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T: Send + Sync + 'static> Batcher<T> {
    pub fn new(name: &'static str, sink: Arc<dyn BatchSink<T>>) -> Self {
        Self {
            name,
            queue: Mutex::new(Vec::new()),
            flushing: AtomicBool::new(false),
            sink,
            stats: Arc::new(BatchStats::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> Arc<BatchStats> {
        self.stats.clone()
    }

    #[cfg(test)]
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn enqueue(&self, item: T) {
        let depth = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.push(item);
            queue.len()
        };
        self.stats.queue_depth.store(depth as u64, Ordering::Relaxed);
        tracing::trace!(batcher = self.name, queue_depth = depth, "queued item");
    }

    pub async fn try_flush(&self) -> FlushOutcome {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.stats.skipped_flushes.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(batcher = self.name, "flush already in flight; skipping tick");
            return FlushOutcome::Skipped;
        }
        let _guard = FlushingGuard(&self.flushing);

        let items = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *queue)
        };
        self.stats.queue_depth.store(0, Ordering::Relaxed);
        if items.is_empty() {
            return FlushOutcome::Empty;
        }

        let len = items.len();
        let started = Instant::now();
        self.stats.inflight_flushes.fetch_add(1, Ordering::Relaxed);
        let result = self.sink.write_batch(&items).await;
        self.stats.inflight_flushes.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(written) => {
                self.stats
                    .last_batch_len
                    .store(len as u64, Ordering::Relaxed);
                self.stats.written_items.fetch_add(written, Ordering::Relaxed);
                let now = Utc::now().timestamp_millis() as u64;
                self.stats.last_flush_unix_ms.store(now, Ordering::Relaxed);
                let micros = started.elapsed().as_micros() as u64;
                let prev = self.stats.average_flush_micros.load(Ordering::Relaxed);
                let avg = if prev == 0 {
                    micros
                } else {
                    (prev + micros) / 2
                };
                self.stats.average_flush_micros.store(avg, Ordering::Relaxed);
                self.stats.clear_error();
                tracing::debug!(batcher = self.name, len, written, micros, "flushed batch");
                FlushOutcome::Flushed { len, written }
            }
            Err(err) => {
                self.stats.record_error(err.to_string());
                self.stats
                    .dropped_items
                    .fetch_add(len as u64, Ordering::Relaxed);
                tracing::error!(batcher = self.name, error = %err, dropped = len, "batch insert failed; dropping batch");
                FlushOutcome::Dropped { len }
            }
        }
    }

    /// Final flush on shutdown. Waits for an in-flight flush to finish, up to a
    /// bounded time, before draining what is left.
    pub async fn flush_remaining(&self) -> FlushOutcome {
        let attempt = async {
            loop {
                match self.try_flush().await {
                    FlushOutcome::Skipped => tokio::time::sleep(SHUTDOWN_RETRY_DELAY).await,
                    outcome => return outcome,
                }
            }
        };
        match tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(batcher = self.name, pending = self.len(), "timed out waiting for in-flight flush");
                FlushOutcome::Skipped
            }
        }
    }

    /// Flushes on every tick until `cancel` fires, then makes one last
    /// attempt. Each tick's flush runs on its own task so that a slow insert
    /// shows up as skipped ticks rather than a delayed timer.
    pub fn spawn_flusher(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let batcher = self.clone();
                        tokio::spawn(async move {
                            batcher.try_flush().await;
                        });
                    }
                }
            }
            let outcome = self.flush_remaining().await;
            tracing::info!(batcher = self.name, ?outcome, "batcher stopped");
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::anyhow;
    use tokio::sync::Notify;

    /// Sink that records every batch it receives and can be told to fail.
    pub(crate) struct RecordingSink<T> {
        pub batches: Mutex<Vec<Vec<T>>>,
        pub fail: AtomicBool,
    }

    impl<T> Default for RecordingSink<T> {
        fn default() -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            }
        }
    }

    impl<T: Clone> RecordingSink<T> {
        pub fn batches(&self) -> Vec<Vec<T>> {
            self.batches.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl<T: Clone + Send + Sync> BatchSink<T> for RecordingSink<T> {
        async fn write_batch(&self, items: &[T]) -> Result<u64> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("connection reset"));
            }
            self.batches.lock().expect("lock").push(items.to_vec());
            Ok(items.len() as u64)
        }
    }

    struct GatedSink {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl BatchSink<u32> for GatedSink {
        async fn write_batch(&self, items: &[u32]) -> Result<u64> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(items.len() as u64)
        }
    }

    #[tokio::test]
    async fn flush_drains_the_whole_queue_in_one_write() {
        let sink = Arc::new(RecordingSink::<u32>::default());
        let batcher = Batcher::<u32>::new("test", sink.clone());
        for i in 0..5 {
            batcher.enqueue(i);
        }

        let outcome = batcher.try_flush().await;
        assert_eq!(outcome, FlushOutcome::Flushed { len: 5, written: 5 });
        assert_eq!(sink.batches(), vec![vec![0, 1, 2, 3, 4]]);
        assert!(batcher.is_empty());
        assert!(!batcher.is_flushing());
    }

    #[tokio::test]
    async fn stats_track_queue_depth_and_last_flush() {
        let sink = Arc::new(RecordingSink::<u32>::default());
        let batcher = Batcher::<u32>::new("test", sink.clone());
        batcher.enqueue(1);
        batcher.enqueue(2);
        let stats = batcher.stats();
        assert_eq!(stats.queue_depth.load(Ordering::Relaxed), 2);
        assert_eq!(stats.last_flush_unix_ms.load(Ordering::Relaxed), 0);

        batcher.try_flush().await;
        assert_eq!(stats.queue_depth.load(Ordering::Relaxed), 0);
        assert_eq!(stats.last_batch_len.load(Ordering::Relaxed), 2);
        assert_eq!(stats.inflight_flushes.load(Ordering::Relaxed), 0);
        assert!(stats.last_flush_unix_ms.load(Ordering::Relaxed) > 0);
        assert_eq!(stats.written_items.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn empty_queue_does_not_touch_the_sink() {
        let sink = Arc::new(RecordingSink::<u32>::default());
        let batcher = Batcher::<u32>::new("test", sink.clone());
        assert_eq!(batcher.try_flush().await, FlushOutcome::Empty);
        assert!(sink.batches().is_empty());
    }

    #[tokio::test]
    async fn failed_batch_is_dropped_not_requeued() {
        let sink = Arc::new(RecordingSink::<u32>::default());
        let batcher = Batcher::<u32>::new("test", sink.clone());
        batcher.enqueue(1);
        batcher.enqueue(2);
        sink.fail.store(true, Ordering::SeqCst);

        assert_eq!(batcher.try_flush().await, FlushOutcome::Dropped { len: 2 });
        assert!(batcher.is_empty());
        assert_eq!(batcher.stats().dropped_items.load(Ordering::Relaxed), 2);
        assert!(batcher.stats().last_error().is_some());

        sink.fail.store(false, Ordering::SeqCst);
        batcher.enqueue(3);
        assert_eq!(
            batcher.try_flush().await,
            FlushOutcome::Flushed { len: 1, written: 1 }
        );
        assert_eq!(sink.batches(), vec![vec![3]]);
        assert!(batcher.stats().last_error().is_none());
    }

    #[tokio::test]
    async fn concurrent_flush_is_skipped_while_one_is_in_flight() {
        let sink = Arc::new(GatedSink {
            started: Notify::new(),
            release: Notify::new(),
        });
        let batcher = Arc::new(Batcher::new("test", sink.clone() as Arc<dyn BatchSink<u32>>));
        batcher.enqueue(1);
        assert!(!batcher.is_flushing());

        let first = {
            let batcher = batcher.clone();
            tokio::spawn(async move { batcher.try_flush().await })
        };
        sink.started.notified().await;
        assert!(batcher.is_flushing());

        batcher.enqueue(2);
        assert_eq!(batcher.try_flush().await, FlushOutcome::Skipped);
        assert_eq!(batcher.len(), 1);
        assert_eq!(batcher.stats().skipped_flushes.load(Ordering::Relaxed), 1);

        sink.release.notify_one();
        let outcome = first.await.expect("join");
        assert_eq!(outcome, FlushOutcome::Flushed { len: 1, written: 1 });
        assert!(!batcher.is_flushing());

        let second = {
            let batcher = batcher.clone();
            tokio::spawn(async move { batcher.try_flush().await })
        };
        sink.started.notified().await;
        sink.release.notify_one();
        assert_eq!(
            second.await.expect("join"),
            FlushOutcome::Flushed { len: 1, written: 1 }
        );
    }

    #[tokio::test]
    async fn flusher_drains_on_cancel() {
        let sink = Arc::new(RecordingSink::<u32>::default());
        let batcher = Arc::new(Batcher::new("test", sink.clone() as Arc<dyn BatchSink<u32>>));
        let cancel = CancellationToken::new();
        let handle = batcher
            .clone()
            .spawn_flusher(Duration::from_secs(3600), cancel.clone());

        // Let the immediate first tick run before enqueueing.
        tokio::task::yield_now().await;
        batcher.enqueue(7);
        cancel.cancel();
        handle.await.expect("join");

        let written: Vec<u32> = sink.batches().into_iter().flatten().collect();
        assert_eq!(written, vec![7]);
    }
}
