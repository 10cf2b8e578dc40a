use crate::model::{now_millis, EventRow};
use anyhow::Result;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Durable destination for classified events.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync + 'static {
    /// Writes the batch atomically.
    async fn write_batch(&self, batch: &[EventRow]) -> Result<()>;
}

#[derive(Debug)]
pub enum BatchCommand {
    Event(EventRow),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_queue: usize,
}

/// Producer side of one connection's batcher. Dropping every clone flushes
/// what is left and stops the worker.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<BatchCommand>,
    stats: Arc<IngestStats>,
}

impl PipelineHandle {
    /// Queues one event without waiting. Returns `false` when the queue is full
    /// and the event was dropped.
    pub fn enqueue(&self, row: EventRow) -> bool {
        self.stats.queue_depth.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(BatchCommand::Event(row)) {
            Ok(()) => true,
            Err(err) => {
                self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "event queue full; dropping event");
                false
            }
        }
    }

    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(BatchCommand::Flush(tx)).await;
        let _ = rx.await;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub queue_depth: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub inflight_flushes: AtomicU64,
    pub events_written: AtomicU64,
    pub events_dropped: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub records_accepted: AtomicU64,
    pub records_ignored: AtomicU64,
    pub lines_malformed: AtomicU64,
    pub active_subscribers: AtomicU64,
    /// Most recent write failure, tagged with the batcher that hit it.
    pub last_error: Mutex<Option<(String, String)>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStatsSnapshot {
    pub queue_depth: u64,
    pub last_flush_unix_ms: u64,
    pub last_batch_len: u64,
    pub average_flush_ms: f64,
    pub inflight_flushes: u64,
    pub events_written: u64,
    pub events_dropped: u64,
    pub batches_dropped: u64,
    pub records_accepted: u64,
    pub records_ignored: u64,
    pub lines_malformed: u64,
    pub active_subscribers: u64,
    pub last_error: Option<String>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, label: &str, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some((label.to_string(), err.into()));
        }
    }

    /// Clears the last error only if `label` recorded it; a healthy tenant
    /// must not hide another tenant's failure.
    pub fn clear_error(&self, label: &str) {
        if let Ok(mut guard) = self.last_error.lock() {
            if guard.as_ref().is_some_and(|(owner, _)| owner == label) {
                *guard = None;
            }
        }
    }

    pub fn snapshot(&self) -> IngestStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        IngestStatsSnapshot {
            queue_depth: load(&self.queue_depth),
            last_flush_unix_ms: load(&self.last_flush_unix_ms),
            last_batch_len: load(&self.last_batch_len),
            average_flush_ms: load(&self.average_flush_micros) as f64 / 1000.0,
            inflight_flushes: load(&self.inflight_flushes),
            events_written: load(&self.events_written),
            events_dropped: load(&self.events_dropped),
            batches_dropped: load(&self.batches_dropped),
            records_accepted: load(&self.records_accepted),
            records_ignored: load(&self.records_ignored),
            lines_malformed: load(&self.lines_malformed),
            active_subscribers: load(&self.active_subscribers),
            last_error: self
                .last_error
                .lock()
                .ok()
                .and_then(|guard| guard.as_ref().map(|(label, err)| format!("{label}: {err}"))),
        }
    }
}

/// Starts one connection's batcher.
///
/// A batch is flushed when the debounce interval has elapsed since the first
/// unflushed event, or as soon as `batch_size` events are queued, whichever
/// comes first. The worker task owns the buffer, so both triggers act on the
/// same queue and a batch can never be written twice.
pub fn spawn_worker(
    sink: Arc<dyn EventSink>,
    stats: Arc<IngestStats>,
    settings: BatchSettings,
    label: String,
) -> (PipelineHandle, JoinHandle<()>) {
    let batch_size = settings.batch_size.max(1);
    let (tx, mut rx) = mpsc::channel::<BatchCommand>(settings.max_queue.max(batch_size));
    let handle = PipelineHandle {
        tx,
        stats: stats.clone(),
    };

    let task = tokio::spawn(async move {
        let mut buffer: Vec<EventRow> = Vec::with_capacity(batch_size);
        let debounce = tokio::time::sleep(settings.flush_interval);
        tokio::pin!(debounce);
        let mut armed = false;

        loop {
            tokio::select! {
                _ = &mut debounce, if armed => {
                    armed = false;
                    flush(sink.as_ref(), &mut buffer, &stats, &label).await;
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(BatchCommand::Event(row)) => {
                            stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            buffer.push(row);
                            if buffer.len() >= batch_size {
                                armed = false;
                                flush(sink.as_ref(), &mut buffer, &stats, &label).await;
                            } else if !armed {
                                debounce
                                    .as_mut()
                                    .reset(tokio::time::Instant::now() + settings.flush_interval);
                                armed = true;
                            }
                        }
                        Some(BatchCommand::Flush(done)) => {
                            armed = false;
                            flush(sink.as_ref(), &mut buffer, &stats, &label).await;
                            let _ = done.send(());
                        }
                        None => {
                            flush(sink.as_ref(), &mut buffer, &stats, &label).await;
                            break;
                        }
                    }
                }
            }
        }
    });

    (handle, task)
}

async fn flush(
    sink: &dyn EventSink,
    buffer: &mut Vec<EventRow>,
    stats: &Arc<IngestStats>,
    label: &str,
) {
    if buffer.is_empty() {
        return;
    }

    // Swap the queue out before awaiting so later events start a fresh batch.
    let items = std::mem::take(buffer);
    let len = items.len();
    let started = Instant::now();
    stats.inflight_flushes.fetch_add(1, Ordering::Relaxed);
    let result = sink.write_batch(&items).await;
    stats.inflight_flushes.fetch_sub(1, Ordering::Relaxed);

    match result {
        Ok(()) => {
            stats.events_written.fetch_add(len as u64, Ordering::Relaxed);
            stats.last_batch_len.store(len as u64, Ordering::Relaxed);
            stats
                .last_flush_unix_ms
                .store(now_millis().max(0) as u64, Ordering::Relaxed);
            let micros = started.elapsed().as_micros() as u64;
            let prev = stats.average_flush_micros.load(Ordering::Relaxed);
            let avg = if prev == 0 { micros } else { (prev + micros) / 2 };
            stats.average_flush_micros.store(avg, Ordering::Relaxed);
            stats.clear_error(label);
            tracing::debug!(tenant = %label, len, micros, "flushed event batch");
        }
        Err(err) => {
            // At-most-once: the batch is not retried.
            stats.record_error(label, format!("{err:#}"));
            stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
            stats.events_dropped.fetch_add(len as u64, Ordering::Relaxed);
            tracing::error!(tenant = %label, len, error = %format!("{err:#}"), "failed to write event batch; dropping it");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// Sink that keeps every batch in memory.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) batches: Mutex<Vec<Vec<EventRow>>>,
        pub(crate) fail_next: AtomicBool,
        pub(crate) delay: Option<Duration>,
    }

    impl RecordingSink {
        pub(crate) fn batch_sizes(&self) -> Vec<usize> {
            self.batches
                .lock()
                .expect("batches lock")
                .iter()
                .map(Vec::len)
                .collect()
        }

        pub(crate) fn all_rows(&self) -> Vec<EventRow> {
            self.batches
                .lock()
                .expect("batches lock")
                .iter()
                .flatten()
                .cloned()
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl EventSink for RecordingSink {
        async fn write_batch(&self, batch: &[EventRow]) -> Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_next.swap(false, Ordering::SeqCst) {
                anyhow::bail!("simulated write failure");
            }
            self.batches
                .lock()
                .expect("batches lock")
                .push(batch.to_vec());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use crate::store::event_row;

    fn settings() -> BatchSettings {
        BatchSettings {
            batch_size: 50,
            flush_interval: Duration::from_millis(200),
            max_queue: 5_000,
        }
    }

    fn start(sink: Arc<RecordingSink>) -> (PipelineHandle, JoinHandle<()>, Arc<IngestStats>) {
        let stats = Arc::new(IngestStats::new());
        let (handle, task) = spawn_worker(sink, stats.clone(), settings(), "t1".to_string());
        (handle, task, stats)
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_flushes_once_with_exactly_the_queued_events() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, _task, stats) = start(sink.clone());

        for ts in 1..=3 {
            assert!(handle.enqueue(event_row("t1", "d", ts)));
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(sink.batch_sizes().is_empty(), "flushed before the debounce elapsed");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.batch_sizes(), vec![3]);
        let stamps: Vec<i64> = sink.all_rows().iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![1, 2, 3]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.batch_sizes(), vec![3]);
        assert_eq!(stats.snapshot().events_written, 3);
        assert_eq!(stats.snapshot().queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn size_threshold_flushes_immediately_without_double_flush() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, _task, _stats) = start(sink.clone());

        for ts in 0..50 {
            assert!(handle.enqueue(event_row("t1", "d", ts)));
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sink.batch_sizes(), vec![50]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.batch_sizes(), vec![50]);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_past_threshold_starts_a_new_debounce_window() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, _task, _stats) = start(sink.clone());

        for ts in 0..53 {
            handle.enqueue(event_row("t1", "d", ts));
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sink.batch_sizes(), vec![50]);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(sink.batch_sizes(), vec![50, 3]);
        let rows = sink.all_rows();
        assert_eq!(rows.len(), 53);
        assert!(rows.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test(start_paused = true)]
    async fn events_arriving_during_a_write_are_not_lost() {
        let sink = Arc::new(RecordingSink {
            delay: Some(Duration::from_millis(500)),
            ..Default::default()
        });
        let (handle, _task, _stats) = start(sink.clone());

        for ts in 0..50 {
            handle.enqueue(event_row("t1", "d", ts));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        for ts in 50..53 {
            handle.enqueue(event_row("t1", "d", ts));
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.batch_sizes(), vec![50, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_drops_the_batch_and_keeps_going() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail_next.store(true, Ordering::SeqCst);
        let (handle, _task, stats) = start(sink.clone());

        handle.enqueue(event_row("t1", "d", 1));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(sink.batch_sizes().is_empty());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.batches_dropped, 1);
        assert_eq!(snapshot.events_dropped, 1);
        assert!(snapshot.last_error.is_some());

        handle.enqueue(event_row("t1", "d", 2));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.batch_sizes(), vec![1]);
        assert_eq!(sink.all_rows()[0].timestamp, 2);
        assert!(stats.snapshot().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn one_tenants_success_keeps_another_tenants_write_error() {
        let failing = Arc::new(RecordingSink::default());
        failing.fail_next.store(true, Ordering::SeqCst);
        let healthy = Arc::new(RecordingSink::default());
        let stats = Arc::new(IngestStats::new());
        let (bad, _bad_task) =
            spawn_worker(failing.clone(), stats.clone(), settings(), "bad".to_string());
        let (good, _good_task) =
            spawn_worker(healthy.clone(), stats.clone(), settings(), "good".to_string());

        bad.enqueue(event_row("bad", "d", 1));
        bad.flush().await.expect("flush");
        assert_eq!(
            stats.snapshot().last_error.as_deref(),
            Some("bad: simulated write failure")
        );

        good.enqueue(event_row("good", "d", 2));
        good.flush().await.expect("flush");
        assert_eq!(healthy.batch_sizes(), vec![1]);
        assert_eq!(
            stats.snapshot().last_error.as_deref(),
            Some("bad: simulated write failure")
        );

        bad.enqueue(event_row("bad", "d", 3));
        bad.flush().await.expect("flush");
        assert_eq!(failing.batch_sizes(), vec![1]);
        assert!(stats.snapshot().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_flushes_pending_events() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, task, _stats) = start(sink.clone());

        handle.enqueue(event_row("t1", "d", 1));
        handle.enqueue(event_row("t1", "d", 2));
        drop(handle);
        task.await.expect("worker exits");
        assert_eq!(sink.batch_sizes(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_flush_writes_without_waiting() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, _task, _stats) = start(sink.clone());

        handle.enqueue(event_row("t1", "d", 1));
        handle.flush().await.expect("flush");
        assert_eq!(sink.batch_sizes(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_rejects_without_blocking() {
        let sink = Arc::new(RecordingSink::default());
        let stats = Arc::new(IngestStats::new());
        let (handle, _task) = spawn_worker(
            sink,
            stats.clone(),
            BatchSettings {
                batch_size: 2,
                flush_interval: Duration::from_millis(200),
                max_queue: 2,
            },
            "t1".to_string(),
        );

        let accepted = (0..5)
            .filter(|ts| handle.enqueue(event_row("t1", "d", *ts)))
            .count();
        assert_eq!(accepted, 2);
        assert_eq!(stats.snapshot().events_dropped, 3);
    }
}
