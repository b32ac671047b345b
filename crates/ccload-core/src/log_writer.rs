//! Bounded-channel, batched log writer. Entries that arrive when the
//! channel is full are dropped (never block the request path) and counted;
//! on shutdown the writer drains whatever is buffered but stops retrying
//! so graceful shutdown isn't held hostage by a flaky storage backend.

use ccload_storage::{LogEntry, Storage};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

const BATCH_SIZE: usize = 64;
const BATCH_INTERVAL: Duration = Duration::from_millis(500);

pub struct AsyncLogWriter {
    sender: mpsc::Sender<LogEntry>,
    dropped: Arc<AtomicU64>,
    draining: Arc<AtomicBool>,
}

impl AsyncLogWriter {
    pub fn spawn(storage: Arc<dyn Storage>, buffer: usize, workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<LogEntry>(buffer.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let draining = Arc::new(AtomicBool::new(false));
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let storage = storage.clone();
            let draining = draining.clone();
            tokio::spawn(async move {
                worker_loop(rx, storage, draining).await;
            });
        }

        Self {
            sender: tx,
            dropped,
            draining,
        }
    }

    /// Never blocks: on a full channel, drops the entry and bumps the
    /// drop counter. A no-op entirely once draining has started.
    pub fn add_log_async(&self, entry: LogEntry) {
        if self.draining.load(Ordering::Relaxed) {
            return;
        }
        if self.sender.try_send(entry).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }
}

async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<LogEntry>>>,
    storage: Arc<dyn Storage>,
    draining: Arc<AtomicBool>,
) {
    let mut batch = Vec::with_capacity(BATCH_SIZE);
    loop {
        let entry = {
            let mut guard = rx.lock().await;
            tokio::select! {
                biased;
                entry = guard.recv() => entry,
                _ = tokio::time::sleep(BATCH_INTERVAL), if !batch.is_empty() => None,
            }
        };

        match entry {
            Some(entry) => {
                batch.push(entry);
                if batch.len() >= BATCH_SIZE {
                    flush(&storage, &mut batch, &draining).await;
                }
            }
            None => {
                if !batch.is_empty() {
                    flush(&storage, &mut batch, &draining).await;
                }
                if draining.load(Ordering::Relaxed) {
                    // Channel closed (all senders dropped) and nothing left
                    // to flush: exit, no retries in drain state.
                    break;
                }
            }
        }
    }
}

async fn flush(storage: &Arc<dyn Storage>, batch: &mut Vec<LogEntry>, draining: &AtomicBool) {
    if batch.is_empty() {
        return;
    }
    let entries = std::mem::take(batch);
    if let Err(err) = storage.batch_add_logs(entries).await {
        if !draining.load(Ordering::Relaxed) {
            warn!(error = %err, "failed to flush log batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccload_protocol::UsageTuple;
    use ccload_storage::InMemoryStorage;
    use time::OffsetDateTime;

    fn sample_entry() -> LogEntry {
        LogEntry {
            timestamp: OffsetDateTime::now_utc(),
            model: "claude-3-opus".into(),
            channel_id: 1,
            status: 200,
            duration_ms: 10,
            is_stream: false,
            masked_key: "sk-***abcd".into(),
            token_id: None,
            usage: UsageTuple::default(),
            cost_micro_usd: 0,
            message: None,
        }
    }

    #[tokio::test]
    async fn dropped_entries_are_counted_when_channel_is_full() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let writer = AsyncLogWriter::spawn(storage, 1, 0);
        writer.begin_drain(); // prevent workers from draining the channel during the test
        for _ in 0..5 {
            writer.add_log_async(sample_entry());
        }
        assert!(writer.dropped_count() > 0);
    }
}
