//! Process-local, in-memory registry of in-flight requests. Never
//! persisted; purely for observability (an admin "what's happening right
//! now" view).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Debug)]
pub struct ActiveRequest {
    pub id: u64,
    pub model: String,
    pub client_ip: String,
    pub start: Instant,
    pub is_stream: bool,
    pub channel_id: AtomicI64,
    pub channel_name: RwLock<String>,
    pub masked_key: RwLock<String>,
    pub token_id: Option<i64>,
    pub bytes_received: AtomicU64,
    /// Microseconds since `start`; `-1` until the first byte arrives.
    pub first_byte_micros: AtomicI64,
}

impl ActiveRequest {
    pub fn add_bytes(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    /// CAS so the first caller wins even under concurrent reads/writes.
    pub fn set_first_byte_once(&self) {
        let elapsed = self.start.elapsed().as_micros() as i64;
        let _ = self
            .first_byte_micros
            .compare_exchange(-1, elapsed, Ordering::Relaxed, Ordering::Relaxed);
    }

    /// Called whenever the orchestrator switches to a new channel/key:
    /// resets the byte/first-byte counters so observers see the *current*
    /// attempt, not a stale one.
    pub fn reset_for_new_attempt(&self, channel_id: i64, channel_name: String, masked_key: String) {
        self.channel_id.store(channel_id, Ordering::Relaxed);
        *self.channel_name.write().unwrap() = channel_name;
        *self.masked_key.write().unwrap() = masked_key;
        self.bytes_received.store(0, Ordering::Relaxed);
        self.first_byte_micros.store(-1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct ActiveRequestSnapshot {
    pub id: u64,
    pub model: String,
    pub client_ip: String,
    pub start_millis_ago: u128,
    pub is_stream: bool,
    pub channel_id: i64,
    pub channel_name: String,
    pub masked_key: String,
    pub bytes_received: u64,
    pub first_byte_micros: Option<i64>,
}

pub struct ActiveRequestTracker {
    next_id: AtomicU64,
    entries: RwLock<HashMap<u64, Arc<ActiveRequest>>>,
}

impl ActiveRequestTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, model: String, client_ip: String, is_stream: bool, token_id: Option<i64>) -> Arc<ActiveRequest> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(ActiveRequest {
            id,
            model,
            client_ip,
            start: Instant::now(),
            is_stream,
            channel_id: AtomicI64::new(0),
            channel_name: RwLock::new(String::new()),
            masked_key: RwLock::new(String::new()),
            token_id,
            bytes_received: AtomicU64::new(0),
            first_byte_micros: AtomicI64::new(-1),
        });
        self.entries.write().unwrap().insert(id, entry.clone());
        entry
    }

    pub fn remove(&self, id: u64) {
        self.entries.write().unwrap().remove(&id);
    }

    pub fn list(&self) -> Vec<ActiveRequestSnapshot> {
        let entries = self.entries.read().unwrap();
        let mut snapshots: Vec<ActiveRequestSnapshot> = entries
            .values()
            .map(|e| ActiveRequestSnapshot {
                id: e.id,
                model: e.model.clone(),
                client_ip: e.client_ip.clone(),
                start_millis_ago: e.start.elapsed().as_millis(),
                is_stream: e.is_stream,
                channel_id: e.channel_id.load(Ordering::Relaxed),
                channel_name: e.channel_name.read().unwrap().clone(),
                masked_key: e.masked_key.read().unwrap().clone(),
                bytes_received: e.bytes_received.load(Ordering::Relaxed),
                first_byte_micros: {
                    let v = e.first_byte_micros.load(Ordering::Relaxed);
                    if v < 0 { None } else { Some(v) }
                },
            })
            .collect();
        snapshots.sort_by(|a, b| b.start_millis_ago.cmp(&a.start_millis_ago).then(b.id.cmp(&a.id)));
        snapshots
    }
}

impl Default for ActiveRequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_remove_round_trips() {
        let tracker = ActiveRequestTracker::new();
        let entry = tracker.register("claude-3-opus".into(), "127.0.0.1".into(), true, None);
        assert_eq!(tracker.list().len(), 1);
        tracker.remove(entry.id);
        assert_eq!(tracker.list().len(), 0);
    }

    #[test]
    fn reset_for_new_attempt_clears_byte_counters() {
        let tracker = ActiveRequestTracker::new();
        let entry = tracker.register("m".into(), "ip".into(), false, None);
        entry.add_bytes(500);
        entry.set_first_byte_once();
        entry.reset_for_new_attempt(2, "chan-2".into(), "sk-***abcd".into());
        assert_eq!(entry.bytes_received.load(Ordering::Relaxed), 0);
        assert_eq!(entry.first_byte_micros.load(Ordering::Relaxed), -1);
    }

    #[test]
    fn first_byte_is_set_only_once() {
        let tracker = ActiveRequestTracker::new();
        let entry = tracker.register("m".into(), "ip".into(), false, None);
        entry.set_first_byte_once();
        let first = entry.first_byte_micros.load(Ordering::Relaxed);
        std::thread::sleep(std::time::Duration::from_millis(5));
        entry.set_first_byte_once();
        assert_eq!(entry.first_byte_micros.load(Ordering::Relaxed), first);
    }
}
