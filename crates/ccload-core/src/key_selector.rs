//! Picks one non-cooling, non-excluded key from a channel's pool. Never
//! mutates cooldown state — purely a read-side decision. `key_index` is
//! the stable per-key identity (possibly sparse), never a slice position.

use ccload_common::KeyStrategy;
use ccload_storage::ApiKey;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeySelectError {
    #[error("channel has no configured keys")]
    NoKeys,
    #[error("all keys are cooling down or already tried")]
    NoneAvailable,
}

pub struct KeySelector {
    round_robin_counters: RwLock<HashMap<i64, AtomicU32>>,
}

impl KeySelector {
    pub fn new() -> Self {
        Self {
            round_robin_counters: RwLock::new(HashMap::new()),
        }
    }

    /// `strategy` is read from the owning channel's config (denormalized
    /// onto each key row in storage, but passed explicitly here since the
    /// selector itself holds no channel state).
    pub fn select_with_strategy(
        &self,
        channel_id: i64,
        keys: &[ApiKey],
        strategy: KeyStrategy,
        exclude: &HashSet<u32>,
        now: i64,
    ) -> Result<(u32, String), KeySelectError> {
        if keys.is_empty() {
            return Err(KeySelectError::NoKeys);
        }
        if keys.len() == 1 {
            return self.single_key_or_err(&keys[0], exclude, now);
        }

        match strategy {
            KeyStrategy::Sequential => self.select_sequential(keys, exclude, now),
            KeyStrategy::RoundRobin => self.select_round_robin(channel_id, keys, exclude, now),
        }
    }

    fn single_key_or_err(
        &self,
        key: &ApiKey,
        exclude: &HashSet<u32>,
        now: i64,
    ) -> Result<(u32, String), KeySelectError> {
        if exclude.contains(&key.key_index) || key.cooldown_until > now {
            return Err(KeySelectError::NoneAvailable);
        }
        Ok((key.key_index, key.secret.clone()))
    }

    fn select_sequential(
        &self,
        keys: &[ApiKey],
        exclude: &HashSet<u32>,
        now: i64,
    ) -> Result<(u32, String), KeySelectError> {
        keys.iter()
            .find(|k| !exclude.contains(&k.key_index) && k.cooldown_until <= now)
            .map(|k| (k.key_index, k.secret.clone()))
            .ok_or(KeySelectError::NoneAvailable)
    }

    fn select_round_robin(
        &self,
        channel_id: i64,
        keys: &[ApiKey],
        exclude: &HashSet<u32>,
        now: i64,
    ) -> Result<(u32, String), KeySelectError> {
        let n = keys.len();
        let start = self.next_counter(channel_id) as usize % n;

        for offset in 0..n {
            let key = &keys[(start + offset) % n];
            if !exclude.contains(&key.key_index) && key.cooldown_until <= now {
                return Ok((key.key_index, key.secret.clone()));
            }
        }
        Err(KeySelectError::NoneAvailable)
    }

    fn next_counter(&self, channel_id: i64) -> u32 {
        {
            let counters = self.round_robin_counters.read().unwrap();
            if let Some(counter) = counters.get(&channel_id) {
                return counter.fetch_add(1, Ordering::Relaxed);
            }
        }
        let mut counters = self.round_robin_counters.write().unwrap();
        let counter = counters.entry(channel_id).or_insert_with(|| AtomicU32::new(0));
        counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for KeySelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(channel_id: i64, key_index: u32, cooldown_until: i64) -> ApiKey {
        ApiKey {
            channel_id,
            key_index,
            secret: format!("secret-{key_index}"),
            cooldown_until,
            consecutive_failures: 0,
        }
    }

    #[test]
    fn sequential_skips_excluded_and_cooling_keys() {
        let selector = KeySelector::new();
        let keys = vec![key(1, 0, 100), key(1, 1, 0), key(1, 2, 0)];
        let mut exclude = HashSet::new();
        exclude.insert(2u32);

        let (idx, _) = selector
            .select_with_strategy(1, &keys, KeyStrategy::Sequential, &exclude, 50)
            .unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn round_robin_returns_sparse_key_index_not_slice_position() {
        let selector = KeySelector::new();
        let keys = vec![key(1, 5, 0), key(1, 9, 0)];
        let exclude = HashSet::new();

        let (idx, _) = selector
            .select_with_strategy(1, &keys, KeyStrategy::RoundRobin, &exclude, 0)
            .unwrap();
        assert!(idx == 5 || idx == 9);
    }

    #[test]
    fn never_returns_excluded_key() {
        let selector = KeySelector::new();
        let keys = vec![key(1, 0, 0)];
        let mut exclude = HashSet::new();
        exclude.insert(0u32);

        let result = selector.select_with_strategy(1, &keys, KeyStrategy::Sequential, &exclude, 0);
        assert_eq!(result, Err(KeySelectError::NoneAvailable));
    }

    #[test]
    fn never_returns_cooling_key() {
        let selector = KeySelector::new();
        let keys = vec![key(1, 0, 1_000_000)];
        let exclude = HashSet::new();

        let result = selector.select_with_strategy(1, &keys, KeyStrategy::Sequential, &exclude, 10);
        assert_eq!(result, Err(KeySelectError::NoneAvailable));
    }

    #[test]
    fn empty_key_list_errors() {
        let selector = KeySelector::new();
        let exclude = HashSet::new();
        let result = selector.select_with_strategy(1, &[], KeyStrategy::Sequential, &exclude, 0);
        assert_eq!(result, Err(KeySelectError::NoKeys));
    }
}
