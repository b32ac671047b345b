//! Cooldown manager: the thin layer between the error classifier's verdict
//! and the storage collaborator's cooldown tables. A key cooldown never
//! implies a channel cooldown and vice versa; either can independently
//! remove a `(channel, key)` pair from selection.

use crate::classify::{Classification, CooldownLevel};
use ccload_storage::{Storage, StorageResult};
use std::collections::HashMap;
use std::sync::Arc;

pub struct CooldownManager {
    storage: Arc<dyn Storage>,
}

impl CooldownManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Applies a classifier verdict: persists the new cooldown (extending
    /// it monotonically, or jumping straight to an override like a
    /// `Retry-After`/1308 `reset_at` hint) and returns nothing — the
    /// caller already has the `Action` from the classifier.
    pub async fn apply(
        &self,
        channel_id: i64,
        key_index: u32,
        now: i64,
        classification: &Classification,
    ) -> StorageResult<()> {
        match classification.cooldown_level {
            CooldownLevel::None => Ok(()),
            CooldownLevel::Key => {
                if let Some(until) = classification.cooldown_until_override {
                    self.storage.set_key_cooldown(channel_id, key_index, until).await
                } else {
                    self.storage
                        .bump_key_cooldown(channel_id, key_index, now, 0)
                        .await
                        .map(|_| ())
                }
            }
            CooldownLevel::Channel => {
                if let Some(until) = classification.cooldown_until_override {
                    self.storage.set_channel_cooldown(channel_id, until).await
                } else {
                    self.storage.bump_channel_cooldown(channel_id, now).await.map(|_| ())
                }
            }
        }
    }

    /// Clears both levels of cooldown for `(channel_id, key_index)`. Called
    /// on any successful attempt.
    pub async fn clear_success(&self, channel_id: i64, key_index: u32) -> StorageResult<()> {
        self.storage.reset_channel_cooldown(channel_id).await?;
        self.storage.reset_key_cooldown(channel_id, key_index).await
    }

    pub async fn clear_channel(&self, channel_id: i64) -> StorageResult<()> {
        self.storage.reset_channel_cooldown(channel_id).await
    }

    pub async fn clear_key(&self, channel_id: i64, key_index: u32) -> StorageResult<()> {
        self.storage.reset_key_cooldown(channel_id, key_index).await
    }

    pub async fn snapshot_channel_cooldowns(&self) -> StorageResult<HashMap<i64, i64>> {
        self.storage.get_all_channel_cooldowns().await
    }

    pub async fn snapshot_key_cooldowns(&self) -> StorageResult<HashMap<i64, HashMap<u32, i64>>> {
        self.storage.get_all_key_cooldowns().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Action;
    use ccload_storage::InMemoryStorage;

    fn key_classification(level: CooldownLevel, override_until: Option<i64>) -> Classification {
        Classification {
            action: Action::RetryKey,
            cooldown_level: level,
            cooldown_until_override: override_until,
        }
    }

    #[tokio::test]
    async fn apply_then_clear_round_trips_to_empty_state() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let mgr = CooldownManager::new(storage);

        mgr.apply(1, 0, 1000, &key_classification(CooldownLevel::Key, Some(2000)))
            .await
            .unwrap();
        let before = mgr.snapshot_key_cooldowns().await.unwrap();
        assert_eq!(before.get(&1).and_then(|m| m.get(&0)), Some(&2000));

        mgr.clear_key(1, 0).await.unwrap();
        let after = mgr.snapshot_key_cooldowns().await.unwrap();
        assert!(after.get(&1).and_then(|m| m.get(&0)).is_none());
    }

    #[tokio::test]
    async fn channel_cooldown_independent_of_key_cooldown() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let mgr = CooldownManager::new(storage);

        mgr.apply(1, 0, 1000, &key_classification(CooldownLevel::Channel, Some(5000)))
            .await
            .unwrap();
        let channels = mgr.snapshot_channel_cooldowns().await.unwrap();
        let keys = mgr.snapshot_key_cooldowns().await.unwrap();
        assert_eq!(channels.get(&1), Some(&5000));
        assert!(keys.get(&1).is_none());
    }

    #[tokio::test]
    async fn channel_cooldown_without_override_grows_with_repeat_failures() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let mgr = CooldownManager::new(storage);

        mgr.apply(1, 0, 1000, &key_classification(CooldownLevel::Channel, None))
            .await
            .unwrap();
        let first = *mgr.snapshot_channel_cooldowns().await.unwrap().get(&1).unwrap();
        assert!(first > 1000, "first failure should still push the cooldown into the future");

        mgr.apply(1, 0, 1000, &key_classification(CooldownLevel::Channel, None))
            .await
            .unwrap();
        let second = *mgr.snapshot_channel_cooldowns().await.unwrap().get(&1).unwrap();
        assert!(second >= first, "repeat failures should not shrink the cooldown");
    }
}
