use crate::model::{AdminSession, ApiKey, Channel, CooldownEntry, LogEntry, Token};
use crate::storage::{Storage, StorageResult};
use async_trait::async_trait;
use ccload_common::ChannelType;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Exponential backoff with jitter for key-level cooldowns: `min(base *
/// 2^failures, cap)`, `+-` up to 20% jitter.
const KEY_BACKOFF_BASE_SECS: i64 = 1;
const KEY_BACKOFF_CAP_SECS: i64 = 30 * 60;

fn backoff_duration_secs(consecutive_failures: u32) -> i64 {
    let step = consecutive_failures.min(20);
    let backoff = KEY_BACKOFF_BASE_SECS.saturating_mul(1i64 << step);
    let capped = backoff.min(KEY_BACKOFF_CAP_SECS);
    let jitter_span = (capped / 5).max(1);
    let jitter = rand::random::<u32>() as i64 % (2 * jitter_span + 1) - jitter_span;
    (capped + jitter).max(1)
}

#[derive(Default)]
struct Inner {
    channels: HashMap<i64, Channel>,
    keys: HashMap<i64, Vec<ApiKey>>,
    channel_cooldowns: HashMap<i64, CooldownEntry>,
    key_cooldowns: HashMap<(i64, u32), CooldownEntry>,
    tokens: HashMap<String, Token>,
    sessions: HashMap<String, AdminSession>,
    logs: Vec<LogEntry>,
}

/// In-process reference implementation of [`Storage`]. Suitable for tests
/// and for running without a database; not persisted across restarts.
pub struct InMemoryStorage {
    inner: RwLock<Inner>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub async fn insert_channel(&self, channel: Channel) {
        self.inner.write().await.channels.insert(channel.id, channel);
    }

    pub async fn insert_keys(&self, channel_id: i64, keys: Vec<ApiKey>) {
        self.inner.write().await.keys.insert(channel_id, keys);
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn list_configs(&self) -> StorageResult<Vec<Channel>> {
        Ok(self.inner.read().await.channels.values().cloned().collect())
    }

    async fn get_config(&self, channel_id: i64) -> StorageResult<Option<Channel>> {
        Ok(self.inner.read().await.channels.get(&channel_id).cloned())
    }

    async fn get_enabled_channels_by_model(&self, model: &str) -> StorageResult<Vec<Channel>> {
        let inner = self.inner.read().await;
        Ok(inner
            .channels
            .values()
            .filter(|c| c.enabled && c.models.iter().any(|m| m == model))
            .cloned()
            .collect())
    }

    async fn get_enabled_channels_by_type(&self, channel_type: ChannelType) -> StorageResult<Vec<Channel>> {
        let inner = self.inner.read().await;
        Ok(inner
            .channels
            .values()
            .filter(|c| c.enabled && c.channel_type == channel_type)
            .cloned()
            .collect())
    }

    async fn get_api_keys(&self, channel_id: i64) -> StorageResult<Vec<ApiKey>> {
        let inner = self.inner.read().await;
        let mut keys = inner.keys.get(&channel_id).cloned().unwrap_or_default();
        for key in &mut keys {
            if let Some(entry) = inner.key_cooldowns.get(&(channel_id, key.key_index)) {
                key.cooldown_until = entry.until;
                key.consecutive_failures = entry.failure_count;
            }
        }
        Ok(keys)
    }

    async fn get_all_api_keys(&self) -> StorageResult<Vec<ApiKey>> {
        let inner = self.inner.read().await;
        Ok(inner.keys.values().flatten().cloned().collect())
    }

    async fn get_all_channel_cooldowns(&self) -> StorageResult<HashMap<i64, i64>> {
        let inner = self.inner.read().await;
        Ok(inner.channel_cooldowns.iter().map(|(id, e)| (*id, e.until)).collect())
    }

    async fn get_all_key_cooldowns(&self) -> StorageResult<HashMap<i64, HashMap<u32, i64>>> {
        let inner = self.inner.read().await;
        let mut out: HashMap<i64, HashMap<u32, i64>> = HashMap::new();
        for ((channel_id, key_index), entry) in inner.key_cooldowns.iter() {
            out.entry(*channel_id).or_default().insert(*key_index, entry.until);
        }
        Ok(out)
    }

    async fn bump_key_cooldown(
        &self,
        channel_id: i64,
        key_index: u32,
        now: i64,
        _status_code: u16,
    ) -> StorageResult<i64> {
        let mut inner = self.inner.write().await;
        let entry = inner.key_cooldowns.entry((channel_id, key_index)).or_default();
        entry.failure_count = entry.failure_count.saturating_add(1);
        let until = now + backoff_duration_secs(entry.failure_count);
        entry.until = entry.until.max(until);
        Ok(entry.until)
    }

    async fn bump_channel_cooldown(&self, channel_id: i64, now: i64) -> StorageResult<i64> {
        let mut inner = self.inner.write().await;
        let entry = inner.channel_cooldowns.entry(channel_id).or_default();
        entry.failure_count = entry.failure_count.saturating_add(1);
        let until = now + backoff_duration_secs(entry.failure_count);
        entry.until = entry.until.max(until);
        Ok(entry.until)
    }

    async fn set_channel_cooldown(&self, channel_id: i64, until: i64) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.channel_cooldowns.entry(channel_id).or_default();
        entry.failure_count = entry.failure_count.saturating_add(1);
        entry.until = entry.until.max(until);
        Ok(())
    }

    async fn reset_channel_cooldown(&self, channel_id: i64) -> StorageResult<()> {
        self.inner.write().await.channel_cooldowns.remove(&channel_id);
        Ok(())
    }

    async fn set_key_cooldown(&self, channel_id: i64, key_index: u32, until: i64) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.key_cooldowns.entry((channel_id, key_index)).or_default();
        entry.failure_count = entry.failure_count.saturating_add(1);
        entry.until = entry.until.max(until);
        Ok(())
    }

    async fn reset_key_cooldown(&self, channel_id: i64, key_index: u32) -> StorageResult<()> {
        self.inner.write().await.key_cooldowns.remove(&(channel_id, key_index));
        Ok(())
    }

    async fn batch_add_logs(&self, entries: Vec<LogEntry>) -> StorageResult<()> {
        self.inner.write().await.logs.extend(entries);
        Ok(())
    }

    async fn update_token_stats(
        &self,
        token_hash: &str,
        _success: bool,
        _duration_ms: u64,
        _is_stream: bool,
        _first_byte_ms: Option<u64>,
        cost_micro_usd: i64,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(token) = inner.tokens.get_mut(token_hash) {
            token.spent_micro_usd += cost_micro_usd;
        }
        Ok(())
    }

    async fn get_token_by_hash(&self, hash: &str) -> StorageResult<Option<Token>> {
        Ok(self.inner.read().await.tokens.get(hash).cloned())
    }

    async fn list_tokens(&self) -> StorageResult<Vec<Token>> {
        Ok(self.inner.read().await.tokens.values().cloned().collect())
    }

    async fn upsert_token(&self, token: Token) -> StorageResult<()> {
        self.inner.write().await.tokens.insert(token.hash.clone(), token);
        Ok(())
    }

    async fn delete_token(&self, id: i64) -> StorageResult<()> {
        self.inner.write().await.tokens.retain(|_, t| t.id != id);
        Ok(())
    }

    async fn create_session(&self, session: AdminSession) -> StorageResult<()> {
        self.inner.write().await.sessions.insert(session.token.clone(), session);
        Ok(())
    }

    async fn get_session(&self, token: &str) -> StorageResult<Option<AdminSession>> {
        Ok(self.inner.read().await.sessions.get(token).cloned())
    }

    async fn delete_session(&self, token: &str) -> StorageResult<()> {
        self.inner.write().await.sessions.remove(token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccload_common::KeyStrategy;

    fn sample_channel(id: i64, model: &str) -> Channel {
        Channel {
            id,
            name: format!("chan-{id}"),
            base_url: "https://api.example.com".into(),
            channel_type: ChannelType::Anthropic,
            models: vec![model.to_string()],
            model_redirects: HashMap::new(),
            key_strategy: KeyStrategy::Sequential,
            priority: 10,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn bump_key_cooldown_is_monotonic_until_cleared() {
        let storage = InMemoryStorage::new();
        let first = storage.bump_key_cooldown(1, 0, 1000, 401).await.unwrap();
        let second = storage.bump_key_cooldown(1, 0, 1001, 401).await.unwrap();
        assert!(second >= first);

        storage.reset_key_cooldown(1, 0).await.unwrap();
        let cooldowns = storage.get_all_key_cooldowns().await.unwrap();
        assert!(cooldowns.get(&1).and_then(|m| m.get(&0)).is_none());
    }

    #[tokio::test]
    async fn get_api_keys_reflects_live_key_cooldown() {
        let storage = InMemoryStorage::new();
        storage
            .insert_keys(
                1,
                vec![ApiKey {
                    channel_id: 1,
                    key_index: 0,
                    secret: "sk-test".into(),
                    cooldown_until: 0,
                    consecutive_failures: 0,
                }],
            )
            .await;

        let before = storage.get_api_keys(1).await.unwrap();
        assert_eq!(before[0].cooldown_until, 0);

        storage.bump_key_cooldown(1, 0, 1000, 429).await.unwrap();
        let after = storage.get_api_keys(1).await.unwrap();
        assert!(after[0].cooldown_until > 1000);
        assert_eq!(after[0].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn bump_channel_cooldown_escalates_on_repeat_failures() {
        let storage = InMemoryStorage::new();
        let first = storage.bump_channel_cooldown(1, 1000).await.unwrap();
        let second = storage.bump_channel_cooldown(1, 1000).await.unwrap();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn filters_by_enabled_model_and_type() {
        let storage = InMemoryStorage::new();
        storage.insert_channel(sample_channel(1, "claude-3-opus")).await;
        let mut disabled = sample_channel(2, "claude-3-opus");
        disabled.enabled = false;
        storage.insert_channel(disabled).await;

        let by_model = storage.get_enabled_channels_by_model("claude-3-opus").await.unwrap();
        assert_eq!(by_model.len(), 1);
        assert_eq!(by_model[0].id, 1);

        let by_type = storage.get_enabled_channels_by_type(ChannelType::Anthropic).await.unwrap();
        assert_eq!(by_type.len(), 1);
    }
}
