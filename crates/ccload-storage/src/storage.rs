use crate::model::{AdminSession, ApiKey, Channel, LogEntry, Token};
use async_trait::async_trait;
use ccload_common::ChannelType;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Everything the routing/resilience core needs from a persistence layer.
/// Implementations are free to be a SQL database, a KV store, or (as
/// shipped here) an in-process map — the core only ever talks to this
/// trait.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn list_configs(&self) -> StorageResult<Vec<Channel>>;
    async fn get_config(&self, channel_id: i64) -> StorageResult<Option<Channel>>;
    async fn get_enabled_channels_by_model(&self, model: &str) -> StorageResult<Vec<Channel>>;
    async fn get_enabled_channels_by_type(&self, channel_type: ChannelType) -> StorageResult<Vec<Channel>>;

    async fn get_api_keys(&self, channel_id: i64) -> StorageResult<Vec<ApiKey>>;
    async fn get_all_api_keys(&self) -> StorageResult<Vec<ApiKey>>;

    /// `channel_id -> cooldown_until` (unix seconds, 0 = not cooling).
    async fn get_all_channel_cooldowns(&self) -> StorageResult<HashMap<i64, i64>>;
    /// `channel_id -> key_index -> cooldown_until`.
    async fn get_all_key_cooldowns(&self) -> StorageResult<HashMap<i64, HashMap<u32, i64>>>;

    /// Applies exponential backoff for this key based on its current
    /// failure count and the triggering status code, persists the new
    /// `until`, and returns it.
    async fn bump_key_cooldown(
        &self,
        channel_id: i64,
        key_index: u32,
        now: i64,
        status_code: u16,
    ) -> StorageResult<i64>;
    /// Applies exponential backoff for this channel based on its current
    /// failure count, persists the new `until`, and returns it.
    async fn bump_channel_cooldown(&self, channel_id: i64, now: i64) -> StorageResult<i64>;
    async fn set_channel_cooldown(&self, channel_id: i64, until: i64) -> StorageResult<()>;
    async fn reset_channel_cooldown(&self, channel_id: i64) -> StorageResult<()>;
    async fn set_key_cooldown(&self, channel_id: i64, key_index: u32, until: i64) -> StorageResult<()>;
    async fn reset_key_cooldown(&self, channel_id: i64, key_index: u32) -> StorageResult<()>;

    async fn batch_add_logs(&self, entries: Vec<LogEntry>) -> StorageResult<()>;
    #[allow(clippy::too_many_arguments)]
    async fn update_token_stats(
        &self,
        token_hash: &str,
        success: bool,
        duration_ms: u64,
        is_stream: bool,
        first_byte_ms: Option<u64>,
        cost_micro_usd: i64,
    ) -> StorageResult<()>;

    async fn get_token_by_hash(&self, hash: &str) -> StorageResult<Option<Token>>;
    async fn list_tokens(&self) -> StorageResult<Vec<Token>>;
    async fn upsert_token(&self, token: Token) -> StorageResult<()>;
    async fn delete_token(&self, id: i64) -> StorageResult<()>;

    async fn create_session(&self, session: AdminSession) -> StorageResult<()>;
    async fn get_session(&self, token: &str) -> StorageResult<Option<AdminSession>>;
    async fn delete_session(&self, token: &str) -> StorageResult<()>;
}
