use ccload_common::{ChannelType, KeyStrategy};
use ccload_protocol::UsageTuple;
use std::collections::HashMap;
use time::OffsetDateTime;

/// A configured upstream endpoint: base URL plus the key pool and models it
/// serves. Mutated only by the admin collaborator; the data plane treats it
/// as read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub channel_type: ChannelType,
    pub models: Vec<String>,
    /// Requested model name -> actual upstream model name.
    pub model_redirects: HashMap<String, String>,
    pub key_strategy: KeyStrategy,
    pub priority: i32,
    pub enabled: bool,
}

impl Channel {
    /// True if a request for `model` can be served by this channel, either
    /// directly or via its `model_redirects` reverse lookup.
    pub fn serves_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model) || self.model_redirects.contains_key(model)
    }
}

/// One API secret within a channel's pool, addressed by `(channel_id,
/// key_index)`. `key_index` is stable over the key's lifetime and may be
/// sparse — it is never a slice position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub channel_id: i64,
    pub key_index: u32,
    pub secret: String,
    /// Unix seconds; 0 means not cooling.
    pub cooldown_until: i64,
    pub consecutive_failures: u32,
}

/// Cooldown state at either the channel or key level. `until` only ever
/// grows monotonically between `Clear` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CooldownEntry {
    pub until: i64,
    pub failure_count: u32,
}

impl CooldownEntry {
    pub fn is_active(&self, now: i64) -> bool {
        self.until > now
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: OffsetDateTime,
    pub model: String,
    pub channel_id: i64,
    pub status: u16,
    pub duration_ms: u64,
    pub is_stream: bool,
    /// Never the raw secret — e.g. `sk-ant-***1234`.
    pub masked_key: String,
    pub token_id: Option<i64>,
    pub usage: UsageTuple,
    pub cost_micro_usd: i64,
    pub message: Option<String>,
}

/// Inbound API token, looked up by hash (never stores the plaintext).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub id: i64,
    pub hash: String,
    pub active: bool,
    pub expires_at: Option<OffsetDateTime>,
    pub allowed_models: Option<Vec<String>>,
    pub cost_cap_micro_usd: Option<i64>,
    pub spent_micro_usd: i64,
}

#[derive(Debug, Clone)]
pub struct AdminSession {
    pub token: String,
    pub expires_at: OffsetDateTime,
}
