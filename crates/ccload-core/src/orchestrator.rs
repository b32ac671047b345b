//! Retry orchestrator: walks channels in priority/health order, keys within
//! a channel in the channel's configured strategy, stopping the moment a
//! [`ForwardAttempt::Streaming`] commits bytes to the client. Before that
//! point every failure is retryable; after it, none is.

use crate::channel_selector::{ChannelHealthStat, ChannelSelector};
use crate::classify::{self, Action, ClassifyInput, CooldownLevel};
use crate::cooldown::CooldownManager;
use crate::forwarder::{ForwardAttempt, Forwarder, OutboundRequest};
use crate::key_selector::{KeySelectError, KeySelector};
use arc_swap::ArcSwap;
use bytes::Bytes;
use ccload_storage::{ApiKey, Channel, Storage};
use http::HeaderMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// `attempt_no` starts at 1. Doubling backoff with jitter, capped so a long
/// retry chain never stalls a request for more than 2s on any single hop.
fn retry_backoff_delay(attempt_no: u32) -> Duration {
    let step = attempt_no.saturating_sub(1).min(6);
    let base_ms: u64 = 200;
    let backoff = base_ms.saturating_mul(1u64 << step);
    let jitter = rand::random::<u64>() % (base_ms + 1);
    Duration::from_millis((backoff + jitter).min(2_000))
}

async fn backoff_sleep(attempt_no: u32) {
    let delay = retry_backoff_delay(attempt_no);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// One successfully-dispatched or exhausted routing decision. `channel_id`
/// and `key_index` identify the attempt that produced `attempt` so the
/// caller can finalize cooldowns/accounting without re-deriving it.
pub struct Dispatched {
    pub channel_id: i64,
    pub channel_name: String,
    pub key_index: u32,
    pub masked_key: String,
    pub attempt: ForwardAttempt,
}

/// All routing attempts were exhausted without ever reaching the client;
/// carries the last classified status so the caller can map it with
/// [`classify::final_client_status`].
pub struct Exhausted {
    pub status: u16,
    pub message: Option<String>,
}

pub struct RetryOrchestrator {
    storage: Arc<dyn Storage>,
    /// Shared with `AppState`; refreshed there on every admin mutation.
    channel_cache: Arc<ArcSwap<Vec<Channel>>>,
    channel_selector: Arc<ChannelSelector>,
    key_selector: Arc<KeySelector>,
    cooldown: Arc<CooldownManager>,
    forwarder: Arc<Forwarder>,
    max_key_retries: u32,
}

pub struct RequestContext<'a> {
    pub model: &'a str,
    /// Restricts eligible channels to these wire dialects (a path like
    /// `/v1/responses` is served by both `openai` and `codex` channels,
    /// while `/v1/messages` is `anthropic`-only).
    pub allowed_channel_types: &'a [ccload_common::ChannelType],
    pub build_request: &'a dyn Fn(&Channel, &ApiKey, CancellationToken) -> OutboundRequest<'static>,
    pub cancel: CancellationToken,
}

impl RetryOrchestrator {
    pub fn new(
        storage: Arc<dyn Storage>,
        channel_cache: Arc<ArcSwap<Vec<Channel>>>,
        channel_selector: Arc<ChannelSelector>,
        key_selector: Arc<KeySelector>,
        cooldown: Arc<CooldownManager>,
        forwarder: Arc<Forwarder>,
        max_key_retries: u32,
    ) -> Self {
        Self {
            storage,
            channel_cache,
            channel_selector,
            key_selector,
            cooldown,
            forwarder,
            max_key_retries,
        }
    }

    /// Drives the full channel/key retry loop for one request. Returns
    /// either the dispatched attempt (which may itself be a client-visible
    /// failure already applied to cooldowns) or `Exhausted` if no channel
    /// had an available key.
    pub async fn dispatch(&self, ctx: &RequestContext<'_>, now: i64) -> Result<Dispatched, Exhausted> {
        let candidates = self.eligible_channels(ctx, now).await;
        if candidates.is_empty() {
            return Err(Exhausted {
                status: 503,
                message: Some("no enabled channel serves this model".to_string()),
            });
        }

        let health = self.health_snapshot(&candidates).await;
        let effective_key_counts = self.effective_key_counts(&candidates, now).await;
        let ordered = self.channel_selector.order(candidates, &health, &effective_key_counts);

        let mut tried_channels: HashSet<i64> = HashSet::new();
        let mut attempt_no: u32 = 0;
        let mut last_status: u16 = 503;
        let mut last_message: Option<String> = None;

        for channel in ordered {
            if ctx.cancel.is_cancelled() {
                return Err(Exhausted {
                    status: classify::STATUS_CLIENT_CLOSED,
                    message: None,
                });
            }
            tried_channels.insert(channel.id);

            let keys = match self.storage.get_api_keys(channel.id).await {
                Ok(keys) => keys,
                Err(err) => {
                    warn!(channel_id = channel.id, error = %err, "failed to load channel keys");
                    continue;
                }
            };

            let mut tried_keys: HashSet<u32> = HashSet::new();

            'keys: loop {
                if tried_keys.len() as u32 >= self.max_key_retries.min(keys.len() as u32) {
                    break 'keys;
                }

                let (key_index, secret) = match self.key_selector.select_with_strategy(
                    channel.id,
                    &keys,
                    channel.key_strategy,
                    &tried_keys,
                    now,
                ) {
                    Ok(pair) => pair,
                    Err(KeySelectError::NoKeys) => break 'keys,
                    Err(KeySelectError::NoneAvailable) => break 'keys,
                };
                tried_keys.insert(key_index);

                let api_key = ApiKey {
                    channel_id: channel.id,
                    key_index,
                    secret: secret.clone(),
                    cooldown_until: 0,
                    consecutive_failures: 0,
                };

                attempt_no += 1;
                if attempt_no > 1 {
                    backoff_sleep(attempt_no).await;
                }

                let req = (ctx.build_request)(&channel, &api_key, ctx.cancel.clone());
                let attempt = self.forwarder.forward(req).await;

                let masked = mask_key(&secret);

                match classify_attempt(&attempt, channel.channel_type, ctx.cancel.is_cancelled()) {
                    AttemptVerdict::Commit => {
                        let _ = self.cooldown.clear_success(channel.id, key_index).await;
                        return Ok(Dispatched {
                            channel_id: channel.id,
                            channel_name: channel.name.clone(),
                            key_index,
                            masked_key: masked,
                            attempt,
                        });
                    }
                    AttemptVerdict::ClientCancel => {
                        return Err(Exhausted {
                            status: classify::STATUS_CLIENT_CLOSED,
                            message: None,
                        });
                    }
                    AttemptVerdict::Retry {
                        action,
                        cooldown_level,
                        cooldown_until_override,
                        status,
                        message,
                    } => {
                        let classification = crate::classify::Classification {
                            action,
                            cooldown_level,
                            cooldown_until_override,
                        };
                        let _ = self.cooldown.apply(channel.id, key_index, now, &classification).await;
                        last_status = status;
                        last_message = message;

                        debug!(
                            channel_id = channel.id,
                            key_index,
                            status,
                            action = ?action,
                            "attempt failed, considering retry"
                        );

                        match action {
                            Action::RetryKey => continue 'keys,
                            Action::RetryChannel => break 'keys,
                            Action::ReturnClient => {
                                return Err(Exhausted {
                                    status,
                                    message,
                                });
                            }
                        }
                    }
                }
            }
        }

        Err(Exhausted {
            status: last_status,
            message: last_message,
        })
    }

    /// `enabled ∧ model ∈ channel.models (after the `modelRedirects` reverse
    /// lookup) ∧ channelType matches ∧ channel.id ∉ channelCooldowns(now)`.
    /// Reads the shared channel cache (never storage) for the config half
    /// of this filter, and storage only for the live cooldown set.
    async fn eligible_channels(&self, ctx: &RequestContext<'_>, now: i64) -> Vec<Channel> {
        let cooldowns = self.storage.get_all_channel_cooldowns().await.unwrap_or_default();
        let mut channels: Vec<Channel> = self
            .channel_cache
            .load()
            .iter()
            .filter(|c| {
                c.enabled
                    && c.serves_model(ctx.model)
                    && cooldowns.get(&c.id).map(|until| *until <= now).unwrap_or(true)
            })
            .cloned()
            .collect();
        if !ctx.allowed_channel_types.is_empty() {
            channels.retain(|c| ctx.allowed_channel_types.contains(&c.channel_type));
        }
        channels
    }

    async fn health_snapshot(&self, candidates: &[Channel]) -> HashMap<i64, ChannelHealthStat> {
        // Health accounting lives alongside logs/cooldowns in storage; the
        // in-memory reference implementation doesn't expose a dedicated
        // counters table yet, so absent entries default to "no data" (the
        // selector treats that as zero penalty).
        let _ = candidates;
        HashMap::new()
    }

    async fn effective_key_counts(&self, candidates: &[Channel], now: i64) -> HashMap<i64, u32> {
        let mut out = HashMap::new();
        for channel in candidates {
            let keys = self.storage.get_api_keys(channel.id).await.unwrap_or_default();
            let effective = keys.iter().filter(|k| k.cooldown_until <= now).count().max(1) as u32;
            out.insert(channel.id, effective);
        }
        out
    }
}

enum AttemptVerdict {
    Commit,
    ClientCancel,
    Retry {
        action: Action,
        cooldown_level: CooldownLevel,
        cooldown_until_override: Option<i64>,
        status: u16,
        message: Option<String>,
    },
}

fn classify_attempt(attempt: &ForwardAttempt, channel_type: ccload_common::ChannelType, cancelled: bool) -> AttemptVerdict {
    match attempt {
        ForwardAttempt::Streaming { .. } => AttemptVerdict::Commit,
        ForwardAttempt::Buffered { status, headers, body, content_type } => {
            let input = ClassifyInput {
                status: *status,
                headers,
                body,
                is_network_error: false,
                channel_type,
                is_client_cancel: cancelled,
                stream_saw_complete_sentinel: false,
                content_type: content_type.as_deref(),
            };
            let c = classify::classify(&input, now_unix());
            if matches!(c.action, Action::ReturnClient) && (200..300).contains(status) {
                return AttemptVerdict::Commit;
            }
            AttemptVerdict::Retry {
                action: c.action,
                cooldown_level: c.cooldown_level,
                cooldown_until_override: c.cooldown_until_override,
                status: classify::final_client_status(*status),
                message: body_message(body),
            }
        }
        ForwardAttempt::Failed {
            is_network_error,
            is_client_cancel,
            status_hint,
        } => {
            if *is_client_cancel {
                return AttemptVerdict::ClientCancel;
            }
            let empty_headers = HeaderMap::new();
            let input = ClassifyInput {
                status: *status_hint,
                headers: &empty_headers,
                body: b"",
                is_network_error: *is_network_error,
                channel_type,
                is_client_cancel: false,
                stream_saw_complete_sentinel: false,
                content_type: None,
            };
            let c = classify::classify(&input, now_unix());
            AttemptVerdict::Retry {
                action: c.action,
                cooldown_level: c.cooldown_level,
                cooldown_until_override: c.cooldown_until_override,
                status: classify::final_client_status(*status_hint),
                message: None,
            }
        }
    }
}

fn body_message(body: &Bytes) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    std::str::from_utf8(body).ok().map(|s| s.chars().take(256).collect())
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Keeps only the trailing 4 characters, e.g. `sk-ant-***cdef`.
pub fn mask_key(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("***{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_selector::{ChannelSelector, SelectorTuning};
    use crate::key_selector::KeySelector;
    use ccload_common::ChannelType;
    use ccload_storage::InMemoryStorage;
    use std::collections::HashMap;

    fn test_orchestrator(channels: Vec<Channel>) -> RetryOrchestrator {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        RetryOrchestrator::new(
            storage.clone(),
            Arc::new(ArcSwap::from_pointee(channels)),
            Arc::new(ChannelSelector::new(SelectorTuning::default())),
            Arc::new(KeySelector::new()),
            Arc::new(CooldownManager::new(storage)),
            Arc::new(Forwarder::new(Default::default()).unwrap()),
            3,
        )
    }

    fn channel(id: i64, models: &[&str]) -> Channel {
        Channel {
            id,
            name: format!("chan-{id}"),
            base_url: "https://api.example.com".into(),
            channel_type: ChannelType::Anthropic,
            models: models.iter().map(|m| m.to_string()).collect(),
            model_redirects: HashMap::new(),
            key_strategy: ccload_common::KeyStrategy::Sequential,
            priority: 0,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn eligible_channels_excludes_channels_cooling_down() {
        let orch = test_orchestrator(vec![channel(1, &["claude-3-opus"])]);
        orch.storage.set_channel_cooldown(1, 99_999_999_999).await.unwrap();

        let cancel = CancellationToken::new();
        let build = |_: &Channel, _: &ApiKey, _: CancellationToken| unreachable!();
        let ctx = RequestContext {
            model: "claude-3-opus",
            allowed_channel_types: &[],
            build_request: &build,
            cancel,
        };
        let candidates = orch.eligible_channels(&ctx, 1_000).await;
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn eligible_channels_matches_via_model_redirect_reverse_lookup() {
        let mut c = channel(1, &["claude-3-opus-20240229"]);
        c.model_redirects.insert("claude-3-opus".to_string(), "claude-3-opus-20240229".to_string());
        let orch = test_orchestrator(vec![c]);

        let cancel = CancellationToken::new();
        let build = |_: &Channel, _: &ApiKey, _: CancellationToken| unreachable!();
        let ctx = RequestContext {
            model: "claude-3-opus",
            allowed_channel_types: &[],
            build_request: &build,
            cancel,
        };
        let candidates = orch.eligible_channels(&ctx, 1_000).await;
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn backoff_is_capped_and_monotonically_bounded() {
        for attempt in 1..20 {
            let d = retry_backoff_delay(attempt);
            assert!(d <= Duration::from_millis(2_000));
        }
    }

    #[test]
    fn backoff_grows_with_attempt_number_before_cap() {
        let early = retry_backoff_delay(1);
        let later = retry_backoff_delay(4);
        assert!(later >= early);
    }

    #[test]
    fn mask_key_keeps_only_trailing_characters() {
        let masked = mask_key("sk-ant-api03-abcdefgh");
        assert!(masked.ends_with("efgh"));
        assert!(!masked.contains("abcdefgh"));
    }

    #[test]
    fn mask_key_handles_short_secrets_without_panicking() {
        let masked = mask_key("ab");
        assert_eq!(masked, "**");
    }
}
