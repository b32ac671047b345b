//! Maps `(httpStatus, headers, body, isNetworkErr)` to a retry verdict.
//! Internal sentinel statuses stand in for conditions that have no native
//! HTTP status (a timed-out first byte, a soft error hidden in a 200, a
//! stream that died mid-flight) so the rest of the pipeline can treat them
//! uniformly with real upstream statuses.

use ccload_common::ChannelType;
use http::HeaderMap;
use serde_json::Value;

/// Quota exceeded, vendor code 1308. Carries a `reset_at` hint. Key-level.
pub const STATUS_QUOTA_1308: u16 = 596;
/// An `error` event/field surfaced inside an otherwise-200 SSE stream.
pub const STATUS_SSE_ERROR: u16 = 597;
/// No byte arrived from the upstream body within the configured timeout.
pub const STATUS_FIRST_BYTE_TIMEOUT: u16 = 598;
/// The stream closed before a completion sentinel was seen, with no other
/// explicit error.
pub const STATUS_STREAM_INCOMPLETE: u16 = 599;
/// Client disconnected mid-request; never sent upstream as a real status.
pub const STATUS_CLIENT_CLOSED: u16 = 499;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ReturnClient,
    RetryKey,
    RetryChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownLevel {
    None,
    Key,
    Channel,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub action: Action,
    pub cooldown_level: CooldownLevel,
    /// Absolute unix-seconds override (from `Retry-After` or a 1308
    /// `reset_at`), taking precedence over the cooldown manager's own
    /// exponential backoff computation.
    pub cooldown_until_override: Option<i64>,
}

pub struct ClassifyInput<'a> {
    pub status: u16,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
    pub is_network_error: bool,
    pub channel_type: ChannelType,
    /// Set once the forwarder has positively identified a client-initiated
    /// cancellation (not merely any I/O error while ctx is done).
    pub is_client_cancel: bool,
    /// Did the stream emit a completion sentinel before the read error?
    pub stream_saw_complete_sentinel: bool,
    pub content_type: Option<&'a str>,
}

pub fn classify(input: &ClassifyInput<'_>, now: i64) -> Classification {
    // Rule 7: stream-complete masks whatever closed the connection after it.
    if input.stream_saw_complete_sentinel && (input.is_network_error || input.status >= 500) {
        return Classification {
            action: Action::ReturnClient,
            cooldown_level: CooldownLevel::None,
            cooldown_until_override: None,
        };
    }

    // Rule 2: client cancel short-circuits everything, no cooldown.
    if input.is_client_cancel {
        return Classification {
            action: Action::ReturnClient,
            cooldown_level: CooldownLevel::None,
            cooldown_until_override: None,
        };
    }

    // Rule 1: bare network failure with no status at all.
    if input.is_network_error && input.status == 0 {
        return Classification {
            action: Action::RetryChannel,
            cooldown_level: CooldownLevel::Channel,
            cooldown_until_override: None,
        };
    }

    // Rule 3: internal sentinels.
    match input.status {
        STATUS_QUOTA_1308 => {
            let reset_at = parse_reset_at(input.body);
            return Classification {
                action: Action::RetryKey,
                cooldown_level: CooldownLevel::Key,
                cooldown_until_override: reset_at,
            };
        }
        STATUS_SSE_ERROR => {
            return Classification {
                action: Action::RetryChannel,
                cooldown_level: CooldownLevel::Channel,
                cooldown_until_override: None,
            };
        }
        STATUS_FIRST_BYTE_TIMEOUT | STATUS_STREAM_INCOMPLETE => {
            return Classification {
                action: Action::RetryChannel,
                cooldown_level: CooldownLevel::Channel,
                cooldown_until_override: None,
            };
        }
        STATUS_CLIENT_CLOSED => {
            return Classification {
                action: Action::ReturnClient,
                cooldown_level: CooldownLevel::None,
                cooldown_until_override: None,
            };
        }
        _ => {}
    }

    // Rule 6: HTTP 200 soft errors, anthropic/codex only.
    if input.status == 200
        && matches!(input.channel_type, ChannelType::Anthropic | ChannelType::Codex)
        && is_plausible_soft_error_content_type(input.content_type)
        && input.body.len() < 4096
    {
        if let Some(reclassified) = detect_soft_error(input.body) {
            let mut recursed = ClassifyInput {
                status: reclassified,
                ..clone_without_status(input)
            };
            recursed.status = reclassified;
            return classify(&recursed, now);
        }
    }

    // Rule 4: HTTP 4xx.
    if (400..500).contains(&input.status) {
        return classify_4xx(input);
    }

    // Rule 5: HTTP 5xx.
    if (500..600).contains(&input.status) {
        return Classification {
            action: Action::RetryChannel,
            cooldown_level: CooldownLevel::Channel,
            cooldown_until_override: None,
        };
    }

    // 2xx/3xx that reach here are treated as success by the caller; the
    // classifier is only consulted on failure paths, but default safely.
    Classification {
        action: Action::ReturnClient,
        cooldown_level: CooldownLevel::None,
        cooldown_until_override: None,
    }
}

fn clone_without_status<'a>(input: &ClassifyInput<'a>) -> ClassifyInput<'a> {
    ClassifyInput {
        status: input.status,
        headers: input.headers,
        body: input.body,
        is_network_error: input.is_network_error,
        channel_type: input.channel_type,
        is_client_cancel: input.is_client_cancel,
        stream_saw_complete_sentinel: input.stream_saw_complete_sentinel,
        content_type: input.content_type,
    }
}

fn classify_4xx(input: &ClassifyInput<'_>) -> Classification {
    match input.status {
        401 | 403 => Classification {
            action: Action::RetryKey,
            cooldown_level: CooldownLevel::Key,
            cooldown_until_override: None,
        },
        429 => {
            let retry_after = parse_retry_after(input.headers, 0);
            if is_channel_wide_rate_limit(input.body) {
                Classification {
                    action: Action::RetryChannel,
                    cooldown_level: CooldownLevel::Channel,
                    cooldown_until_override: retry_after,
                }
            } else {
                Classification {
                    action: Action::RetryKey,
                    cooldown_level: CooldownLevel::Key,
                    cooldown_until_override: retry_after,
                }
            }
        }
        400 => {
            if body_error_type_contains(input.body, "api_key") {
                Classification {
                    action: Action::RetryKey,
                    cooldown_level: CooldownLevel::Key,
                    cooldown_until_override: None,
                }
            } else {
                Classification {
                    action: Action::ReturnClient,
                    cooldown_level: CooldownLevel::None,
                    cooldown_until_override: None,
                }
            }
        }
        404 => {
            if body_error_type_contains(input.body, "model") {
                Classification {
                    action: Action::ReturnClient,
                    cooldown_level: CooldownLevel::None,
                    cooldown_until_override: None,
                }
            } else {
                Classification {
                    action: Action::RetryChannel,
                    cooldown_level: CooldownLevel::Channel,
                    cooldown_until_override: None,
                }
            }
        }
        _ => Classification {
            action: Action::ReturnClient,
            cooldown_level: CooldownLevel::None,
            cooldown_until_override: None,
        },
    }
}

fn is_plausible_soft_error_content_type(content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => ct.starts_with("text/plain") || ct.starts_with("application/json"),
        None => false,
    }
}

/// Returns `Some(596)` / `Some(597)` when a nominally-200 body is actually
/// an error payload, else `None`.
fn detect_soft_error(body: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(body).ok()?;
    if text.contains("当前模型负载过高") || text.contains("Current model load too high") {
        return Some(STATUS_SSE_ERROR);
    }
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("error").is_some() || value.get("type").and_then(Value::as_str) == Some("error") {
        if is_1308(&value) {
            return Some(STATUS_QUOTA_1308);
        }
        return Some(STATUS_SSE_ERROR);
    }
    None
}

fn is_1308(value: &Value) -> bool {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(Value::as_i64)
        == Some(1308)
}

fn body_error_type_contains(body: &[u8], needle: &str) -> bool {
    let Ok(text) = std::str::from_utf8(body) else {
        return false;
    };
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return false;
    };
    value
        .get("error")
        .and_then(|e| e.get("type"))
        .and_then(Value::as_str)
        .map(|t| t.contains(needle))
        .unwrap_or(false)
}

fn is_channel_wide_rate_limit(body: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(body) else {
        return false;
    };
    text.to_ascii_lowercase().contains("overloaded") || text.to_ascii_lowercase().contains("capacity")
}

/// Parses `{"error":{"code":1308,"reset_at":<unix seconds>}}`.
pub fn parse_reset_at(body: &[u8]) -> Option<i64> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("reset_at"))
        .and_then(Value::as_i64)
}

/// `Retry-After` may be delta-seconds or an HTTP-date; only delta-seconds
/// is supported (vendors in scope only ever send the numeric form).
pub fn parse_retry_after(headers: &HeaderMap, now: i64) -> Option<i64> {
    let raw = headers.get("retry-after")?.to_str().ok()?;
    let secs: i64 = raw.trim().parse().ok()?;
    Some(now + secs)
}

/// Translate the internal/terminal status into what the client actually
/// sees. Upstream statuses pass through untouched except the sentinels;
/// a legitimate upstream 499 is remapped to 502 to keep 499 reserved for
/// client-cancel.
pub fn final_client_status(status: u16) -> u16 {
    match status {
        STATUS_QUOTA_1308 => 429,
        STATUS_SSE_ERROR => 502,
        STATUS_FIRST_BYTE_TIMEOUT => 504,
        STATUS_STREAM_INCOMPLETE => 502,
        499 => 502,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input(status: u16, headers: &HeaderMap) -> ClassifyInput<'_> {
        ClassifyInput {
            status,
            headers,
            body: b"",
            is_network_error: false,
            channel_type: ChannelType::Anthropic,
            is_client_cancel: false,
            stream_saw_complete_sentinel: false,
            content_type: None,
        }
    }

    #[test]
    fn unauthorized_retries_key() {
        let headers = HeaderMap::new();
        let input = base_input(401, &headers);
        let c = classify(&input, 0);
        assert_eq!(c.action, Action::RetryKey);
        assert_eq!(c.cooldown_level, CooldownLevel::Key);
    }

    #[test]
    fn server_error_retries_channel() {
        let headers = HeaderMap::new();
        let input = base_input(503, &headers);
        let c = classify(&input, 0);
        assert_eq!(c.action, Action::RetryChannel);
        assert_eq!(c.cooldown_level, CooldownLevel::Channel);
    }

    #[test]
    fn stream_complete_masks_late_rst() {
        let headers = HeaderMap::new();
        let mut input = base_input(599, &headers);
        input.stream_saw_complete_sentinel = true;
        let c = classify(&input, 0);
        assert_eq!(c.action, Action::ReturnClient);
        assert_eq!(c.cooldown_level, CooldownLevel::None);
    }

    #[test]
    fn client_cancel_returns_with_no_cooldown() {
        let headers = HeaderMap::new();
        let mut input = base_input(499, &headers);
        input.is_client_cancel = true;
        let c = classify(&input, 0);
        assert_eq!(c.action, Action::ReturnClient);
        assert_eq!(c.cooldown_level, CooldownLevel::None);
    }

    #[test]
    fn quota_1308_parses_reset_at_as_cooldown_override() {
        let body = br#"{"error":{"code":1308,"reset_at":1700000000}}"#;
        let headers = HeaderMap::new();
        let mut input = base_input(STATUS_QUOTA_1308, &headers);
        input.body = body;
        let c = classify(&input, 0);
        assert_eq!(c.action, Action::RetryKey);
        assert_eq!(c.cooldown_until_override, Some(1_700_000_000));
    }

    #[test]
    fn final_status_mapping_translates_sentinels() {
        assert_eq!(final_client_status(STATUS_QUOTA_1308), 429);
        assert_eq!(final_client_status(STATUS_SSE_ERROR), 502);
        assert_eq!(final_client_status(STATUS_FIRST_BYTE_TIMEOUT), 504);
        assert_eq!(final_client_status(STATUS_STREAM_INCOMPLETE), 502);
        assert_eq!(final_client_status(499), 502);
        assert_eq!(final_client_status(200), 200);
    }

    #[test]
    fn soft_error_200_body_reclassified_to_sse_error() {
        let body = br#"{"type":"error","error":{"message":"boom"}}"#;
        let headers = HeaderMap::new();
        let mut input = base_input(200, &headers);
        input.body = body;
        input.content_type = Some("application/json");
        let c = classify(&input, 0);
        assert_eq!(c.action, Action::RetryChannel);
    }
}
