//! Per-vendor token usage extraction, for both buffered JSON bodies and SSE
//! streams. Field paths below are the ones each vendor actually emits:
//!
//! - anthropic: `usage.{input_tokens,output_tokens,cache_read_input_tokens,
//!   cache_creation_input_tokens}` plus optional
//!   `usage.cache_creation.ephemeral_{5m,1h}_input_tokens`.
//! - openai/codex: `usage.{prompt_tokens,completion_tokens,
//!   prompt_tokens_details.cached_tokens}`.
//! - gemini: `usageMetadata.{promptTokenCount,candidatesTokenCount}`.

use crate::sse::SseParser;
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTuple {
    pub input_billable: i64,
    pub output: i64,
    pub cache_read: i64,
    pub cache_create: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorKind {
    Anthropic,
    OpenAi,
    Gemini,
}

/// `inputBillable = max(0, prompt_tokens - cached_tokens)`.
fn normalize_openai(prompt_tokens: i64, cached_tokens: i64) -> (i64, i64) {
    if cached_tokens <= prompt_tokens {
        (prompt_tokens - cached_tokens, cached_tokens)
    } else {
        (0, 0)
    }
}

fn extract_anthropic_usage(usage: &Value) -> UsageTuple {
    let input = usage.get("input_tokens").and_then(Value::as_i64).unwrap_or(0);
    let output = usage.get("output_tokens").and_then(Value::as_i64).unwrap_or(0);
    let cache_read = usage
        .get("cache_read_input_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let mut cache_create = usage
        .get("cache_creation_input_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if let Some(detail) = usage.get("cache_creation") {
        let ephemeral_5m = detail
            .get("ephemeral_5m_input_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let ephemeral_1h = detail
            .get("ephemeral_1h_input_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if ephemeral_5m + ephemeral_1h > 0 {
            cache_create = ephemeral_5m + ephemeral_1h;
        }
    }
    UsageTuple {
        input_billable: input,
        output,
        cache_read,
        cache_create,
    }
}

fn extract_openai_usage(usage: &Value) -> UsageTuple {
    let prompt = usage.get("prompt_tokens").and_then(Value::as_i64).unwrap_or(0);
    let completion = usage
        .get("completion_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let cached = usage
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let (input_billable, cache_read) = normalize_openai(prompt, cached);
    UsageTuple {
        input_billable,
        output: completion,
        cache_read,
        cache_create: 0,
    }
}

fn extract_gemini_usage(metadata: &Value) -> UsageTuple {
    let input = metadata
        .get("promptTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let output = metadata
        .get("candidatesTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    UsageTuple {
        input_billable: input,
        output,
        cache_read: 0,
        cache_create: 0,
    }
}

/// Buffered (non-streaming) JSON body usage parser. Bytes fed across
/// multiple calls are concatenated before the single parse on `finish`.
#[derive(Debug, Default)]
pub struct JsonUsageParser {
    buffer: Vec<u8>,
}

impl JsonUsageParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn finish(&self, vendor: VendorKind) -> Option<UsageTuple> {
        let value: Value = serde_json::from_slice(&self.buffer).ok()?;
        match vendor {
            VendorKind::Anthropic => value.get("usage").map(extract_anthropic_usage),
            VendorKind::OpenAi => value.get("usage").map(extract_openai_usage),
            VendorKind::Gemini => value.get("usageMetadata").map(extract_gemini_usage),
        }
    }

    /// A top-level `{"error": ...}` body, regardless of vendor.
    pub fn last_error(&self) -> Option<String> {
        let value: Value = serde_json::from_slice(&self.buffer).ok()?;
        value.get("error").map(|e| e.to_string())
    }
}

/// Streaming (SSE) usage parser: the *last* usage-bearing event wins, since
/// openai only emits usage in its final chunk while anthropic emits
/// cumulative usage in `message_delta`.
#[derive(Debug)]
pub struct SseUsageParser {
    vendor: VendorKind,
    parser: SseParser,
    usage: Option<UsageTuple>,
    last_error: Option<String>,
    stream_complete: bool,
}

impl SseUsageParser {
    pub fn new(vendor: VendorKind) -> Self {
        Self {
            vendor,
            parser: SseParser::new(),
            usage: None,
            last_error: None,
            stream_complete: false,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let events = self.parser.push_str(&text);
        for event in events {
            self.push_event(event.event.as_deref(), &event.data);
        }
    }

    fn push_event(&mut self, event_name: Option<&str>, data: &str) {
        if data == "[DONE]" {
            self.stream_complete = true;
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return;
        };
        if let Some(err) = value.get("error") {
            self.last_error = Some(err.to_string());
        }
        match self.vendor {
            VendorKind::Anthropic => {
                if event_name == Some("message_stop") {
                    self.stream_complete = true;
                }
                if let Some(usage) = value.get("usage") {
                    self.usage = Some(extract_anthropic_usage(usage));
                } else if let Some(delta) = value.get("delta").and_then(|d| d.get("usage")) {
                    self.usage = Some(extract_anthropic_usage(delta));
                }
            }
            VendorKind::OpenAi => {
                if value.get("type").and_then(Value::as_str) == Some("response.completed") {
                    self.stream_complete = true;
                }
                if let Some(usage) = value.get("usage") {
                    self.usage = Some(extract_openai_usage(usage));
                } else if let Some(usage) = value
                    .get("response")
                    .and_then(|r| r.get("usage"))
                {
                    self.usage = Some(extract_openai_usage(usage));
                }
            }
            VendorKind::Gemini => {
                if let Some(metadata) = value.get("usageMetadata") {
                    self.usage = Some(extract_gemini_usage(metadata));
                }
                if value
                    .get("candidates")
                    .and_then(Value::as_array)
                    .and_then(|c| c.first())
                    .and_then(|c| c.get("finishReason"))
                    .is_some()
                {
                    self.stream_complete = true;
                }
            }
        }
    }

    /// Call once the upstream body has been fully read, to flush any
    /// partial trailing event.
    pub fn finish(&mut self) {
        let events = self.parser.finish();
        for event in events {
            self.push_event(event.event.as_deref(), &event.data);
        }
    }

    pub fn usage(&self) -> Option<UsageTuple> {
        self.usage
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_stream_complete(&self) -> bool {
        self.stream_complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_input_billable_subtracts_cache() {
        let usage = serde_json::json!({
            "prompt_tokens": 100,
            "completion_tokens": 20,
            "prompt_tokens_details": {"cached_tokens": 30}
        });
        let parsed = extract_openai_usage(&usage);
        assert_eq!(parsed.input_billable, 70);
        assert_eq!(parsed.cache_read, 30);
        assert_eq!(parsed.output, 20);
    }

    #[test]
    fn openai_cache_exceeding_prompt_clamps_to_zero() {
        let usage = serde_json::json!({
            "prompt_tokens": 10,
            "completion_tokens": 5,
            "prompt_tokens_details": {"cached_tokens": 999}
        });
        let parsed = extract_openai_usage(&usage);
        assert_eq!(parsed.input_billable, 0);
        assert_eq!(parsed.cache_read, 0);
    }

    #[test]
    fn anthropic_sse_message_stop_sets_complete_and_last_usage_wins() {
        let mut p = SseUsageParser::new(VendorKind::Anthropic);
        p.feed(b"event: message_delta\ndata: {\"delta\":{\"usage\":{\"input_tokens\":1,\"output_tokens\":2}}}\n\n");
        p.feed(b"event: message_delta\ndata: {\"delta\":{\"usage\":{\"input_tokens\":1,\"output_tokens\":9}}}\n\n");
        p.feed(b"event: message_stop\ndata: {}\n\n");
        assert!(p.is_stream_complete());
        assert_eq!(p.usage().unwrap().output, 9);
    }

    #[test]
    fn openai_sse_done_marker_sets_complete() {
        let mut p = SseUsageParser::new(VendorKind::OpenAi);
        p.feed(b"data: {\"choices\":[]}\n\n");
        p.feed(b"data: [DONE]\n\n");
        assert!(p.is_stream_complete());
    }

    #[test]
    fn malformed_json_line_is_ignored_not_fatal() {
        let mut p = SseUsageParser::new(VendorKind::OpenAi);
        p.feed(b"data: {not json\n\n");
        p.feed(b"data: [DONE]\n\n");
        assert!(p.is_stream_complete());
    }
}
