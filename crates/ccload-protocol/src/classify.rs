//! Inbound request classification: which vendor dialect a path belongs to,
//! and which model/streaming-flag the request carries. This never parses a
//! vendor's full request schema — only the handful of fields routing needs.

use crate::usage::VendorKind;
use serde_json::Value;

/// Identify the vendor dialect a request path belongs to. Returns `None`
/// for paths this proxy does not recognize.
pub fn classify_path(path: &str) -> Option<VendorKind> {
    if path.starts_with("/v1/messages") {
        Some(VendorKind::Anthropic)
    } else if path.starts_with("/v1/chat/completions")
        || path.starts_with("/v1/responses")
        || path.starts_with("/v1/models")
        || path.starts_with("/v1/embeddings")
        || path.starts_with("/v1/images/")
    {
        Some(VendorKind::OpenAi)
    } else if path.starts_with("/v1beta/models") {
        Some(VendorKind::Gemini)
    } else {
        None
    }
}

/// Splits a gemini-style `models/{model}:generateContent` path segment into
/// `(model, action)`. Returns `None` if the segment carries no `:` action.
pub fn split_model_action(segment: &str) -> Option<(&str, &str)> {
    let idx = segment.rfind(':')?;
    Some((&segment[..idx], &segment[idx + 1..]))
}

/// Default body-size cap in bytes; images endpoints use a larger cap.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
pub const IMAGES_MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

pub fn max_body_bytes_for_path(path: &str) -> usize {
    if path.starts_with("/v1/images/") {
        IMAGES_MAX_BODY_BYTES
    } else {
        DEFAULT_MAX_BODY_BYTES
    }
}

/// Extract `model` and a streaming flag from the inbound path + body.
/// Body `"model"`/`"stream"` fields win; the gemini path segment is the
/// fallback for both when the body doesn't carry them (or isn't JSON).
pub fn extract_model_and_stream(path: &str, body: &[u8]) -> (Option<String>, bool) {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();

    let body_model = parsed
        .as_ref()
        .and_then(|v| v.get("model"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let body_stream = parsed
        .as_ref()
        .and_then(|v| v.get("stream"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut path_model = None;
    let mut path_is_stream = false;
    if let Some(segment) = path.rsplit('/').next() {
        if let Some((model, action)) = split_model_action(segment) {
            path_model = Some(model.to_string());
            path_is_stream = action == "streamGenerateContent";
        }
    }

    let model = body_model.or(path_model);
    let is_stream = body_stream || path_is_stream;
    (model, is_stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_path_classified() {
        assert_eq!(classify_path("/v1/messages"), Some(VendorKind::Anthropic));
        assert_eq!(
            classify_path("/v1/messages/count_tokens"),
            Some(VendorKind::Anthropic)
        );
    }

    #[test]
    fn gemini_stream_action_split() {
        let (model, action) = split_model_action("gemini-1.5-pro:streamGenerateContent").unwrap();
        assert_eq!(model, "gemini-1.5-pro");
        assert_eq!(action, "streamGenerateContent");
    }

    #[test]
    fn model_and_stream_prefer_body_over_path() {
        let body = br#"{"model":"claude-3-opus","stream":true}"#;
        let (model, stream) = extract_model_and_stream("/v1/messages", body);
        assert_eq!(model.as_deref(), Some("claude-3-opus"));
        assert!(stream);
    }

    #[test]
    fn model_and_stream_fall_back_to_gemini_path_segment() {
        let (model, stream) =
            extract_model_and_stream("/v1beta/models/gemini-1.5-flash:streamGenerateContent", b"{}");
        assert_eq!(model.as_deref(), Some("gemini-1.5-flash"));
        assert!(stream);
    }

    #[test]
    fn images_endpoint_gets_larger_cap() {
        assert_eq!(max_body_bytes_for_path("/v1/images/generations"), IMAGES_MAX_BODY_BYTES);
        assert_eq!(max_body_bytes_for_path("/v1/chat/completions"), DEFAULT_MAX_BODY_BYTES);
    }
}
