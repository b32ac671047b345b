//! HTTP entry point: admission control, auth, classification, dispatch via
//! the retry orchestrator, and structured request/response logging.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use ccload_common::ChannelType;
use ccload_protocol::{classify_path, extract_model_and_stream, max_body_bytes_for_path, VendorKind};
use ccload_storage::{Channel, LogEntry};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::final_client_status;
use crate::error::ProxyError;
use crate::forwarder::{inject_auth, ForwardAttempt, ForwardBody, OutboundRequest};
use crate::orchestrator::RequestContext;
use crate::state::AppState;

/// Hop-by-hop headers stripped before re-sending upstream, and before
/// mirroring the upstream's response headers back to the client.
const STRIPPED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "x-api-key",
    "x-goog-api-key",
    "authorization",
];

pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let path = uri.path().to_string();
    let query = uri.query().unwrap_or("").to_string();

    let body_cap = max_body_bytes_for_path(&path).min(state.config.load().max_body_bytes);
    if body.len() > body_cap {
        return ProxyError::payload_too_large("request body exceeds the configured limit").into_response();
    }

    let Some(vendor) = classify_path(&path) else {
        return ProxyError::not_found("unrecognized endpoint").into_response();
    };

    let auth_ctx = match state.auth.authenticate(&headers, &query).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };

    let (model, is_stream) = extract_model_and_stream(&path, &body);
    let Some(model) = model else {
        return ProxyError::bad_request("request is missing a model").into_response();
    };
    if !auth_ctx.allows_model(&model) {
        return ProxyError::new(StatusCode::FORBIDDEN, "token is not permitted to use this model").into_response();
    }
    if auth_ctx.exceeds_cost_cap(0) {
        return ProxyError::new(StatusCode::PAYMENT_REQUIRED, "token has exceeded its configured cost cap").into_response();
    }

    let Some(_permit) = state.admission.clone().try_acquire_owned().ok() else {
        return ProxyError::service_unavailable("server is at capacity").into_response();
    };

    let allowed_channel_types = allowed_channel_types_for(vendor);
    let client_ip = client_ip(&headers);
    let active = state
        .active_requests
        .register(model.clone(), client_ip, is_stream, auth_ctx.token_id);

    info!(
        event = "downstream_received",
        trace_id = %trace_id,
        model = %model,
        is_stream,
        path = %path,
    );

    let started = Instant::now();
    let cancel = CancellationToken::new();
    let inbound_headers = headers.clone();
    let model_for_closure = model.clone();
    let body_for_closure = body.clone();
    let path_for_closure = path.clone();
    let query_for_closure = query.clone();
    let wreq_method = to_wreq_method(&method);

    let build_request = move |channel: &Channel, api_key: &ccload_storage::ApiKey, cancel: CancellationToken| {
        let mut url = format!("{}{}", channel.base_url.trim_end_matches('/'), path_for_closure);
        if !query_for_closure.is_empty() {
            url.push('?');
            url.push_str(&query_for_closure);
        }
        let mut out_headers = http::HeaderMap::new();
        for (name, value) in inbound_headers.iter() {
            if STRIPPED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            out_headers.insert(name.clone(), value.clone());
        }
        let redirected = apply_model_redirect(&body_for_closure, &model_for_closure, channel);
        inject_auth(channel.channel_type, &api_key.secret, &mut url, &mut out_headers);

        OutboundRequest {
            method: wreq_method.clone(),
            url,
            headers: out_headers,
            body: Some(redirected),
            channel_type: channel.channel_type,
            is_stream,
            cancel,
            vendor,
            _marker: std::marker::PhantomData,
        }
    };

    let ctx = RequestContext {
        model: &model,
        allowed_channel_types: &allowed_channel_types,
        build_request: &build_request,
        cancel: cancel.clone(),
    };

    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let result = state.orchestrator.dispatch(&ctx, now).await;
    state.active_requests.remove(active.id);

    match result {
        Ok(dispatched) => {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let masked = dispatched.masked_key.clone();
            log_and_respond(
                &state,
                dispatched,
                &model,
                masked,
                elapsed_ms,
                auth_ctx.token_id,
                auth_ctx.token_hash.clone(),
                trace_id,
            )
        }
        Err(exhausted) => {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let status = final_client_status(exhausted.status);
            warn!(
                event = "downstream_responded",
                trace_id = %trace_id,
                model = %model,
                status,
                elapsed_ms,
                "all routing attempts exhausted"
            );
            state.log_writer.add_log_async(LogEntry {
                timestamp: time::OffsetDateTime::now_utc(),
                model: model.clone(),
                channel_id: 0,
                status,
                duration_ms: elapsed_ms,
                is_stream,
                masked_key: String::new(),
                token_id: auth_ctx.token_id,
                usage: Default::default(),
                cost_micro_usd: 0,
                message: exhausted.message.clone(),
            });
            record_token_stats(&state, auth_ctx.token_hash.clone(), false, elapsed_ms, is_stream, None, 0);
            ProxyError::new(
                StatusCode::from_u16(status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE),
                exhausted.message.unwrap_or_else(|| "no upstream available".to_string()),
            )
            .into_response()
        }
    }
}

/// Persists running per-token spend/success stats. Cost-table lookup
/// (`model, usage -> USD`) is an external collaborator; `cost_micro_usd` is
/// whatever the caller already computed (0 until one is wired in), so this
/// only ever grows cumulative spend when a real cost function is plugged
/// into the usage parsers upstream of here.
fn record_token_stats(
    state: &Arc<AppState>,
    token_hash: Option<String>,
    success: bool,
    duration_ms: u64,
    is_stream: bool,
    first_byte_ms: Option<u64>,
    cost_micro_usd: i64,
) {
    let Some(hash) = token_hash else {
        return;
    };
    let storage = state.storage.clone();
    tokio::spawn(async move {
        if let Err(err) = storage
            .update_token_stats(&hash, success, duration_ms, is_stream, first_byte_ms, cost_micro_usd)
            .await
        {
            warn!(error = %err, "failed to persist token stats");
        }
    });
}

fn log_and_respond(
    state: &Arc<AppState>,
    dispatched: crate::orchestrator::Dispatched,
    model: &str,
    masked_key: String,
    elapsed_ms: u64,
    token_id: Option<i64>,
    token_hash: Option<String>,
    trace_id: String,
) -> Response {
    match dispatched.attempt {
        ForwardAttempt::Streaming {
            status,
            headers,
            body,
            completion,
        } => {
            let state = state.clone();
            let model = model.to_string();
            let channel_id = dispatched.channel_id;
            let key_index = dispatched.key_index;
            tokio::spawn(async move {
                if let Ok(completion) = completion.await {
                    let _ = state.cooldown.clear_success(channel_id, key_index).await;
                    if let Some(hash) = &token_hash {
                        let first_byte_ms = completion.first_byte_elapsed.map(|d| d.as_millis() as u64);
                        if let Err(err) = state
                            .storage
                            .update_token_stats(hash, completion.sse_error.is_none(), elapsed_ms, true, first_byte_ms, 0)
                            .await
                        {
                            warn!(error = %err, "failed to persist token stats");
                        }
                    }
                    state.log_writer.add_log_async(LogEntry {
                        timestamp: time::OffsetDateTime::now_utc(),
                        model,
                        channel_id,
                        status,
                        duration_ms: elapsed_ms,
                        is_stream: true,
                        masked_key,
                        token_id,
                        usage: completion.usage.unwrap_or_default(),
                        cost_micro_usd: 0,
                        message: completion.diagnostic,
                    });
                }
            });
            let ForwardBody::Stream(rx) = body else {
                unreachable!("streaming attempts always carry a Stream body")
            };
            let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
            let mut resp = Response::new(Body::from_stream(stream));
            *resp.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            copy_response_headers(&headers, resp.headers_mut());
            insert_trace_id(&mut resp, &trace_id);
            resp
        }
        ForwardAttempt::Buffered {
            status,
            headers,
            body,
            content_type: _,
        } => {
            let final_status = final_client_status(status);
            info!(
                event = "downstream_responded",
                trace_id = %trace_id,
                model = %model,
                status = final_status,
                elapsed_ms,
                is_stream = false,
            );
            state.log_writer.add_log_async(LogEntry {
                timestamp: time::OffsetDateTime::now_utc(),
                model: model.to_string(),
                channel_id: dispatched.channel_id,
                status: final_status,
                duration_ms: elapsed_ms,
                is_stream: false,
                masked_key,
                token_id,
                usage: ccload_protocol::UsageTuple::default(),
                cost_micro_usd: 0,
                message: None,
            });
            record_token_stats(state, token_hash, (200..300).contains(&final_status), elapsed_ms, false, None, 0);
            let mut resp = Response::new(Body::from(body));
            *resp.status_mut() = StatusCode::from_u16(final_status).unwrap_or(StatusCode::OK);
            copy_response_headers(&headers, resp.headers_mut());
            insert_trace_id(&mut resp, &trace_id);
            resp
        }
        ForwardAttempt::Failed { .. } => {
            // The orchestrator never returns `Ok(Dispatched)` wrapping a
            // `Failed` attempt; only `Streaming`/`Buffered` ever commit.
            ProxyError::new(StatusCode::BAD_GATEWAY, "upstream request failed").into_response()
        }
    }
}

fn copy_response_headers(src: &http::HeaderMap, dst: &mut http::HeaderMap) {
    for (name, value) in src.iter() {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        dst.insert(name.clone(), value.clone());
    }
}

fn insert_trace_id(resp: &mut Response, trace_id: &str) {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        resp.headers_mut().insert(HeaderName::from_static("x-ccload-request-id"), value);
    }
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .unwrap_or("unknown")
        .to_string()
}

fn allowed_channel_types_for(vendor: VendorKind) -> Vec<ChannelType> {
    match vendor {
        VendorKind::Anthropic => vec![ChannelType::Anthropic],
        VendorKind::OpenAi => vec![ChannelType::OpenAi, ChannelType::Codex],
        VendorKind::Gemini => vec![ChannelType::Gemini],
    }
}

fn apply_model_redirect(body: &Bytes, model: &str, channel: &Channel) -> Bytes {
    let Some(target) = channel.model_redirects.get(model) else {
        return body.clone();
    };
    let Ok(mut value) = serde_json::from_slice::<Value>(body) else {
        return body.clone();
    };
    if let Some(obj) = value.as_object_mut() {
        obj.insert("model".to_string(), Value::String(target.clone()));
    }
    match serde_json::to_vec(&value) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => body.clone(),
    }
}

fn to_wreq_method(method: &Method) -> wreq::Method {
    wreq::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(wreq::Method::POST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccload_common::KeyStrategy;
    use std::collections::HashMap;

    fn channel() -> Channel {
        Channel {
            id: 1,
            name: "primary".into(),
            base_url: "https://api.example.com".into(),
            channel_type: ChannelType::Anthropic,
            models: vec!["claude-3-opus".into()],
            model_redirects: HashMap::from([("claude-3-opus".to_string(), "claude-3-opus-20240229".to_string())]),
            key_strategy: KeyStrategy::Sequential,
            priority: 0,
            enabled: true,
        }
    }

    #[test]
    fn model_redirect_rewrites_model_field() {
        let body = Bytes::from_static(br#"{"model":"claude-3-opus","stream":false}"#);
        let redirected = apply_model_redirect(&body, "claude-3-opus", &channel());
        let value: Value = serde_json::from_slice(&redirected).unwrap();
        assert_eq!(value["model"], "claude-3-opus-20240229");
    }

    #[test]
    fn no_redirect_configured_returns_original_bytes_unchanged() {
        let body = Bytes::from_static(br#"{"model":"claude-3-haiku"}"#);
        let redirected = apply_model_redirect(&body, "claude-3-haiku", &channel());
        assert_eq!(redirected, body);
    }

    #[test]
    fn allowed_channel_types_include_both_openai_and_codex_for_openai_paths() {
        let allowed = allowed_channel_types_for(VendorKind::OpenAi);
        assert!(allowed.contains(&ChannelType::OpenAi));
        assert!(allowed.contains(&ChannelType::Codex));
    }

    #[tokio::test]
    async fn proxy_handler_rejects_token_already_over_its_cost_cap() {
        use crate::auth::hash_token;
        use ccload_common::GlobalConfig;
        use ccload_storage::{InMemoryStorage, Storage, Token};

        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let token = "sk-over-budget";
        storage
            .upsert_token(Token {
                id: 1,
                hash: hash_token(token),
                active: true,
                expires_at: None,
                allowed_models: None,
                cost_cap_micro_usd: Some(1_000),
                spent_micro_usd: 1_000,
            })
            .await
            .unwrap();

        let config = GlobalConfig {
            admin_password: "secret".into(),
            api_tokens: vec![],
            max_key_retries: 3,
            max_concurrency: 10,
            upstream_first_byte_timeout_secs: None,
            skip_tls_verify: false,
            log_buffer: 16,
            log_workers: 1,
            max_body_bytes: 1024 * 1024,
        };
        let state = Arc::new(AppState::bootstrap(config, storage).await.unwrap());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {token}").parse().unwrap());
        let body = Bytes::from_static(br#"{"model":"claude-3-opus","stream":false}"#);
        let uri: Uri = "/v1/messages".parse().unwrap();

        let resp = proxy_handler(State(state), Method::POST, uri, headers, body).await;
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
    }
}
