//! Builds one upstream request, enforces a first-byte timeout, and either
//! buffers a bounded response (non-2xx, or a non-streaming body) or
//! commits to streaming straight through to the client. Once a result is
//! [`ForwardAttempt::Streaming`], the attempt is no longer retryable — the
//! caller has already returned an HTTP response to the client.

use bytes::Bytes;
use ccload_common::ChannelType;
use ccload_protocol::{SseUsageParser, UsageTuple, VendorKind};
use futures_util::StreamExt;
use http::HeaderMap as HttpHeaderMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use wreq::{Client, Method};

/// Upstream responses larger than this are truncated when buffered (non-2xx
/// bodies, soft-error peeks). Streaming bodies are never truncated.
const MAX_BUFFERED_RESPONSE_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub first_byte_timeout: Option<Duration>,
    pub skip_tls_verify: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(600),
            stream_idle_timeout: Duration::from_secs(60),
            first_byte_timeout: None,
            skip_tls_verify: false,
        }
    }
}

pub struct OutboundRequest<'a> {
    pub method: Method,
    pub url: String,
    pub headers: HttpHeaderMap,
    pub body: Option<Bytes>,
    pub channel_type: ChannelType,
    pub is_stream: bool,
    pub cancel: CancellationToken,
    pub vendor: VendorKind,
    pub _marker: std::marker::PhantomData<&'a ()>,
}

pub enum ForwardBody {
    Buffered(Bytes),
    Stream(mpsc::Receiver<std::io::Result<Bytes>>),
}

#[derive(Debug, Default)]
pub struct StreamCompletion {
    pub bytes_received: u64,
    pub first_byte_elapsed: Option<Duration>,
    pub usage: Option<UsageTuple>,
    pub stream_complete_sentinel: bool,
    pub sse_error: Option<String>,
    pub is_network_error: bool,
    pub is_client_cancel: bool,
    pub diagnostic: Option<String>,
}

pub enum ForwardAttempt {
    /// Safe to retry based on classification of `(status, headers, body)`.
    Buffered {
        status: u16,
        headers: HttpHeaderMap,
        body: Bytes,
        content_type: Option<String>,
    },
    /// Already committed to the client; only the completion accounting is
    /// still pending.
    Streaming {
        status: u16,
        headers: HttpHeaderMap,
        body: ForwardBody,
        completion: oneshot::Receiver<StreamCompletion>,
    },
    /// No response bytes exist yet; always safe to retry.
    Failed {
        is_network_error: bool,
        is_client_cancel: bool,
        /// One of the internal sentinel statuses (e.g. 598) when
        /// applicable, else 0.
        status_hint: u16,
    },
}

pub struct Forwarder {
    client: Client,
    config: ForwarderConfig,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Result<Self, wreq::Error> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout);
        if config.skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;
        Ok(Self { client, config })
    }

    pub async fn forward(&self, req: OutboundRequest<'_>) -> ForwardAttempt {
        let mut builder = self.client.request(req.method, &req.url);
        for (name, value) in req.headers.iter() {
            if let Ok(v) = value.to_str() {
                builder = builder.header(name.as_str(), v);
            }
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let send_fut = builder.send();
        let resp = tokio::select! {
            biased;
            _ = req.cancel.cancelled() => {
                return ForwardAttempt::Failed { is_network_error: true, is_client_cancel: true, status_hint: 0 };
            }
            result = send_fut => result,
        };

        let resp = match resp {
            Ok(resp) => resp,
            Err(_err) => {
                return ForwardAttempt::Failed {
                    is_network_error: true,
                    is_client_cancel: req.cancel.is_cancelled(),
                    status_hint: 0,
                };
            }
        };

        let status = resp.status().as_u16();
        let headers = headers_from_wreq(resp.headers());
        let content_type = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let is_success = (200..300).contains(&status);

        if !is_success {
            let body = read_bounded(resp, MAX_BUFFERED_RESPONSE_BYTES).await;
            return ForwardAttempt::Buffered {
                status,
                headers,
                body,
                content_type,
            };
        }

        let content_length = headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if content_length == Some(0) {
            return ForwardAttempt::Buffered {
                status: crate::classify::STATUS_STREAM_INCOMPLETE,
                headers,
                body: Bytes::new(),
                content_type,
            };
        }

        let is_soft_error_candidate = matches!(req.channel_type, ChannelType::Anthropic | ChannelType::Codex)
            && !req.is_stream
            && content_type
                .as_deref()
                .map(|ct| ct.starts_with("text/plain") || ct.starts_with("application/json"))
                .unwrap_or(false);

        if !req.is_stream || is_soft_error_candidate {
            let body = read_bounded(resp, MAX_BUFFERED_RESPONSE_BYTES).await;
            return ForwardAttempt::Buffered {
                status,
                headers,
                body,
                content_type,
            };
        }

        self.forward_streaming(resp, req.vendor, req.cancel).await
    }

    async fn forward_streaming(
        &self,
        resp: wreq::Response,
        vendor: VendorKind,
        cancel: CancellationToken,
    ) -> ForwardAttempt {
        let status = resp.status().as_u16();
        let headers = headers_from_wreq(resp.headers());
        let mut stream = resp.bytes_stream();

        let first_chunk = match self.config.first_byte_timeout {
            Some(timeout) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return ForwardAttempt::Failed { is_network_error: true, is_client_cancel: true, status_hint: 0 };
                    }
                    res = tokio::time::timeout(timeout, stream.next()) => res,
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return ForwardAttempt::Failed { is_network_error: true, is_client_cancel: true, status_hint: 0 };
                    }
                    item = stream.next() => Ok(item),
                }
            }
        };

        let first_chunk = match first_chunk {
            Err(_elapsed) => {
                return ForwardAttempt::Failed {
                    is_network_error: true,
                    is_client_cancel: false,
                    status_hint: crate::classify::STATUS_FIRST_BYTE_TIMEOUT,
                };
            }
            Ok(None) => {
                return ForwardAttempt::Buffered {
                    status: crate::classify::STATUS_STREAM_INCOMPLETE,
                    headers,
                    body: Bytes::new(),
                    content_type: None,
                };
            }
            Ok(Some(Err(_e))) => {
                return ForwardAttempt::Failed {
                    is_network_error: true,
                    is_client_cancel: cancel.is_cancelled(),
                    status_hint: 0,
                };
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        let start = Instant::now();
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(16);
        let (completion_tx, completion_rx) = oneshot::channel();
        let stream_idle_timeout = self.config.stream_idle_timeout;

        tokio::spawn(async move {
            let mut completion = StreamCompletion {
                first_byte_elapsed: Some(start.elapsed()),
                ..Default::default()
            };
            let mut usage_parser = SseUsageParser::new(vendor);
            usage_parser.feed(&first_chunk);
            completion.bytes_received += first_chunk.len() as u64;
            if tx.send(Ok(first_chunk)).await.is_err() {
                return;
            }

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        completion.is_client_cancel = true;
                        break;
                    }
                    next = tokio::time::timeout(stream_idle_timeout, stream.next()) => next,
                };
                let item = match next {
                    Ok(item) => item,
                    Err(_) => {
                        completion.is_network_error = true;
                        break;
                    }
                };
                let Some(item) = item else {
                    break;
                };
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(_) => {
                        completion.is_network_error = true;
                        break;
                    }
                };
                usage_parser.feed(&chunk);
                completion.bytes_received += chunk.len() as u64;
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }

            usage_parser.finish();
            completion.usage = usage_parser.usage();
            completion.stream_complete_sentinel = usage_parser.is_stream_complete();
            completion.sse_error = usage_parser.last_error().map(str::to_string);
            if !completion.stream_complete_sentinel
                && !completion.is_client_cancel
                && (completion.is_network_error || completion.sse_error.is_some())
            {
                completion.diagnostic = Some("stream ended without completion sentinel".to_string());
            }
            let _ = completion_tx.send(completion);
        });

        ForwardAttempt::Streaming {
            status,
            headers,
            body: ForwardBody::Stream(rx),
            completion: completion_rx,
        }
    }
}

async fn read_bounded(resp: wreq::Response, cap: usize) -> Bytes {
    match resp.bytes().await {
        Ok(bytes) if bytes.len() > cap => bytes.slice(0..cap),
        Ok(bytes) => bytes,
        Err(_) => Bytes::new(),
    }
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> HttpHeaderMap {
    let mut out = HttpHeaderMap::new();
    for (k, v) in map {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(k.as_str().as_bytes()),
            http::header::HeaderValue::from_bytes(v.as_bytes()),
        ) {
            out.insert(name, value);
        }
    }
    out
}

/// Injects the vendor-appropriate auth header/query parameter for an
/// outbound request.
pub fn inject_auth(channel_type: ChannelType, secret: &str, url: &mut String, headers: &mut HttpHeaderMap) {
    match channel_type {
        ChannelType::Anthropic | ChannelType::Codex => {
            if let Ok(value) = http::header::HeaderValue::from_str(secret) {
                headers.insert("x-api-key", value);
            }
        }
        ChannelType::OpenAi => {
            if let Ok(value) = http::header::HeaderValue::from_str(&format!("Bearer {secret}")) {
                headers.insert(http::header::AUTHORIZATION, value);
            }
        }
        ChannelType::Gemini => {
            if let Ok(value) = http::header::HeaderValue::from_str(secret) {
                headers.insert("x-goog-api-key", value);
            }
            if url.contains("key=") {
                *url = replace_query_key(url, secret);
            }
        }
    }
}

fn replace_query_key(url: &str, secret: &str) -> String {
    let (base, query) = match url.split_once('?') {
        Some((b, q)) => (b, q),
        None => return url.to_string(),
    };
    let rebuilt: Vec<String> = query
        .split('&')
        .map(|pair| {
            if pair.starts_with("key=") {
                format!("key={secret}")
            } else {
                pair.to_string()
            }
        })
        .collect();
    format!("{base}?{}", rebuilt.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_auth_openai_sets_bearer_header() {
        let mut headers = HttpHeaderMap::new();
        let mut url = "https://api.openai.com/v1/chat/completions".to_string();
        inject_auth(ChannelType::OpenAi, "sk-test", &mut url, &mut headers);
        assert_eq!(headers.get(http::header::AUTHORIZATION).unwrap(), "Bearer sk-test");
    }

    #[test]
    fn inject_auth_anthropic_sets_x_api_key() {
        let mut headers = HttpHeaderMap::new();
        let mut url = "https://api.anthropic.com/v1/messages".to_string();
        inject_auth(ChannelType::Anthropic, "sk-ant-test", &mut url, &mut headers);
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant-test");
    }

    #[test]
    fn inject_auth_gemini_replaces_query_key() {
        let mut headers = HttpHeaderMap::new();
        let mut url = "https://generativelanguage.googleapis.com/v1beta/models/x?key=old".to_string();
        inject_auth(ChannelType::Gemini, "new-secret", &mut url, &mut headers);
        assert!(url.ends_with("key=new-secret"));
        assert_eq!(headers.get("x-goog-api-key").unwrap(), "new-secret");
    }
}
