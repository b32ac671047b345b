//! Inbound request authentication: extract a bearer-style token from the
//! request, hash it, and look it up against the storage collaborator.
//! Admin-session authentication (bcrypt password compare, `/login`) is an
//! admin-HTTP-surface concern and out of scope here — only the narrow
//! boundary the data plane needs is implemented.

use async_trait::async_trait;
use ccload_storage::Storage;
use http::{HeaderMap, StatusCode};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::AuthError;

#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub token_id: Option<i64>,
    /// Set only for storage-backed tokens; static `CCLOAD_AUTH` tokens have
    /// no stored record to accumulate spend against.
    pub token_hash: Option<String>,
    pub allowed_models: Option<Vec<String>>,
    pub cost_cap_micro_usd: Option<i64>,
    pub spent_micro_usd: i64,
}

impl AuthContext {
    /// `None` means no per-token allow-list restriction.
    pub fn allows_model(&self, model: &str) -> bool {
        match &self.allowed_models {
            Some(models) => models.iter().any(|m| m == model),
            None => true,
        }
    }

    pub fn exceeds_cost_cap(&self, projected_spend_micro_usd: i64) -> bool {
        match self.cost_cap_micro_usd {
            Some(cap) => self.spent_micro_usd + projected_spend_micro_usd > cap,
            None => false,
        }
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap, query: &str) -> Result<AuthContext, AuthError>;
}

pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Looks tokens up in comma-separated `CCLOAD_AUTH` tokens first (fast
/// path, no storage round trip), then falls back to stored per-token
/// records (allow-lists, cost caps).
pub struct StorageAuth {
    storage: Arc<dyn Storage>,
    static_tokens: Vec<String>,
}

impl StorageAuth {
    pub fn new(storage: Arc<dyn Storage>, static_tokens: Vec<String>) -> Self {
        Self {
            storage,
            static_tokens,
        }
    }
}

#[async_trait]
impl AuthProvider for StorageAuth {
    async fn authenticate(&self, headers: &HeaderMap, query: &str) -> Result<AuthContext, AuthError> {
        let token = extract_token(headers, query)
            .ok_or_else(|| AuthError::new(StatusCode::UNAUTHORIZED, "missing api token"))?;

        if self.static_tokens.iter().any(|t| t == &token) {
            return Ok(AuthContext::default());
        }

        let hash = hash_token(&token);
        let record = self
            .storage
            .get_token_by_hash(&hash)
            .await
            .map_err(|_| AuthError::new(StatusCode::INTERNAL_SERVER_ERROR, "token lookup failed"))?
            .ok_or_else(|| AuthError::new(StatusCode::UNAUTHORIZED, "invalid api token"))?;

        if !record.active {
            return Err(AuthError::new(StatusCode::FORBIDDEN, "token disabled"));
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at <= time::OffsetDateTime::now_utc() {
                return Err(AuthError::new(StatusCode::FORBIDDEN, "token expired"));
            }
        }

        Ok(AuthContext {
            token_id: Some(record.id),
            token_hash: Some(hash),
            allowed_models: record.allowed_models,
            cost_cap_micro_usd: record.cost_cap_micro_usd,
            spent_micro_usd: record.spent_micro_usd,
        })
    }
}

fn extract_token(headers: &HeaderMap, query: &str) -> Option<String> {
    if let Some(value) = header_str(headers, "x-api-key") {
        return Some(value);
    }
    if let Some(value) = header_str(headers, "x-goog-api-key") {
        return Some(value);
    }
    if let Some(auth) = header_str(headers, "authorization") {
        let trimmed = auth.trim();
        if let Some(token) = trimmed.strip_prefix("Bearer ").or_else(|| trimmed.strip_prefix("bearer ")) {
            return Some(token.trim().to_string());
        }
    }
    query_param(query, "key")
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let k = parts.next()?;
        let v = parts.next()?;
        if k == key { Some(v.to_string()) } else { None }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-test-123".parse().unwrap());
        assert_eq!(extract_token(&headers, ""), Some("sk-test-123".to_string()));
    }

    #[test]
    fn extracts_query_key_param() {
        assert_eq!(
            query_param("key=abc&other=1", "key"),
            Some("abc".to_string())
        );
    }

    #[test]
    fn allow_list_none_permits_any_model() {
        let ctx = AuthContext::default();
        assert!(ctx.allows_model("anything"));
    }

    #[test]
    fn cost_cap_exceeded_blocks_further_spend() {
        let ctx = AuthContext {
            cost_cap_micro_usd: Some(1_000_000),
            spent_micro_usd: 900_000,
            ..Default::default()
        };
        assert!(ctx.exceeds_cost_cap(200_000));
        assert!(!ctx.exceeds_cost_cap(50_000));
    }
}
