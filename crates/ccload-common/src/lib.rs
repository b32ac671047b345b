use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Admin password, compared against `CCLOAD_PASS`.
    pub admin_password: String,
    /// API tokens accepted on inbound requests (`CCLOAD_AUTH`, comma-separated).
    pub api_tokens: Vec<String>,
    pub max_key_retries: u32,
    pub max_concurrency: usize,
    pub upstream_first_byte_timeout_secs: Option<u64>,
    pub skip_tls_verify: bool,
    pub log_buffer: usize,
    pub log_workers: usize,
    pub max_body_bytes: usize,
}

impl GlobalConfig {
    pub const DEFAULT_MAX_KEY_RETRIES: u32 = 3;
    pub const DEFAULT_MAX_CONCURRENCY: usize = 1000;
    pub const DEFAULT_LOG_BUFFER: usize = 4096;
    pub const DEFAULT_LOG_WORKERS: usize = 2;
    pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
}

/// Optional layer used for merging global config from CLI/env sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub admin_password: Option<String>,
    pub api_tokens: Option<Vec<String>>,
    pub max_key_retries: Option<u32>,
    pub max_concurrency: Option<usize>,
    pub upstream_first_byte_timeout_secs: Option<Option<u64>>,
    pub skip_tls_verify: Option<bool>,
    pub log_buffer: Option<usize>,
    pub log_workers: Option<usize>,
    pub max_body_bytes: Option<usize>,
}

impl GlobalConfigPatch {
    /// `other` wins wherever it sets a field.
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.admin_password.is_some() {
            self.admin_password = other.admin_password;
        }
        if other.api_tokens.is_some() {
            self.api_tokens = other.api_tokens;
        }
        if other.max_key_retries.is_some() {
            self.max_key_retries = other.max_key_retries;
        }
        if other.max_concurrency.is_some() {
            self.max_concurrency = other.max_concurrency;
        }
        if other.upstream_first_byte_timeout_secs.is_some() {
            self.upstream_first_byte_timeout_secs = other.upstream_first_byte_timeout_secs;
        }
        if other.skip_tls_verify.is_some() {
            self.skip_tls_verify = other.skip_tls_verify;
        }
        if other.log_buffer.is_some() {
            self.log_buffer = other.log_buffer;
        }
        if other.log_workers.is_some() {
            self.log_workers = other.log_workers;
        }
        if other.max_body_bytes.is_some() {
            self.max_body_bytes = other.max_body_bytes;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            admin_password: self
                .admin_password
                .ok_or(GlobalConfigError::MissingField("admin_password"))?,
            api_tokens: self.api_tokens.unwrap_or_default(),
            max_key_retries: self
                .max_key_retries
                .unwrap_or(GlobalConfig::DEFAULT_MAX_KEY_RETRIES),
            max_concurrency: self
                .max_concurrency
                .unwrap_or(GlobalConfig::DEFAULT_MAX_CONCURRENCY),
            upstream_first_byte_timeout_secs: self
                .upstream_first_byte_timeout_secs
                .unwrap_or(None),
            skip_tls_verify: self.skip_tls_verify.unwrap_or(false),
            log_buffer: self.log_buffer.unwrap_or(GlobalConfig::DEFAULT_LOG_BUFFER),
            log_workers: self.log_workers.unwrap_or(GlobalConfig::DEFAULT_LOG_WORKERS),
            max_body_bytes: self
                .max_body_bytes
                .unwrap_or(GlobalConfig::DEFAULT_MAX_BODY_BYTES),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            admin_password: Some(value.admin_password),
            api_tokens: Some(value.api_tokens),
            max_key_retries: Some(value.max_key_retries),
            max_concurrency: Some(value.max_concurrency),
            upstream_first_byte_timeout_secs: Some(value.upstream_first_byte_timeout_secs),
            skip_tls_verify: Some(value.skip_tls_verify),
            log_buffer: Some(value.log_buffer),
            log_workers: Some(value.log_workers),
            max_body_bytes: Some(value.max_body_bytes),
        }
    }
}

/// Channel type / vendor dialect a channel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Anthropic,
    Codex,
    OpenAi,
    Gemini,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Anthropic => "anthropic",
            ChannelType::Codex => "codex",
            ChannelType::OpenAi => "openai",
            ChannelType::Gemini => "gemini",
        }
    }
}

/// Key-selection strategy within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    Sequential,
    RoundRobin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_overlay_lets_later_values_win() {
        let mut base = GlobalConfigPatch {
            max_concurrency: Some(1000),
            ..Default::default()
        };
        base.overlay(GlobalConfigPatch {
            max_concurrency: Some(50),
            ..Default::default()
        });
        assert_eq!(base.max_concurrency, Some(50));
    }

    #[test]
    fn into_config_requires_admin_password() {
        let patch = GlobalConfigPatch::default();
        assert!(patch.into_config().is_err());
    }

    #[test]
    fn into_config_applies_defaults() {
        let patch = GlobalConfigPatch {
            admin_password: Some("secret".into()),
            ..Default::default()
        };
        let config = patch.into_config().unwrap();
        assert_eq!(config.max_key_retries, GlobalConfig::DEFAULT_MAX_KEY_RETRIES);
        assert_eq!(config.max_concurrency, GlobalConfig::DEFAULT_MAX_CONCURRENCY);
    }
}
