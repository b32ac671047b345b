use ccload_common::GlobalConfigPatch;
use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "ccload", version, about = "Multi-upstream LLM API reverse proxy")]
pub struct CliArgs {
    /// Bind address, e.g. 0.0.0.0:8080.
    #[arg(long, env = "CCLOAD_BIND", default_value = "0.0.0.0:8080")]
    pub bind: String,

    /// Admin password; required, compared against incoming admin logins.
    #[arg(long, env = "CCLOAD_PASS")]
    pub admin_password: Option<String>,

    /// Comma-separated static API tokens accepted on inbound requests.
    #[arg(long, env = "CCLOAD_AUTH")]
    pub api_tokens: Option<String>,

    #[arg(long, env = "CCLOAD_MAX_KEY_RETRIES")]
    pub max_key_retries: Option<u32>,

    #[arg(long, env = "CCLOAD_MAX_CONCURRENCY")]
    pub max_concurrency: Option<usize>,

    #[arg(long, env = "CCLOAD_UPSTREAM_FIRST_BYTE_TIMEOUT_SECS")]
    pub upstream_first_byte_timeout_secs: Option<u64>,

    #[arg(long, env = "CCLOAD_SKIP_TLS_VERIFY")]
    pub skip_tls_verify: Option<bool>,

    #[arg(long, env = "CCLOAD_LOG_BUFFER")]
    pub log_buffer: Option<usize>,

    #[arg(long, env = "CCLOAD_LOG_WORKERS")]
    pub log_workers: Option<usize>,

    #[arg(long, env = "CCLOAD_MAX_BODY_BYTES")]
    pub max_body_bytes: Option<usize>,
}

impl CliArgs {
    pub fn into_patch(self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            admin_password: self.admin_password,
            api_tokens: self
                .api_tokens
                .map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()),
            max_key_retries: self.max_key_retries,
            max_concurrency: self.max_concurrency,
            upstream_first_byte_timeout_secs: self.upstream_first_byte_timeout_secs.map(Some),
            skip_tls_verify: self.skip_tls_verify,
            log_buffer: self.log_buffer,
            log_workers: self.log_workers,
            max_body_bytes: self.max_body_bytes,
        }
    }
}
