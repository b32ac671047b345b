//! Shared application state: every collaborator the handler needs, plus the
//! admin-mutation entry points that keep the `ArcSwap`-cached channel list
//! in sync with storage without forcing the data plane to hit storage on
//! every request.

use crate::active_requests::ActiveRequestTracker;
use crate::auth::{AuthProvider, StorageAuth};
use crate::channel_selector::{ChannelSelector, SelectorTuning};
use crate::cooldown::CooldownManager;
use crate::forwarder::{Forwarder, ForwarderConfig};
use crate::key_selector::KeySelector;
use crate::log_writer::AsyncLogWriter;
use crate::orchestrator::RetryOrchestrator;
use arc_swap::ArcSwap;
use ccload_common::GlobalConfig;
use ccload_storage::{Channel, Storage};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct AppState {
    pub config: ArcSwap<GlobalConfig>,
    pub storage: Arc<dyn Storage>,
    /// Cached copy of `storage.list_configs()`, refreshed on every admin
    /// mutation and shared with `orchestrator` so the dispatch path reads
    /// this instead of hitting storage for "which channels serve this
    /// model" on every request.
    pub channel_cache: Arc<ArcSwap<Vec<Channel>>>,
    pub channel_selector: Arc<ChannelSelector>,
    pub key_selector: Arc<KeySelector>,
    pub cooldown: Arc<CooldownManager>,
    pub forwarder: Arc<Forwarder>,
    pub orchestrator: Arc<RetryOrchestrator>,
    pub log_writer: Arc<AsyncLogWriter>,
    pub active_requests: Arc<ActiveRequestTracker>,
    pub admission: Arc<Semaphore>,
    pub auth: Arc<dyn AuthProvider>,
}

impl AppState {
    pub async fn bootstrap(config: GlobalConfig, storage: Arc<dyn Storage>) -> anyhow::Result<Self> {
        let channels = storage.list_configs().await?;
        let channel_cache = Arc::new(ArcSwap::from_pointee(channels));

        let channel_selector = Arc::new(ChannelSelector::new(SelectorTuning::default()));
        let key_selector = Arc::new(KeySelector::new());
        let cooldown = Arc::new(CooldownManager::new(storage.clone()));
        let forwarder = Arc::new(Forwarder::new(ForwarderConfig {
            first_byte_timeout: config.upstream_first_byte_timeout_secs.map(std::time::Duration::from_secs),
            skip_tls_verify: config.skip_tls_verify,
            ..ForwarderConfig::default()
        })?);
        let orchestrator = Arc::new(RetryOrchestrator::new(
            storage.clone(),
            channel_cache.clone(),
            channel_selector.clone(),
            key_selector.clone(),
            cooldown.clone(),
            forwarder.clone(),
            config.max_key_retries,
        ));
        let log_writer = Arc::new(AsyncLogWriter::spawn(storage.clone(), config.log_buffer, config.log_workers));
        let admission = Arc::new(Semaphore::new(config.max_concurrency));
        let auth: Arc<dyn AuthProvider> = Arc::new(StorageAuth::new(storage.clone(), config.api_tokens.clone()));

        Ok(Self {
            config: ArcSwap::from_pointee(config),
            storage,
            channel_cache,
            channel_selector,
            key_selector,
            cooldown,
            forwarder,
            orchestrator,
            log_writer,
            active_requests: Arc::new(ActiveRequestTracker::new()),
            admission,
            auth,
        })
    }

    /// Re-reads the full channel list from storage. Call after any admin
    /// mutation (channel upsert/delete, key add/remove); the data plane
    /// never observes a stale entry for longer than this round trip.
    pub async fn refresh_channel_cache(&self) -> anyhow::Result<()> {
        let channels = self.storage.list_configs().await?;
        self.channel_cache.store(Arc::new(channels));
        Ok(())
    }

    pub fn apply_config_patch(&self, patch: ccload_common::GlobalConfigPatch) -> Result<GlobalConfig, ccload_common::GlobalConfigError> {
        let current = self.config.load().as_ref().clone();
        let mut merged = ccload_common::GlobalConfigPatch::from(current);
        merged.overlay(patch);
        let next = merged.into_config()?;
        self.config.store(Arc::new(next.clone()));
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccload_storage::InMemoryStorage;

    fn config() -> GlobalConfig {
        GlobalConfig {
            admin_password: "secret".into(),
            api_tokens: vec![],
            max_key_retries: 3,
            max_concurrency: 10,
            upstream_first_byte_timeout_secs: None,
            skip_tls_verify: false,
            log_buffer: 16,
            log_workers: 1,
            max_body_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn bootstrap_populates_channel_cache_from_storage() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let state = AppState::bootstrap(config(), storage).await.unwrap();
        assert!(state.channel_cache.load().is_empty());
    }

    #[tokio::test]
    async fn apply_config_patch_overlays_onto_current_config() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let state = AppState::bootstrap(config(), storage).await.unwrap();
        let patch = ccload_common::GlobalConfigPatch {
            max_concurrency: Some(50),
            ..Default::default()
        };
        let updated = state.apply_config_patch(patch).unwrap();
        assert_eq!(updated.max_concurrency, 50);
        assert_eq!(state.config.load().max_concurrency, 50);
    }
}
