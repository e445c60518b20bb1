//! OpenAI 兼容的中继网关与额度计量引擎。

pub mod adapter;
pub mod batch;
pub mod billing;
pub mod cache;
pub mod config;
pub mod error;
pub mod moderation;
pub mod relay;
pub mod request;
pub mod scheduler;
pub mod sensitive;
pub mod store;
pub mod tasks;
pub mod token;

#[cfg(test)]
mod testing;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::task::JoinHandle;

pub use config::GatewayConfig;
pub use error::{ErrorCode, GatewayError, RelayError, StoreError, TokenError};
pub use relay::{Relay, RelayResponse};
pub use request::RelayMode;
pub use store::TokenStore;
pub use token::Token;

use batch::QuotaBatcher;
use cache::{MemoryTokenCache, TokenCache};
use store::StoreOptions;
use tasks::BackgroundTasks;

/// 网关装配：存储、缓存镜像、批量写、后台任务池与中继流水线。
#[derive(Clone, Debug)]
pub struct RelayGateway {
    config: Arc<GatewayConfig>,
    store: TokenStore,
    relay: Relay,
    batcher: Option<Arc<QuotaBatcher>>,
}

impl RelayGateway {
    pub async fn new(
        config: GatewayConfig,
        database_path: impl AsRef<Path>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let config = Arc::new(config);
        let tasks = BackgroundTasks::start(config.tasks.workers, config.tasks.queue_capacity);

        let pool = store::open_pool(database_path.as_ref()).await?;
        let batcher = config
            .batch
            .enabled
            .then(|| Arc::new(QuotaBatcher::new(pool.clone())));
        let cache = config.cache.enabled.then(|| {
            Arc::new(MemoryTokenCache::new(
                config.cache.capacity,
                Duration::from_secs(config.cache.ttl_secs),
            )) as Arc<dyn TokenCache>
        });
        let options = StoreOptions {
            cache,
            authority: config.cache.authority,
            batcher: batcher.clone(),
        };
        let store = TokenStore::from_pool(pool, tasks, options).await?;

        let client = Client::builder().build()?;
        let relay = Relay::new(Arc::clone(&config), store.clone(), client);
        Ok(Self {
            config,
            store,
            relay,
            batcher,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// 校验客户端提交的 `sk-` 密钥。
    pub async fn authenticate(&self, key: &str) -> Result<Token, TokenError> {
        self.store.validate_user_token(key).await
    }

    /// 启动周期任务：间隔卡刷新与批量写刷新。
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![scheduler::spawn_refresh_loop(
            self.store.clone(),
            Duration::from_secs(self.config.refresh_interval_secs),
        )];
        if let Some(batcher) = self.batcher.as_ref() {
            handles.push(batcher.spawn_flusher(Duration::from_secs(self.config.batch.interval_secs)));
        }
        handles
    }

    /// 落盘所有待写数据：等待后台任务，再刷新批量写缓冲。
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.store.tasks().wait_idle().await;
        if let Some(batcher) = self.batcher.as_ref() {
            let flushed = batcher.flush().await?;
            tracing::info!(flushed, "flushed pending quota updates");
        }
        let dead = self.store.tasks().dead_letters();
        if !dead.is_empty() {
            tracing::warn!(count = dead.len(), "background tasks ended in the dead-letter log");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewToken;

    #[tokio::test]
    async fn gateway_wires_cache_and_batcher() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::default();
        config.cache.enabled = true;
        config.batch.enabled = true;
        let gateway = RelayGateway::new(config, dir.path().join("gateway.db"))
            .await
            .unwrap();

        gateway.store().grant_user_quota(3, 100).await.unwrap();
        let token = gateway
            .store()
            .issue_token(3, NewToken { remain_quota: 50, ..NewToken::default() })
            .await
            .unwrap();
        let validated = gateway.authenticate(&format!("sk-{}", token.key)).await.unwrap();
        assert_eq!(validated.id, token.id);

        gateway
            .store()
            .decrease_token_quota(token.id, &token.key, 20)
            .await
            .unwrap();
        // 批量模式下，落盘前主库不变。
        assert_eq!(gateway.store().get_token_by_id(token.id).await.unwrap().remain_quota, 50);
        gateway.shutdown().await.unwrap();
        assert_eq!(gateway.store().get_token_by_id(token.id).await.unwrap().remain_quota, 30);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::default();
        config.pricing.quota_per_unit = 0.0;
        let err = RelayGateway::new(config, dir.path().join("gateway.db"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
