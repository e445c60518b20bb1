//! 令牌缓存镜像：按 key 缓存令牌行，并承接额度增量。
//!
//! 主库始终是事实来源；缓存只用于热路径上的读取。当缓存被配置为
//! 状态权威时，令牌校验不会在本地写回 Expired/Exhausted 状态。

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mini_moka::sync::Cache;

use crate::error::StoreError;
use crate::token::Token;

#[async_trait]
pub trait TokenCache: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Token>, StoreError>;
    async fn set(&self, token: &Token) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// `delta > 0` 表示返还额度，`delta < 0` 表示扣减。
    async fn incr_quota(&self, key: &str, delta: i64) -> Result<(), StoreError>;
}

/// 进程内实现，用 mini-moka 做带 TTL 的有界缓存。
pub struct MemoryTokenCache {
    entries: Cache<String, Token>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for MemoryTokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTokenCache")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl MemoryTokenCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl TokenCache for MemoryTokenCache {
    async fn get(&self, key: &str) -> Result<Option<Token>, StoreError> {
        Ok(self.entries.get(&key.to_owned()))
    }

    async fn set(&self, token: &Token) -> Result<(), StoreError> {
        if token.key.is_empty() {
            return Err(StoreError::Cache("refusing to cache a token without key".into()));
        }
        self.entries.insert(token.key.clone(), token.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.invalidate(&key.to_owned());
        Ok(())
    }

    async fn incr_quota(&self, key: &str, delta: i64) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Cache("cache lock poisoned".into()))?;
        let key = key.to_owned();
        // 未命中时无需处理，下一次读取会从主库回填。
        if let Some(mut token) = self.entries.get(&key) {
            // 与主库的相对更新一致：受限令牌余额最低为 0。
            let remain = token.remain_quota.saturating_add(delta);
            token.remain_quota = if token.unlimited_quota { remain } else { remain.max(0) };
            token.used_quota = token.used_quota.saturating_sub(delta);
            self.entries.insert(key, token);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Token {
        Token {
            id: 7,
            key: "abc123".into(),
            remain_quota: 100,
            ..Token::default()
        }
    }

    #[tokio::test]
    async fn incr_quota_moves_remain_and_used() {
        let cache = MemoryTokenCache::new(16, Duration::from_secs(60));
        cache.set(&sample()).await.unwrap();
        cache.incr_quota("abc123", -30).await.unwrap();
        let token = cache.get("abc123").await.unwrap().unwrap();
        assert_eq!(token.remain_quota, 70);
        assert_eq!(token.used_quota, 30);
    }

    #[tokio::test]
    async fn overspend_clamps_limited_remain_at_zero() {
        let cache = MemoryTokenCache::new(16, Duration::from_secs(60));
        cache
            .set(&Token {
                remain_quota: 10,
                ..sample()
            })
            .await
            .unwrap();
        cache.incr_quota("abc123", -50).await.unwrap();
        let token = cache.get("abc123").await.unwrap().unwrap();
        assert_eq!(token.remain_quota, 0);
        assert_eq!(token.used_quota, 50);
    }

    #[tokio::test]
    async fn unlimited_remain_may_go_negative() {
        let cache = MemoryTokenCache::new(16, Duration::from_secs(60));
        cache
            .set(&Token {
                remain_quota: 10,
                unlimited_quota: true,
                ..sample()
            })
            .await
            .unwrap();
        cache.incr_quota("abc123", -50).await.unwrap();
        let token = cache.get("abc123").await.unwrap().unwrap();
        assert_eq!(token.remain_quota, -40);
    }

    #[tokio::test]
    async fn delete_evicts_entry() {
        let cache = MemoryTokenCache::new(16, Duration::from_secs(60));
        cache.set(&sample()).await.unwrap();
        cache.delete("abc123").await.unwrap();
        assert!(cache.get("abc123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn incr_on_missing_key_is_noop() {
        let cache = MemoryTokenCache::new(16, Duration::from_secs(60));
        cache.incr_quota("missing", 10).await.unwrap();
        assert!(cache.get("missing").await.unwrap().is_none());
    }
}
