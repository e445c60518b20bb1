//! 延迟批量写：开启后额度增量先在内存中按 (类型, id) 聚合，定期合并写入主库。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;

use crate::error::StoreError;
use crate::store::{
    apply_channel_used_delta, apply_token_delta, apply_user_quota_delta, apply_user_used_delta,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    TokenQuota,
    UserQuota,
    UserUsedQuota,
    UserRequestCount,
    ChannelUsedQuota,
}

#[derive(Debug)]
pub struct QuotaBatcher {
    pool: SqlitePool,
    pending: Mutex<HashMap<(BatchKind, i64), i64>>,
}

impl QuotaBatcher {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, kind: BatchKind, id: i64, delta: i64) {
        if delta == 0 {
            return;
        }
        match self.pending.lock() {
            Ok(mut pending) => *pending.entry((kind, id)).or_insert(0) += delta,
            Err(_) => tracing::error!(?kind, id, delta, "batch buffer poisoned, dropping delta"),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    /// 把当前缓冲的增量全部写入主库，返回写入的条目数。
    /// 写失败的条目放回缓冲，等待下一轮。
    pub async fn flush(&self) -> Result<usize, StoreError> {
        let drained: Vec<((BatchKind, i64), i64)> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(_) => return Err(StoreError::Invalid("batch buffer poisoned".into())),
        };

        let mut written = 0;
        let mut first_error = None;
        for ((kind, id), delta) in drained {
            let result = match kind {
                BatchKind::TokenQuota => apply_token_delta(&self.pool, id, delta).await,
                BatchKind::UserQuota => apply_user_quota_delta(&self.pool, id, delta).await,
                BatchKind::UserUsedQuota => apply_user_used_delta(&self.pool, id, delta, 0).await,
                BatchKind::UserRequestCount => {
                    apply_user_used_delta(&self.pool, id, 0, delta).await
                }
                BatchKind::ChannelUsedQuota => {
                    apply_channel_used_delta(&self.pool, id, delta).await
                }
            };
            match result {
                Ok(()) => written += 1,
                Err(err) => {
                    tracing::error!(?kind, id, delta, error = %err, "batch update failed");
                    self.add(kind, id, delta);
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }

    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match batcher.flush().await {
                    Ok(0) => {}
                    Ok(written) => tracing::debug!(written, "flushed batched quota updates"),
                    Err(err) => tracing::warn!(error = %err, "batched quota flush incomplete"),
                }
            }
        })
    }
}
