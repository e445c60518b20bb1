use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;

use crate::batch::{BatchKind, QuotaBatcher};
use crate::cache::TokenCache;
use crate::error::{StoreError, TokenError};
use crate::tasks::BackgroundTasks;
use crate::token::{IntervalUnit, Token, TokenStatus, mask_key, refresh_due};

const TOKEN_COLUMNS: &str = r#"
    id, user_id, key, status, name, created_time, accessed_time, expired_time,
    remain_quota, unlimited_quota, model_limits_enabled, model_limits, allow_ips,
    used_quota, "group", interval_quota, interval_time, trigger_last_time,
    interval_unit, deleted_at
"#;

/// 热路径上 Expired/Exhausted 状态由谁负责写回。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusAuthority {
    #[default]
    LocalStore,
    ExternalCache,
}

/// 预扣费失败的原因。
#[derive(Debug, Error)]
pub enum ReserveError {
    #[error("token quota is not enough, token remain quota: {remain}, need quota: {need}")]
    TokenQuota { remain: i64, need: i64 },
    #[error("user quota is not enough")]
    UserQuota,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 余额查询能力，“可信令牌”判断通过它读取与缓存一致的额度。
#[async_trait]
pub trait QuotaLookup: Send + Sync {
    async fn user_quota(&self, user_id: i64) -> Result<i64, StoreError>;
    async fn token_quota(&self, token: &Token) -> Result<i64, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserBalance {
    pub id: i64,
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
}

/// 每次结算写入一条的消费日志。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumeLog {
    pub id: i64,
    pub user_id: i64,
    pub created_at: i64,
    pub channel_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub model_name: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub content: String,
    pub use_time_seconds: i64,
    pub is_stream: bool,
    pub group: String,
    pub other: serde_json::Map<String, serde_json::Value>,
}

/// 新建令牌时可由调用方指定的字段。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewToken {
    pub name: String,
    pub expired_time: Option<i64>,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub model_limits_enabled: bool,
    pub model_limits: String,
    pub allow_ips: Option<String>,
    pub group: String,
    pub interval_quota: i64,
    pub interval_time: i64,
    pub interval_unit: Option<IntervalUnit>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub cache: Option<Arc<dyn TokenCache>>,
    pub authority: StatusAuthority,
    pub batcher: Option<Arc<QuotaBatcher>>,
}

/// 令牌、用户余额、渠道用量与消费日志的 SQLite 存储。
#[derive(Debug, Clone)]
pub struct TokenStore {
    pool: SqlitePool,
    cache: Option<Arc<dyn TokenCache>>,
    authority: StatusAuthority,
    batcher: Option<Arc<QuotaBatcher>>,
    tasks: BackgroundTasks,
}

impl TokenStore {
    pub async fn connect(
        database_path: impl AsRef<Path>,
        tasks: BackgroundTasks,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let pool = open_pool(database_path.as_ref()).await?;
        Self::from_pool(pool, tasks, options).await
    }

    pub async fn from_pool(
        pool: SqlitePool,
        tasks: BackgroundTasks,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            cache: options.cache,
            authority: options.authority,
            batcher: options.batcher,
            tasks,
        };
        store.initialize_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    async fn initialize_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                key TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 1,
                name TEXT NOT NULL DEFAULT '',
                created_time INTEGER NOT NULL DEFAULT 0,
                accessed_time INTEGER NOT NULL DEFAULT 0,
                expired_time INTEGER NOT NULL DEFAULT -1,
                remain_quota INTEGER NOT NULL DEFAULT 0,
                unlimited_quota INTEGER NOT NULL DEFAULT 0,
                model_limits_enabled INTEGER NOT NULL DEFAULT 0,
                model_limits TEXT NOT NULL DEFAULT '',
                allow_ips TEXT,
                used_quota INTEGER NOT NULL DEFAULT 0,
                "group" TEXT NOT NULL DEFAULT '',
                interval_quota INTEGER NOT NULL DEFAULT 0,
                interval_time INTEGER NOT NULL DEFAULT 0,
                trigger_last_time INTEGER NOT NULL DEFAULT 0,
                interval_unit INTEGER,
                deleted_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // key 只需在未删除的令牌中唯一。
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_tokens_key ON tokens(key) WHERE deleted_at IS NULL",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tokens_user ON tokens(user_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                quota INTEGER NOT NULL DEFAULT 0,
                used_quota INTEGER NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channels (
                id INTEGER PRIMARY KEY,
                used_quota INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS consume_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                channel_id INTEGER NOT NULL,
                token_id INTEGER NOT NULL,
                token_name TEXT NOT NULL DEFAULT '',
                model_name TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                quota INTEGER NOT NULL DEFAULT 0,
                content TEXT NOT NULL DEFAULT '',
                use_time_seconds INTEGER NOT NULL DEFAULT 0,
                is_stream INTEGER NOT NULL DEFAULT 0,
                "group" TEXT NOT NULL DEFAULT '',
                other TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- token lookups ----

    /// 按 key 查询：先查缓存，未命中回落主库，并异步回填缓存。
    pub async fn get_token_by_key(
        &self,
        key: &str,
        from_db: bool,
    ) -> Result<Option<Token>, StoreError> {
        if !from_db && let Some(cache) = self.cache.as_ref() {
            match cache.get(key).await {
                Ok(Some(token)) => return Ok(Some(token)),
                Ok(None) => {}
                Err(err) => tracing::warn!(error = %err, "token cache read failed, falling back"),
            }
        }

        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE key = ? AND deleted_at IS NULL LIMIT 1"
        );
        let token = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| token_from_row(&row))
            .transpose()?;

        if let Some(token) = token.as_ref() {
            self.mirror_set(token.clone());
        }
        Ok(token)
    }

    pub async fn get_token_by_id(&self, id: i64) -> Result<Token, StoreError> {
        if id == 0 {
            return Err(StoreError::Invalid("id is empty".into()));
        }
        let sql = format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = ? AND deleted_at IS NULL");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok(token_from_row(&row)?)
    }

    pub async fn get_token_by_ids(&self, id: i64, user_id: i64) -> Result<Token, StoreError> {
        if id == 0 || user_id == 0 {
            return Err(StoreError::Invalid("id or user id is empty".into()));
        }
        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = ? AND user_id = ? AND deleted_at IS NULL"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok(token_from_row(&row)?)
    }

    pub async fn list_user_tokens(
        &self,
        user_id: i64,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Token>, StoreError> {
        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE user_id = ? AND deleted_at IS NULL ORDER BY id DESC LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(limit.clamp(1, 500))
            .bind(offset.max(0))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(token_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    pub async fn count_user_tokens(&self, user_id: i64) -> Result<i64, StoreError> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM tokens WHERE user_id = ? AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    // ---- token writes ----

    pub async fn insert_token(&self, token: &mut Token) -> Result<(), StoreError> {
        let id = sqlx::query(
            r#"
            INSERT INTO tokens (
                user_id, key, status, name, created_time, accessed_time, expired_time,
                remain_quota, unlimited_quota, model_limits_enabled, model_limits, allow_ips,
                used_quota, "group", interval_quota, interval_time, trigger_last_time, interval_unit
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(token.user_id)
        .bind(&token.key)
        .bind(token.status.code())
        .bind(&token.name)
        .bind(token.created_time)
        .bind(token.accessed_time)
        .bind(token.expired_time)
        .bind(token.remain_quota)
        .bind(token.unlimited_quota)
        .bind(token.model_limits_enabled)
        .bind(&token.model_limits)
        .bind(token.allow_ips.as_deref())
        .bind(token.used_quota)
        .bind(&token.group)
        .bind(token.interval_quota)
        .bind(token.interval_time)
        .bind(token.trigger_last_time)
        .bind(token.interval_unit.map(IntervalUnit::code))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        token.id = id;
        Ok(())
    }

    /// 签发新令牌：生成密钥，用量清零。
    pub async fn issue_token(&self, user_id: i64, spec: NewToken) -> Result<Token, StoreError> {
        if user_id == 0 {
            return Err(StoreError::Invalid("user id is empty".into()));
        }
        if spec.name.chars().count() > 30 {
            return Err(StoreError::Invalid("token name is too long".into()));
        }
        let now = Utc::now().timestamp();
        let mut token = Token {
            user_id,
            key: crate::token::generate_key(),
            name: spec.name,
            created_time: now,
            accessed_time: now,
            expired_time: spec.expired_time.unwrap_or(crate::token::NEVER_EXPIRES),
            remain_quota: spec.remain_quota,
            unlimited_quota: spec.unlimited_quota,
            model_limits_enabled: spec.model_limits_enabled,
            model_limits: spec.model_limits,
            allow_ips: spec.allow_ips,
            group: spec.group,
            interval_quota: spec.interval_quota,
            interval_time: spec.interval_time,
            interval_unit: spec.interval_unit,
            ..Token::default()
        };
        self.insert_token(&mut token).await?;
        tracing::info!(user_id, token_id = token.id, key = %token.masked_key(), "issued token");
        Ok(token)
    }

    /// 批量签发；数量大于 1 时名称追加随机后缀以保证唯一。
    pub async fn issue_tokens(
        &self,
        user_id: i64,
        spec: NewToken,
        count: usize,
    ) -> Result<Vec<Token>, StoreError> {
        let count = count.max(1);
        let mut issued = Vec::with_capacity(count);
        for _ in 0..count {
            let mut item = spec.clone();
            if count > 1 {
                let suffix = nanoid::nanoid!(8);
                let base: String = spec.name.chars().take(21).collect();
                item.name = format!("{base}-{suffix}");
            }
            issued.push(self.issue_token(user_id, item).await?);
        }
        Ok(issued)
    }

    /// 窄更新：只写计费与限制字段，不碰 accessed_time / used_quota。
    pub async fn update_token(&self, token: &Token) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE tokens
            SET name = ?, status = ?, expired_time = ?, remain_quota = ?, unlimited_quota = ?,
                model_limits_enabled = ?, model_limits = ?, allow_ips = ?, "group" = ?,
                interval_quota = ?, interval_time = ?, trigger_last_time = ?, interval_unit = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(&token.name)
        .bind(token.status.code())
        .bind(token.expired_time)
        .bind(token.remain_quota)
        .bind(token.unlimited_quota)
        .bind(token.model_limits_enabled)
        .bind(&token.model_limits)
        .bind(token.allow_ips.as_deref())
        .bind(&token.group)
        .bind(token.interval_quota)
        .bind(token.interval_time)
        .bind(token.trigger_last_time)
        .bind(token.interval_unit.map(IntervalUnit::code))
        .bind(token.id)
        .execute(&self.pool)
        .await?;
        self.mirror_set(token.clone());
        Ok(())
    }

    /// 全量写状态与访问时间，可以写入零值。
    pub async fn select_update_token(&self, token: &Token) -> Result<(), StoreError> {
        sqlx::query("UPDATE tokens SET accessed_time = ?, status = ? WHERE id = ?")
            .bind(token.accessed_time)
            .bind(token.status.code())
            .bind(token.id)
            .execute(&self.pool)
            .await?;
        self.mirror_set(token.clone());
        Ok(())
    }

    /// 管理端修改令牌。重新启用时拒绝仍处于过期或耗尽条件的令牌。
    pub async fn apply_token_edit(
        &self,
        user_id: i64,
        id: i64,
        edit: NewToken,
        status: Option<TokenStatus>,
        status_only: bool,
    ) -> Result<Token, StoreError> {
        if edit.name.chars().count() > 30 {
            return Err(StoreError::Invalid("token name is too long".into()));
        }
        let mut token = self.get_token_by_ids(id, user_id).await?;
        let now = Utc::now().timestamp();
        if status == Some(TokenStatus::Enabled) {
            if token.status == TokenStatus::Expired && token.is_expired_at(now + 1) {
                return Err(StoreError::Invalid(
                    "token has expired; extend the expiry or make it never expire first".into(),
                ));
            }
            if token.status == TokenStatus::Exhausted && token.is_quota_exhausted() {
                return Err(StoreError::Invalid(
                    "token quota is exhausted; raise the quota or make it unlimited first".into(),
                ));
            }
        }
        if let Some(status) = status {
            token.status = status;
        }
        if !status_only {
            token.name = edit.name;
            token.expired_time = edit.expired_time.unwrap_or(token.expired_time);
            token.remain_quota = edit.remain_quota;
            token.unlimited_quota = edit.unlimited_quota;
            token.model_limits_enabled = edit.model_limits_enabled;
            token.model_limits = edit.model_limits;
            token.allow_ips = edit.allow_ips;
            token.group = edit.group;
            token.interval_quota = edit.interval_quota;
            token.interval_time = edit.interval_time;
            token.interval_unit = edit.interval_unit;
        }
        self.update_token(&token).await?;
        Ok(token)
    }

    /// 软删除，并异步淘汰缓存。
    pub async fn delete_token(&self, token: &Token) -> Result<(), StoreError> {
        sqlx::query("UPDATE tokens SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(Utc::now().timestamp())
            .bind(token.id)
            .execute(&self.pool)
            .await?;
        self.mirror_delete(token.key.clone());
        Ok(())
    }

    pub async fn delete_token_by_id(&self, id: i64, user_id: i64) -> Result<(), StoreError> {
        let token = self.get_token_by_ids(id, user_id).await?;
        self.delete_token(&token).await
    }

    /// 删除某用户名下的一组令牌，返回实际删除数量。
    pub async fn batch_delete_tokens(&self, ids: &[i64], user_id: i64) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Err(StoreError::Invalid("ids must not be empty".into()));
        }
        let mut tx = self.pool.begin().await?;

        let mut select = QueryBuilder::<Sqlite>::new(
            "SELECT key FROM tokens WHERE deleted_at IS NULL AND user_id = ",
        );
        select.push_bind(user_id).push(" AND id IN (");
        {
            let mut separated = select.separated(", ");
            for id in ids {
                separated.push_bind(*id);
            }
        }
        select.push(")");
        let keys: Vec<String> = select
            .build_query_scalar::<String>()
            .fetch_all(&mut *tx)
            .await?;

        let mut update = QueryBuilder::<Sqlite>::new("UPDATE tokens SET deleted_at = ");
        update
            .push_bind(Utc::now().timestamp())
            .push(" WHERE deleted_at IS NULL AND user_id = ")
            .push_bind(user_id)
            .push(" AND id IN (");
        {
            let mut separated = update.separated(", ");
            for id in ids {
                separated.push_bind(*id);
            }
        }
        update.push(")");
        update.build().execute(&mut *tx).await?;

        tx.commit().await?;

        for key in &keys {
            self.mirror_delete(key.clone());
        }
        Ok(keys.len())
    }

    // ---- validation ----

    fn writes_local_status(&self) -> bool {
        !(self.cache.is_some() && self.authority == StatusAuthority::ExternalCache)
    }

    /// 校验令牌；首次使用的间隔卡在此激活。
    pub async fn validate_user_token(&self, key: &str) -> Result<Token, TokenError> {
        let key = key.trim();
        let key = key.strip_prefix("sk-").unwrap_or(key);
        if key.is_empty() {
            return Err(TokenError::NotFound);
        }
        let mut token = match self.get_token_by_key(key, false).await {
            Ok(Some(token)) => token,
            Ok(None) => return Err(TokenError::NotFound),
            Err(err) => {
                tracing::warn!(error = %err, "token lookup failed");
                return Err(TokenError::NotFound);
            }
        };

        let now = Utc::now().timestamp();
        if token.needs_activation() {
            // 缓存可能落后于主库，激活前以主库为准。
            if self.cache.is_some() {
                token = match self.get_token_by_key(key, true).await {
                    Ok(Some(fresh)) => fresh,
                    Ok(None) => return Err(TokenError::NotFound),
                    Err(err) => return Err(TokenError::ActivationFailed(err)),
                };
            }
            if token.activate(now) {
                if let Err(err) = self.update_token(&token).await {
                    tracing::error!(error = %err, "failed to persist token activation");
                    return Err(TokenError::ActivationFailed(err));
                }
                let kind = token.interval_unit.map(IntervalUnit::label).unwrap_or("card");
                tracing::info!(
                    key = %token.masked_key(),
                    expired_time = token.expired_time,
                    interval = token.interval_time.max(1),
                    kind,
                    "activated token"
                );
            }
        }

        match token.status {
            TokenStatus::Enabled => {}
            TokenStatus::Exhausted => {
                return Err(TokenError::Exhausted {
                    masked: mask_key(key),
                    remain_quota: token.remain_quota,
                });
            }
            TokenStatus::Expired => return Err(TokenError::Expired),
            other => return Err(TokenError::Unavailable { status: other.code() }),
        }

        match token.derived_status(now) {
            TokenStatus::Expired => {
                self.persist_derived_status(&mut token, TokenStatus::Expired, now)
                    .await;
                return Err(TokenError::Expired);
            }
            TokenStatus::Exhausted => {
                self.persist_derived_status(&mut token, TokenStatus::Exhausted, now)
                    .await;
                return Err(TokenError::Exhausted {
                    masked: mask_key(key),
                    remain_quota: token.remain_quota,
                });
            }
            _ => {}
        }
        Ok(token)
    }

    /// 尽力写回推导出的状态；失败只记日志。缓存为权威时跳过。
    async fn persist_derived_status(&self, token: &mut Token, status: TokenStatus, now: i64) {
        if !self.writes_local_status() {
            return;
        }
        token.status = status;
        token.accessed_time = now;
        if let Err(err) = self.select_update_token(token).await {
            tracing::error!(error = %err, token_id = token.id, "failed to update token status");
        }
    }

    // ---- interval refresh ----

    /// 查询此刻需要刷新额度的间隔卡。
    pub async fn find_tokens_to_execute_now(&self, now: i64) -> Result<Vec<Token>, StoreError> {
        let sql = format!(
            r#"
            SELECT {TOKEN_COLUMNS} FROM tokens
            WHERE deleted_at IS NULL
              AND status = ?
              AND expired_time != -1
              AND expired_time > ?
              AND interval_time > 0
              AND interval_unit IS NOT NULL
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(TokenStatus::Enabled.code())
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

        let mut due = Vec::new();
        for row in rows {
            let token = token_from_row(&row)?;
            if let Some(unit) = token.interval_unit
                && refresh_due(unit, token.interval_time, token.trigger_last_time, now)
            {
                due.push(token);
            }
        }
        Ok(due)
    }

    pub async fn refresh_token_quota(&self, token: &mut Token, now: i64) -> Result<(), StoreError> {
        token.remain_quota = token.interval_quota;
        token.trigger_last_time = now;
        self.update_token(token).await
    }

    // ---- quota primitives ----

    pub async fn increase_token_quota(&self, id: i64, key: &str, quota: i64) -> Result<(), StoreError> {
        if quota < 0 {
            return Err(StoreError::Invalid("quota must not be negative".into()));
        }
        self.adjust_token_quota(id, key, quota).await
    }

    pub async fn decrease_token_quota(&self, id: i64, key: &str, quota: i64) -> Result<(), StoreError> {
        if quota < 0 {
            return Err(StoreError::Invalid("quota must not be negative".into()));
        }
        self.adjust_token_quota(id, key, -quota).await
    }

    async fn adjust_token_quota(&self, id: i64, key: &str, delta: i64) -> Result<(), StoreError> {
        if let Some(batcher) = self.batcher.as_ref() {
            self.mirror_incr(key.to_owned(), delta);
            batcher.add(BatchKind::TokenQuota, id, delta);
            return Ok(());
        }
        apply_token_delta(&self.pool, id, delta).await?;
        self.mirror_incr(key.to_owned(), delta);
        Ok(())
    }

    /// 预扣费：在同一事务中有条件地扣减令牌与用户额度。
    pub async fn reserve_quota(&self, token: &Token, amount: i64) -> Result<(), ReserveError> {
        if amount <= 0 {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        let affected = sqlx::query(
            r#"
            UPDATE tokens
            SET remain_quota = remain_quota - ?, used_quota = used_quota + ?, accessed_time = ?
            WHERE id = ? AND (unlimited_quota = 1 OR remain_quota >= ?)
            "#,
        )
        .bind(amount)
        .bind(amount)
        .bind(now)
        .bind(token.id)
        .bind(amount)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?
        .rows_affected();
        if affected == 0 {
            let remain = sqlx::query_scalar::<_, i64>("SELECT remain_quota FROM tokens WHERE id = ?")
                .bind(token.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::from)?
                .unwrap_or(0);
            return Err(ReserveError::TokenQuota { remain, need: amount });
        }

        let affected = sqlx::query("UPDATE users SET quota = quota - ? WHERE id = ? AND quota >= ?")
            .bind(amount)
            .bind(token.user_id)
            .bind(amount)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?
            .rows_affected();
        if affected == 0 {
            return Err(ReserveError::UserQuota);
        }

        tx.commit().await.map_err(StoreError::from)?;
        self.mirror_incr(token.key.clone(), -amount);
        Ok(())
    }

    /// 结算差额：令牌与用户余额在同一事务里调整，任一失败则两者都不变。
    /// `delta > 0` 返还，`delta < 0` 补扣。
    pub async fn apply_settlement_delta(
        &self,
        token_id: i64,
        key: &str,
        user_id: i64,
        delta: i64,
    ) -> Result<(), StoreError> {
        if delta == 0 {
            return Ok(());
        }
        if let Some(batcher) = self.batcher.as_ref() {
            self.mirror_incr(key.to_owned(), delta);
            batcher.add(BatchKind::TokenQuota, token_id, delta);
            batcher.add(BatchKind::UserQuota, user_id, delta);
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        apply_token_delta(&mut *tx, token_id, delta).await?;
        let affected = sqlx::query("UPDATE users SET quota = quota + ? WHERE id = ?")
            .bind(delta)
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        tx.commit().await?;
        self.mirror_incr(key.to_owned(), delta);
        Ok(())
    }

    // ---- users & channels ----

    /// 创建用户余额行或为其追加额度。
    pub async fn grant_user_quota(&self, user_id: i64, amount: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, quota) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET quota = quota + excluded.quota
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user(&self, user_id: i64) -> Result<UserBalance, StoreError> {
        let row = sqlx::query("SELECT id, quota, used_quota, request_count FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok(UserBalance {
            id: row.try_get("id")?,
            quota: row.try_get("quota")?,
            used_quota: row.try_get("used_quota")?,
            request_count: row.try_get("request_count")?,
        })
    }

    pub async fn get_user_quota(&self, user_id: i64) -> Result<i64, StoreError> {
        Ok(self.get_user(user_id).await?.quota)
    }

    pub async fn increase_user_quota(&self, user_id: i64, quota: i64) -> Result<(), StoreError> {
        if quota < 0 {
            return Err(StoreError::Invalid("quota must not be negative".into()));
        }
        self.adjust_user_quota(user_id, quota).await
    }

    pub async fn decrease_user_quota(&self, user_id: i64, quota: i64) -> Result<(), StoreError> {
        if quota < 0 {
            return Err(StoreError::Invalid("quota must not be negative".into()));
        }
        self.adjust_user_quota(user_id, -quota).await
    }

    async fn adjust_user_quota(&self, user_id: i64, delta: i64) -> Result<(), StoreError> {
        if let Some(batcher) = self.batcher.as_ref() {
            batcher.add(BatchKind::UserQuota, user_id, delta);
            return Ok(());
        }
        apply_user_quota_delta(&self.pool, user_id, delta).await
    }

    pub async fn update_user_used_quota_and_request_count(
        &self,
        user_id: i64,
        quota: i64,
    ) -> Result<(), StoreError> {
        if let Some(batcher) = self.batcher.as_ref() {
            batcher.add(BatchKind::UserUsedQuota, user_id, quota);
            batcher.add(BatchKind::UserRequestCount, user_id, 1);
            return Ok(());
        }
        apply_user_used_delta(&self.pool, user_id, quota, 1).await
    }

    pub async fn update_channel_used_quota(&self, channel_id: i64, quota: i64) -> Result<(), StoreError> {
        if let Some(batcher) = self.batcher.as_ref() {
            batcher.add(BatchKind::ChannelUsedQuota, channel_id, quota);
            return Ok(());
        }
        apply_channel_used_delta(&self.pool, channel_id, quota).await
    }

    pub async fn get_channel_used_quota(&self, channel_id: i64) -> Result<i64, StoreError> {
        let used = sqlx::query_scalar::<_, i64>("SELECT used_quota FROM channels WHERE id = ?")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(used.unwrap_or(0))
    }

    // ---- consume logs ----

    pub async fn record_consume_log(&self, log: &ConsumeLog) -> Result<i64, StoreError> {
        let other = serde_json::to_string(&log.other).unwrap_or_else(|_| "{}".to_string());
        let id = sqlx::query(
            r#"
            INSERT INTO consume_logs (
                user_id, created_at, channel_id, token_id, token_name, model_name,
                prompt_tokens, completion_tokens, quota, content, use_time_seconds,
                is_stream, "group", other
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.user_id)
        .bind(log.created_at)
        .bind(log.channel_id)
        .bind(log.token_id)
        .bind(&log.token_name)
        .bind(&log.model_name)
        .bind(log.prompt_tokens)
        .bind(log.completion_tokens)
        .bind(log.quota)
        .bind(&log.content)
        .bind(log.use_time_seconds)
        .bind(log.is_stream)
        .bind(&log.group)
        .bind(other)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    /// 最近的消费日志；给定 `user_id` 时只查该用户的记录。
    pub async fn recent_consume_logs(
        &self,
        user_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ConsumeLog>, StoreError> {
        let limit = limit.clamp(1, 500) as i64;
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, created_at, channel_id, token_id, token_name, model_name,
                   prompt_tokens, completion_tokens, quota, content, use_time_seconds,
                   is_stream, "group", other
            FROM consume_logs
            WHERE (? IS NULL OR user_id = ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ConsumeLog, sqlx::Error> {
                let other: Option<String> = row.try_get("other")?;
                Ok(ConsumeLog {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    created_at: row.try_get("created_at")?,
                    channel_id: row.try_get("channel_id")?,
                    token_id: row.try_get("token_id")?,
                    token_name: row.try_get("token_name")?,
                    model_name: row.try_get("model_name")?,
                    prompt_tokens: row.try_get("prompt_tokens")?,
                    completion_tokens: row.try_get("completion_tokens")?,
                    quota: row.try_get("quota")?,
                    content: row.try_get("content")?,
                    use_time_seconds: row.try_get("use_time_seconds")?,
                    is_stream: row.try_get("is_stream")?,
                    group: row.try_get("group")?,
                    other: other
                        .and_then(|raw| serde_json::from_str(&raw).ok())
                        .unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    // ---- cache mirroring ----
    // 镜像写入走有序通道，同一进程内按提交顺序落到缓存。

    fn mirror_set(&self, token: Token) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        self.tasks.spawn_ordered("cache:set_token", async move {
            cache.set(&token).await.map_err(|err| err.to_string())
        });
    }

    fn mirror_delete(&self, key: String) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        self.tasks.spawn_ordered("cache:delete_token", async move {
            cache.delete(&key).await.map_err(|err| err.to_string())
        });
    }

    fn mirror_incr(&self, key: String, delta: i64) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        self.tasks.spawn_ordered("cache:incr_token_quota", async move {
            cache.incr_quota(&key, delta).await.map_err(|err| err.to_string())
        });
    }
}

#[async_trait]
impl QuotaLookup for TokenStore {
    async fn user_quota(&self, user_id: i64) -> Result<i64, StoreError> {
        self.get_user_quota(user_id).await
    }

    async fn token_quota(&self, token: &Token) -> Result<i64, StoreError> {
        if let Some(cache) = self.cache.as_ref()
            && let Ok(Some(cached)) = cache.get(&token.key).await
        {
            return Ok(cached.remain_quota);
        }
        let remain = sqlx::query_scalar::<_, i64>("SELECT remain_quota FROM tokens WHERE id = ?")
            .bind(token.id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok(remain)
    }
}

pub(crate) async fn open_pool(path: &Path) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// 令牌额度的原子相对更新。受限令牌的余额不会被写成负数。
pub(crate) async fn apply_token_delta<'e, E>(executor: E, id: i64, delta: i64) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        UPDATE tokens
        SET remain_quota = CASE
                WHEN unlimited_quota = 1 OR remain_quota + ? >= 0 THEN remain_quota + ?
                ELSE 0
            END,
            used_quota = used_quota - ?,
            accessed_time = ?
        WHERE id = ?
        "#,
    )
    .bind(delta)
    .bind(delta)
    .bind(delta)
    .bind(Utc::now().timestamp())
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn apply_user_quota_delta(
    pool: &SqlitePool,
    user_id: i64,
    delta: i64,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE users SET quota = quota + ? WHERE id = ?")
        .bind(delta)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub(crate) async fn apply_user_used_delta(
    pool: &SqlitePool,
    user_id: i64,
    used: i64,
    requests: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE users SET used_quota = used_quota + ?, request_count = request_count + ? WHERE id = ?",
    )
    .bind(used)
    .bind(requests)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn apply_channel_used_delta(
    pool: &SqlitePool,
    channel_id: i64,
    used: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO channels (id, used_quota) VALUES (?, ?)
        ON CONFLICT(id) DO UPDATE SET used_quota = used_quota + excluded.used_quota
        "#,
    )
    .bind(channel_id)
    .bind(used)
    .execute(pool)
    .await?;
    Ok(())
}

fn token_from_row(row: &SqliteRow) -> Result<Token, sqlx::Error> {
    let status: i64 = row.try_get("status")?;
    let interval_unit: Option<i64> = row.try_get("interval_unit")?;
    Ok(Token {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        key: row.try_get("key")?,
        status: TokenStatus::from(status),
        name: row.try_get("name")?,
        created_time: row.try_get("created_time")?,
        accessed_time: row.try_get("accessed_time")?,
        expired_time: row.try_get("expired_time")?,
        remain_quota: row.try_get("remain_quota")?,
        unlimited_quota: row.try_get("unlimited_quota")?,
        model_limits_enabled: row.try_get("model_limits_enabled")?,
        model_limits: row.try_get("model_limits")?,
        allow_ips: row.try_get("allow_ips")?,
        used_quota: row.try_get("used_quota")?,
        group: row.try_get("group")?,
        interval_quota: row.try_get("interval_quota")?,
        interval_time: row.try_get("interval_time")?,
        trigger_last_time: row.try_get("trigger_last_time")?,
        interval_unit: interval_unit.map(IntervalUnit::from),
        deleted_at: row.try_get("deleted_at")?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::MemoryTokenCache;
    use std::time::Duration;
    use tempfile::TempDir;

    pub(crate) async fn test_store(options: StoreOptions) -> (TempDir, TokenStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let tasks = BackgroundTasks::start(2, 64);
        let store = TokenStore::connect(dir.path().join("relay.db"), tasks, options)
            .await
            .expect("store");
        (dir, store)
    }

    fn limited(remain: i64) -> NewToken {
        NewToken {
            name: "test".into(),
            remain_quota: remain,
            ..NewToken::default()
        }
    }

    #[tokio::test]
    async fn issue_and_lookup_by_key() {
        let (_dir, store) = test_store(StoreOptions::default()).await;
        let token = store.issue_token(1, limited(100)).await.unwrap();
        assert_eq!(token.key.len(), crate::token::KEY_LENGTH);

        let found = store.get_token_by_key(&token.key, false).await.unwrap().unwrap();
        assert_eq!(found.id, token.id);
        assert_eq!(found.used_quota, 0);

        let validated = store
            .validate_user_token(&format!("sk-{}", token.key))
            .await
            .unwrap();
        assert_eq!(validated.id, token.id);
    }

    #[tokio::test]
    async fn rejects_empty_and_unknown_keys() {
        let (_dir, store) = test_store(StoreOptions::default()).await;
        assert!(matches!(store.validate_user_token("").await, Err(TokenError::NotFound)));
        assert!(matches!(
            store.validate_user_token("sk-missing").await,
            Err(TokenError::NotFound)
        ));
    }

    #[tokio::test]
    async fn activation_happens_exactly_once() {
        let (_dir, store) = test_store(StoreOptions::default()).await;
        let spec = NewToken {
            interval_unit: Some(IntervalUnit::Day),
            interval_time: 2,
            interval_quota: 50,
            ..limited(50)
        };
        let token = store.issue_token(1, spec).await.unwrap();
        assert_eq!(token.expired_time, crate::token::NEVER_EXPIRES);

        let first = store.validate_user_token(&token.key).await.unwrap();
        assert_ne!(first.expired_time, crate::token::NEVER_EXPIRES);
        let second = store.validate_user_token(&token.key).await.unwrap();
        assert_eq!(first.expired_time, second.expired_time);
        assert_eq!(first.trigger_last_time, second.trigger_last_time);
    }

    #[tokio::test]
    async fn expired_and_exhausted_are_distinct_errors() {
        let (_dir, store) = test_store(StoreOptions::default()).await;
        let expired = store
            .issue_token(
                1,
                NewToken {
                    expired_time: Some(Utc::now().timestamp() - 10),
                    ..limited(100)
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            store.validate_user_token(&expired.key).await,
            Err(TokenError::Expired)
        ));
        let persisted = store.get_token_by_id(expired.id).await.unwrap();
        assert_eq!(persisted.status, TokenStatus::Expired);

        let exhausted = store.issue_token(1, limited(0)).await.unwrap();
        assert!(matches!(
            store.validate_user_token(&exhausted.key).await,
            Err(TokenError::Exhausted { remain_quota: 0, .. })
        ));
        let persisted = store.get_token_by_id(exhausted.id).await.unwrap();
        assert_eq!(persisted.status, TokenStatus::Exhausted);
        // 状态已落库后，第二次校验走状态分支。
        assert!(matches!(
            store.validate_user_token(&exhausted.key).await,
            Err(TokenError::Exhausted { .. })
        ));
    }

    #[tokio::test]
    async fn authoritative_cache_skips_local_status_writes() {
        let cache: Arc<dyn TokenCache> =
            Arc::new(MemoryTokenCache::new(64, Duration::from_secs(60)));
        let (_dir, store) = test_store(StoreOptions {
            cache: Some(cache),
            authority: StatusAuthority::ExternalCache,
            batcher: None,
        })
        .await;
        let token = store.issue_token(1, limited(0)).await.unwrap();
        assert!(matches!(
            store.validate_user_token(&token.key).await,
            Err(TokenError::Exhausted { .. })
        ));
        store.tasks().wait_idle().await;
        let persisted = store.get_token_by_id(token.id).await.unwrap();
        assert_eq!(persisted.status, TokenStatus::Enabled);
    }

    #[tokio::test]
    async fn cache_mirror_tracks_quota_changes_in_order() {
        let cache: Arc<dyn TokenCache> =
            Arc::new(MemoryTokenCache::new(64, Duration::from_secs(60)));
        let (_dir, store) = test_store(StoreOptions {
            cache: Some(Arc::clone(&cache)),
            ..StoreOptions::default()
        })
        .await;
        let token = store.issue_token(1, limited(100)).await.unwrap();
        store.validate_user_token(&token.key).await.unwrap();
        store.tasks().wait_idle().await;

        for _ in 0..5 {
            store.decrease_token_quota(token.id, &token.key, 30).await.unwrap();
            // 按 id 读取不会用旧行覆盖缓存。
            store.get_token_by_id(token.id).await.unwrap();
        }
        store.increase_token_quota(token.id, &token.key, 15).await.unwrap();
        store.tasks().wait_idle().await;

        let persisted = store.get_token_by_id(token.id).await.unwrap();
        let cached = cache.get(&token.key).await.unwrap().unwrap();
        assert_eq!(persisted.remain_quota, 15);
        assert_eq!(cached.remain_quota, persisted.remain_quota);
    }

    #[tokio::test]
    async fn disabled_token_is_unavailable() {
        let (_dir, store) = test_store(StoreOptions::default()).await;
        let mut token = store.issue_token(1, limited(10)).await.unwrap();
        token.status = TokenStatus::Disabled;
        store.select_update_token(&token).await.unwrap();
        assert!(matches!(
            store.validate_user_token(&token.key).await,
            Err(TokenError::Unavailable { status: 2 })
        ));
    }

    #[tokio::test]
    async fn quota_primitives_reject_negative_and_move_both_counters() {
        let (_dir, store) = test_store(StoreOptions::default()).await;
        let token = store.issue_token(1, limited(100)).await.unwrap();
        assert!(store.decrease_token_quota(token.id, &token.key, -1).await.is_err());

        store.decrease_token_quota(token.id, &token.key, 30).await.unwrap();
        store.increase_token_quota(token.id, &token.key, 10).await.unwrap();
        let after = store.get_token_by_id(token.id).await.unwrap();
        assert_eq!(after.remain_quota, 80);
        assert_eq!(after.used_quota, 20);
    }

    #[tokio::test]
    async fn limited_remain_quota_never_goes_negative() {
        let (_dir, store) = test_store(StoreOptions::default()).await;
        let token = store.issue_token(1, limited(5)).await.unwrap();
        store.decrease_token_quota(token.id, &token.key, 50).await.unwrap();
        let after = store.get_token_by_id(token.id).await.unwrap();
        assert_eq!(after.remain_quota, 0);
        assert_eq!(after.used_quota, 50);
    }

    #[tokio::test]
    async fn reserve_quota_is_all_or_nothing() {
        let (_dir, store) = test_store(StoreOptions::default()).await;
        store.grant_user_quota(1, 40).await.unwrap();
        let token = store.issue_token(1, limited(100)).await.unwrap();

        let err = store.reserve_quota(&token, 60).await.unwrap_err();
        assert!(matches!(err, ReserveError::UserQuota));
        let untouched = store.get_token_by_id(token.id).await.unwrap();
        assert_eq!(untouched.remain_quota, 100);

        store.reserve_quota(&token, 30).await.unwrap();
        assert_eq!(store.get_user_quota(1).await.unwrap(), 10);
        assert_eq!(store.get_token_by_id(token.id).await.unwrap().remain_quota, 70);

        let err = store.reserve_quota(&token, 80).await.unwrap_err();
        assert!(matches!(err, ReserveError::TokenQuota { remain: 70, need: 80 }));
    }

    #[tokio::test]
    async fn refresh_sweep_selects_due_cards_only() {
        let (_dir, store) = test_store(StoreOptions::default()).await;
        let now = Utc::now().timestamp();
        let due = store
            .issue_token(
                1,
                NewToken {
                    expired_time: Some(now + 86_400),
                    interval_unit: Some(IntervalUnit::Minute),
                    interval_time: 1,
                    interval_quota: 500,
                    ..limited(3)
                },
            )
            .await
            .unwrap();
        // 从未过期的令牌不参与刷新。
        store
            .issue_token(
                1,
                NewToken {
                    interval_unit: Some(IntervalUnit::Minute),
                    interval_time: 1,
                    interval_quota: 500,
                    ..limited(3)
                },
            )
            .await
            .unwrap();

        let found = store.find_tokens_to_execute_now(now + 120).await.unwrap();
        assert_eq!(found.len(), 1);
        let mut token = found.into_iter().next().unwrap();
        assert_eq!(token.id, due.id);

        store.refresh_token_quota(&mut token, now + 120).await.unwrap();
        let refreshed = store.get_token_by_id(due.id).await.unwrap();
        assert_eq!(refreshed.remain_quota, 500);
        assert_eq!(refreshed.trigger_last_time, now + 120);
        assert!(store.find_tokens_to_execute_now(now + 130).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn soft_delete_hides_tokens_and_batch_is_owner_scoped() {
        let (_dir, store) = test_store(StoreOptions::default()).await;
        let a = store.issue_token(1, limited(1)).await.unwrap();
        let b = store.issue_token(1, limited(1)).await.unwrap();
        let other = store.issue_token(2, limited(1)).await.unwrap();

        let deleted = store.batch_delete_tokens(&[a.id, other.id], 1).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_token_by_key(&a.key, true).await.unwrap().is_none());
        assert!(store.get_token_by_key(&other.key, true).await.unwrap().is_some());

        store.delete_token_by_id(b.id, 1).await.unwrap();
        assert_eq!(store.count_user_tokens(1).await.unwrap(), 0);
        assert!(store.batch_delete_tokens(&[], 1).await.is_err());
    }

    #[tokio::test]
    async fn reenabling_exhausted_token_is_refused() {
        let (_dir, store) = test_store(StoreOptions::default()).await;
        let mut token = store.issue_token(1, limited(0)).await.unwrap();
        token.status = TokenStatus::Exhausted;
        store.select_update_token(&token).await.unwrap();

        let err = store
            .apply_token_edit(1, token.id, NewToken::default(), Some(TokenStatus::Enabled), true)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn consume_logs_round_trip_other_map() {
        let (_dir, store) = test_store(StoreOptions::default()).await;
        let mut other = serde_json::Map::new();
        other.insert("web_search".into(), serde_json::Value::Bool(true));
        store
            .record_consume_log(&ConsumeLog {
                user_id: 1,
                created_at: 10,
                model_name: "gpt-4o".into(),
                quota: 42,
                other,
                ..ConsumeLog::default()
            })
            .await
            .unwrap();
        let logs = store.recent_consume_logs(None, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].quota, 42);
        assert_eq!(logs[0].other.get("web_search"), Some(&serde_json::Value::Bool(true)));
    }

    #[tokio::test]
    async fn settlement_delta_is_all_or_nothing() {
        let (_dir, store) = test_store(StoreOptions::default()).await;
        store.grant_user_quota(1, 100).await.unwrap();
        let token = store
            .issue_token(1, NewToken { remain_quota: 50, ..NewToken::default() })
            .await
            .unwrap();

        store
            .apply_settlement_delta(token.id, &token.key, 1, -20)
            .await
            .unwrap();
        assert_eq!(store.get_token_by_id(token.id).await.unwrap().remain_quota, 30);
        assert_eq!(store.get_user_quota(1).await.unwrap(), 80);

        // 用户行缺失时令牌扣减随事务回滚。
        let orphan = store
            .issue_token(2, NewToken { remain_quota: 50, ..NewToken::default() })
            .await
            .unwrap();
        let err = store
            .apply_settlement_delta(orphan.id, &orphan.key, 2, -20)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
        let untouched = store.get_token_by_id(orphan.id).await.unwrap();
        assert_eq!(untouched.remain_quota, 50);
        assert_eq!(untouched.used_quota, 0);
    }

    #[tokio::test]
    async fn consume_logs_filter_by_user_before_limit() {
        let (_dir, store) = test_store(StoreOptions::default()).await;
        store
            .record_consume_log(&ConsumeLog {
                user_id: 1,
                created_at: 1,
                quota: 7,
                ..ConsumeLog::default()
            })
            .await
            .unwrap();
        for created_at in 2..6 {
            store
                .record_consume_log(&ConsumeLog {
                    user_id: 2,
                    created_at,
                    quota: 1,
                    ..ConsumeLog::default()
                })
                .await
                .unwrap();
        }

        // 其他用户的较新记录不会挤掉本用户的记录。
        let mine = store.recent_consume_logs(Some(1), 2).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].quota, 7);

        let theirs = store.recent_consume_logs(Some(2), 2).await.unwrap();
        assert_eq!(theirs.len(), 2);
        assert!(theirs.iter().all(|log| log.user_id == 2));
        assert_eq!(store.recent_consume_logs(None, 10).await.unwrap().len(), 5);
    }
}
