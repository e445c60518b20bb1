//! 间隔卡额度刷新。

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::error::StoreError;
use crate::store::TokenStore;

/// 一次刷新扫描的结果。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub due: usize,
    pub refreshed: usize,
    pub failed: usize,
}

/// 把到期的间隔卡余额重置为 `interval_quota`。单个令牌失败不影响其他令牌。
pub async fn run_refresh_once(store: &TokenStore, now: i64) -> Result<RefreshReport, StoreError> {
    let tokens = store.find_tokens_to_execute_now(now).await?;
    let mut report = RefreshReport {
        due: tokens.len(),
        ..RefreshReport::default()
    };
    for mut token in tokens {
        match store.refresh_token_quota(&mut token, now).await {
            Ok(()) => {
                report.refreshed += 1;
                tracing::debug!(
                    token_id = token.id,
                    remain_quota = token.remain_quota,
                    "interval quota refreshed"
                );
            }
            Err(err) => {
                report.failed += 1;
                tracing::error!(token_id = token.id, error = %err, "failed to refresh interval quota");
            }
        }
    }
    if report.due > 0 {
        tracing::info!(due = report.due, refreshed = report.refreshed, failed = report.failed, "refresh sweep finished");
    }
    Ok(report)
}

/// 按固定周期运行刷新扫描。
pub fn spawn_refresh_loop(store: TokenStore, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = run_refresh_once(&store, Utc::now().timestamp()).await {
                tracing::error!(error = %err, "refresh sweep failed");
            }
        }
    })
}
