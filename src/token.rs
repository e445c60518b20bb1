use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};

/// 永不过期的哨兵值。
pub const NEVER_EXPIRES: i64 = -1;

/// 令牌密钥长度（不含 `sk-` 前缀）。
pub const KEY_LENGTH: usize = 48;

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

/// 令牌状态，数据库中以整数存储。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i64", from = "i64")]
pub enum TokenStatus {
    Enabled,
    Disabled,
    Expired,
    Exhausted,
    Unknown(i64),
}

impl TokenStatus {
    pub fn code(self) -> i64 {
        match self {
            TokenStatus::Enabled => 1,
            TokenStatus::Disabled => 2,
            TokenStatus::Expired => 3,
            TokenStatus::Exhausted => 4,
            TokenStatus::Unknown(code) => code,
        }
    }
}

impl From<i64> for TokenStatus {
    fn from(code: i64) -> Self {
        match code {
            1 => TokenStatus::Enabled,
            2 => TokenStatus::Disabled,
            3 => TokenStatus::Expired,
            4 => TokenStatus::Exhausted,
            other => TokenStatus::Unknown(other),
        }
    }
}

impl From<TokenStatus> for i64 {
    fn from(status: TokenStatus) -> Self {
        status.code()
    }
}

/// 间隔卡单位。8/9/10 为“不刷新”的定长卡，只决定有效期。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i64", from = "i64")]
pub enum IntervalUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
    WeekFixed,
    MonthFixed,
    QuarterFixed,
}

impl IntervalUnit {
    pub fn code(self) -> i64 {
        match self {
            IntervalUnit::Minute => 1,
            IntervalUnit::Hour => 2,
            IntervalUnit::Day => 3,
            IntervalUnit::Week => 4,
            IntervalUnit::Month => 5,
            IntervalUnit::Quarter => 6,
            IntervalUnit::Year => 7,
            IntervalUnit::WeekFixed => 8,
            IntervalUnit::MonthFixed => 9,
            IntervalUnit::QuarterFixed => 10,
        }
    }

    pub fn seconds(self) -> i64 {
        match self {
            IntervalUnit::Minute => MINUTE,
            IntervalUnit::Hour => HOUR,
            IntervalUnit::Day => DAY,
            IntervalUnit::Week | IntervalUnit::WeekFixed => 7 * DAY,
            IntervalUnit::Month | IntervalUnit::MonthFixed => 30 * DAY,
            IntervalUnit::Quarter | IntervalUnit::QuarterFixed => 90 * DAY,
            IntervalUnit::Year => 365 * DAY,
        }
    }

    /// 定长卡：激活后不参与额度刷新。
    pub fn is_fixed_card(self) -> bool {
        matches!(
            self,
            IntervalUnit::WeekFixed | IntervalUnit::MonthFixed | IntervalUnit::QuarterFixed
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            IntervalUnit::Minute => "minute card",
            IntervalUnit::Hour => "hour card",
            IntervalUnit::Day => "day card",
            IntervalUnit::Week => "week card",
            IntervalUnit::Month => "month card",
            IntervalUnit::Quarter => "quarter card",
            IntervalUnit::Year => "year card",
            IntervalUnit::WeekFixed => "non-refreshing week card",
            IntervalUnit::MonthFixed => "non-refreshing month card",
            IntervalUnit::QuarterFixed => "non-refreshing quarter card",
        }
    }
}

impl From<i64> for IntervalUnit {
    fn from(code: i64) -> Self {
        match code {
            1 => IntervalUnit::Minute,
            2 => IntervalUnit::Hour,
            4 => IntervalUnit::Week,
            5 => IntervalUnit::Month,
            6 => IntervalUnit::Quarter,
            7 => IntervalUnit::Year,
            8 => IntervalUnit::WeekFixed,
            9 => IntervalUnit::MonthFixed,
            10 => IntervalUnit::QuarterFixed,
            _ => IntervalUnit::Day,
        }
    }
}

impl From<IntervalUnit> for i64 {
    fn from(unit: IntervalUnit) -> Self {
        unit.code()
    }
}

/// 判断间隔卡此刻是否应当刷新额度。纯函数，便于测试。
pub fn refresh_due(unit: IntervalUnit, magnitude: i64, last_trigger: i64, now: i64) -> bool {
    if magnitude <= 0 || unit.is_fixed_card() {
        return false;
    }
    last_trigger.saturating_add(magnitude.saturating_mul(unit.seconds())) <= now
}

/// 可计费的 API 凭证。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    pub status: TokenStatus,
    pub name: String,
    pub created_time: i64,
    pub accessed_time: i64,
    pub expired_time: i64,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub model_limits_enabled: bool,
    pub model_limits: String,
    pub allow_ips: Option<String>,
    pub used_quota: i64,
    pub group: String,
    pub interval_quota: i64,
    pub interval_time: i64,
    pub trigger_last_time: i64,
    pub interval_unit: Option<IntervalUnit>,
    pub deleted_at: Option<i64>,
}

impl Default for Token {
    fn default() -> Self {
        Self {
            id: 0,
            user_id: 0,
            key: String::new(),
            status: TokenStatus::Enabled,
            name: String::new(),
            created_time: 0,
            accessed_time: 0,
            expired_time: NEVER_EXPIRES,
            remain_quota: 0,
            unlimited_quota: false,
            model_limits_enabled: false,
            model_limits: String::new(),
            allow_ips: None,
            used_quota: 0,
            group: String::new(),
            interval_quota: 0,
            interval_time: 0,
            trigger_last_time: 0,
            interval_unit: None,
            deleted_at: None,
        }
    }
}

impl Token {
    /// 从未激活：永不过期且配置了间隔单位。
    pub fn needs_activation(&self) -> bool {
        self.expired_time == NEVER_EXPIRES && self.interval_unit.is_some()
    }

    /// 激活间隔卡：写入过期时间与上次触发时间。返回是否发生了激活。
    pub fn activate(&mut self, now: i64) -> bool {
        let Some(unit) = self.interval_unit else {
            return false;
        };
        if self.expired_time != NEVER_EXPIRES {
            return false;
        }
        let multiplier = if self.interval_time > 0 {
            self.interval_time
        } else {
            1
        };
        self.expired_time = now.saturating_add(multiplier.saturating_mul(unit.seconds()));
        self.trigger_last_time = if unit.is_fixed_card() {
            self.expired_time
        } else {
            now
        };
        true
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expired_time != NEVER_EXPIRES && self.expired_time < now
    }

    pub fn is_quota_exhausted(&self) -> bool {
        !self.unlimited_quota && self.remain_quota <= 0
    }

    /// 由额度与过期时间推导出的状态；手动禁用等非 Enabled 状态原样保留。
    pub fn derived_status(&self, now: i64) -> TokenStatus {
        if self.status != TokenStatus::Enabled {
            return self.status;
        }
        if self.is_expired_at(now) {
            TokenStatus::Expired
        } else if self.is_quota_exhausted() {
            TokenStatus::Exhausted
        } else {
            TokenStatus::Enabled
        }
    }

    /// 解析 IP 白名单：按换行切分，忽略空白与逗号，只保留合法 IP。
    pub fn allowed_ips(&self) -> HashSet<IpAddr> {
        let Some(raw) = self.allow_ips.as_deref() else {
            return HashSet::new();
        };
        raw.replace(' ', "")
            .split(['\n', ','])
            .map(str::trim)
            .filter_map(|ip| ip.parse::<IpAddr>().ok())
            .collect()
    }

    pub fn model_limits(&self) -> Vec<String> {
        self.model_limits
            .split(',')
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .map(str::to_owned)
            .collect()
    }

    pub fn model_limits_map(&self) -> HashMap<String, bool> {
        self.model_limits()
            .into_iter()
            .map(|model| (model, true))
            .collect()
    }

    /// 模型白名单检查；未开启限制时全部放行。
    pub fn allows_model(&self, model: &str) -> bool {
        !self.model_limits_enabled || self.model_limits_map().contains_key(model)
    }

    pub fn masked_key(&self) -> String {
        mask_key(&self.key)
    }
}

/// 生成 48 位字母数字密钥。
pub fn generate_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_LENGTH)
        .map(char::from)
        .collect()
}

/// 将 `sk-abcdef...xyz` 渲染为 `sk-abc***xyz`。
pub fn mask_key(key: &str) -> String {
    let key = key.strip_prefix("sk-").unwrap_or(key);
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 6 {
        return "sk-***".to_string();
    }
    let prefix: String = chars[..3].iter().collect();
    let suffix: String = chars[chars.len() - 3..].iter().collect();
    format!("sk-{prefix}***{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval_token(unit: IntervalUnit, interval_time: i64) -> Token {
        Token {
            interval_unit: Some(unit),
            interval_time,
            remain_quota: 100,
            ..Token::default()
        }
    }

    #[test]
    fn activation_stamps_expiry_once() {
        let mut token = interval_token(IntervalUnit::Day, 3);
        assert!(token.needs_activation());
        assert!(token.activate(1_000));
        assert_eq!(token.expired_time, 1_000 + 3 * DAY);
        assert_eq!(token.trigger_last_time, 1_000);

        assert!(!token.needs_activation());
        assert!(!token.activate(2_000));
        assert_eq!(token.expired_time, 1_000 + 3 * DAY);
    }

    #[test]
    fn activation_defaults_multiplier_to_one() {
        let mut token = interval_token(IntervalUnit::Week, 0);
        token.activate(10);
        assert_eq!(token.expired_time, 10 + 7 * DAY);
    }

    #[test]
    fn oversized_interval_saturates_instead_of_overflowing() {
        let mut token = interval_token(IntervalUnit::Year, i64::MAX / 1000);
        assert!(token.activate(1_700_000_000));
        assert_eq!(token.expired_time, i64::MAX);
        assert!(!token.is_expired_at(1_700_000_001));
    }

    #[test]
    fn fixed_cards_trigger_at_expiry() {
        let mut token = interval_token(IntervalUnit::MonthFixed, 1);
        token.activate(500);
        assert_eq!(token.trigger_last_time, token.expired_time);
    }

    #[test]
    fn plain_tokens_never_activate() {
        let token = Token {
            remain_quota: 10,
            ..Token::default()
        };
        assert!(!token.needs_activation());
    }

    #[test]
    fn refresh_due_uses_unit_times_magnitude() {
        assert!(!refresh_due(IntervalUnit::Hour, 2, 0, 2 * HOUR - 1));
        assert!(refresh_due(IntervalUnit::Hour, 2, 0, 2 * HOUR));
        assert!(refresh_due(IntervalUnit::Minute, 5, 100, 100 + 5 * MINUTE));
        assert!(!refresh_due(IntervalUnit::Day, 0, 0, i64::MAX));
        assert!(!refresh_due(IntervalUnit::WeekFixed, 1, 0, 30 * DAY));
    }

    #[test]
    fn derived_status_distinguishes_expired_and_exhausted() {
        let expired = Token {
            expired_time: 10,
            remain_quota: 5,
            ..Token::default()
        };
        assert_eq!(expired.derived_status(20), TokenStatus::Expired);

        let exhausted = Token {
            remain_quota: 0,
            ..Token::default()
        };
        assert_eq!(exhausted.derived_status(20), TokenStatus::Exhausted);

        let unlimited = Token {
            remain_quota: 0,
            unlimited_quota: true,
            ..Token::default()
        };
        assert_eq!(unlimited.derived_status(20), TokenStatus::Enabled);

        let disabled = Token {
            status: TokenStatus::Disabled,
            expired_time: 10,
            ..Token::default()
        };
        assert_eq!(disabled.derived_status(20), TokenStatus::Disabled);
    }

    #[test]
    fn allowed_ips_parses_mixed_separators() {
        let token = Token {
            allow_ips: Some("10.0.0.1\n 10.0.0.2,\nnot-an-ip\n::1".to_string()),
            ..Token::default()
        };
        let ips = token.allowed_ips();
        assert_eq!(ips.len(), 3);
        assert!(ips.contains(&"10.0.0.2".parse::<IpAddr>().unwrap()));
        assert!(ips.contains(&"::1".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn model_limits_only_apply_when_enabled() {
        let mut token = Token {
            model_limits: "gpt-4o, gpt-4o-mini".to_string(),
            ..Token::default()
        };
        assert!(token.allows_model("claude-3"));
        token.model_limits_enabled = true;
        assert!(token.allows_model("gpt-4o-mini"));
        assert!(!token.allows_model("claude-3"));
    }

    #[test]
    fn generated_keys_are_masked_in_logs() {
        let key = generate_key();
        assert_eq!(key.len(), KEY_LENGTH);
        let masked = mask_key(&key);
        assert!(masked.starts_with("sk-"));
        assert!(masked.contains("***"));
        assert!(!masked.contains(&key[3..45]));
    }
}
