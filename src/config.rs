//! 网关配置：定价表、渠道列表与各子系统开关。整份配置是一个 JSON 文档，所有字段都有默认值。

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::store::StatusAuthority;

pub const DEFAULT_QUOTA_PER_UNIT: f64 = 500_000.0;
pub const DEFAULT_PRE_CONSUMED_TOKENS: i64 = 500;
pub const DEFAULT_MODERATION_URL: &str = "https://api.openai.com/v1/moderations";
pub const DEFAULT_MODERATION_MODEL: &str = "omni-moderation-latest";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub pricing: PricingConfig,
    pub channels: Vec<ChannelConfig>,
    pub sensitive: SensitiveConfig,
    /// 原样转发客户端请求体，不做协议转换。
    pub pass_through_request: bool,
    /// 流式请求且渠道支持时强制开启 `stream_options.include_usage`。
    pub force_stream_option: bool,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub tasks: TaskPoolConfig,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_group")]
    pub default_group: String,
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_group() -> String {
    "default".to_string()
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pricing.quota_per_unit <= 0.0 {
            return Err(ConfigError::Invalid("quota_per_unit must be positive".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate channel id {}",
                    channel.id
                )));
            }
            if channel.base_url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "channel {} has no base_url",
                    channel.id
                )));
            }
            url::Url::parse(&channel.base_url).map_err(|err| {
                ConfigError::Invalid(format!("channel {} base_url: {err}", channel.id))
            })?;
        }
        Ok(())
    }

    pub fn channel(&self, id: i64) -> Option<&ChannelConfig> {
        self.channels.iter().find(|channel| channel.id == id)
    }
}

/// 价格与倍率表。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub quota_per_unit: f64,
    pub model_ratio: HashMap<String, f64>,
    pub completion_ratio: HashMap<String, f64>,
    pub cache_ratio: HashMap<String, f64>,
    pub image_ratio: HashMap<String, f64>,
    pub group_ratio: HashMap<String, f64>,
    /// 按次计费的模型价格；命中时走固定价格模式。
    pub model_price: HashMap<String, f64>,
    pub pre_consumed_tokens: i64,
    pub claude_web_search_price: f64,
    pub file_search_price: f64,
    /// 每百万 token 的音频输入价格。
    pub audio_input_price: HashMap<String, f64>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            quota_per_unit: DEFAULT_QUOTA_PER_UNIT,
            model_ratio: HashMap::new(),
            completion_ratio: HashMap::new(),
            cache_ratio: HashMap::new(),
            image_ratio: HashMap::new(),
            group_ratio: HashMap::new(),
            model_price: HashMap::new(),
            pre_consumed_tokens: DEFAULT_PRE_CONSUMED_TOKENS,
            claude_web_search_price: 10.0,
            file_search_price: 2.5,
            audio_input_price: HashMap::new(),
        }
    }
}

/// 上游渠道。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub id: i64,
    pub name: String,
    /// 适配器类型名，如 `openai`、`claude`。
    pub api_type: String,
    pub base_url: String,
    pub key: String,
    pub models: Vec<String>,
    pub groups: Vec<String>,
    pub model_mapping: HashMap<String, String>,
    pub status_code_mapping: HashMap<String, String>,
    pub param_override: serde_json::Map<String, serde_json::Value>,
    pub convert_system_role: bool,
    pub supports_stream_options: bool,
    pub audit: Option<AuditSettings>,
    pub billing_supplement: Vec<SupplementRule>,
    pub enabled: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            api_type: "openai".to_string(),
            base_url: String::new(),
            key: String::new(),
            models: Vec::new(),
            groups: vec![default_group()],
            model_mapping: HashMap::new(),
            status_code_mapping: HashMap::new(),
            param_override: serde_json::Map::new(),
            convert_system_role: false,
            supports_stream_options: true,
            audit: None,
            billing_supplement: Vec::new(),
            enabled: true,
        }
    }
}

impl ChannelConfig {
    pub fn serves(&self, model: &str, group: &str) -> bool {
        self.enabled
            && self.models.iter().any(|served| served == model)
            && self.groups.iter().any(|served| served == group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationMode {
    #[default]
    Threshold,
    Flag,
}

/// 渠道级外部内容审查设置。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub enabled: bool,
    pub mode: ModerationMode,
    #[serde(deserialize_with = "deserialize_categories")]
    pub categories: Vec<String>,
    pub url: String,
    pub api_key: String,
    pub model: String,
}

/// 审查类别既可以写成数组，也可以写成 JSON 数组字符串或逗号分隔字符串。
fn deserialize_categories<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Text(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::List(items) => items,
        Raw::Text(text) => parse_categories(&text),
    })
}

pub fn parse_categories(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    if let Ok(items) = serde_json::from_str::<Vec<String>>(raw) {
        return items;
    }
    raw.split(',').map(|item| item.trim().to_string()).collect()
}

/// 补充计费规则：输入 token 超过 `token_count` 时整单乘以 `multiplied`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplementRule {
    #[serde(rename = "tokenCount")]
    pub token_count: i64,
    pub multiplied: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub capacity: u64,
    pub authority: StatusAuthority,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 60,
            capacity: 10_000,
            authority: StatusAuthority::LocalStore,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensitiveConfig {
    pub check_prompt: bool,
    pub words: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = GatewayConfig::from_json("{}").unwrap();
        assert_eq!(config.pricing.quota_per_unit, DEFAULT_QUOTA_PER_UNIT);
        assert_eq!(config.pricing.pre_consumed_tokens, 500);
        assert_eq!(config.refresh_interval_secs, 60);
        assert_eq!(config.default_group, "default");
        assert_eq!(config.cache.authority, StatusAuthority::LocalStore);
    }

    #[test]
    fn audit_categories_accept_every_spelling() {
        let raw = r#"{
            "channels": [
                {"id": 1, "base_url": "http://a", "audit": {"categories": ["hate:0.5"]}},
                {"id": 2, "base_url": "http://b", "audit": {"categories": "[\"violence:0.8\"]"}},
                {"id": 3, "base_url": "http://c", "audit": {"categories": "hate, sexual", "mode": "flag"}}
            ]
        }"#;
        let config = GatewayConfig::from_json(raw).unwrap();
        let cats = |id| config.channel(id).unwrap().audit.clone().unwrap().categories;
        assert_eq!(cats(1), vec!["hate:0.5"]);
        assert_eq!(cats(2), vec!["violence:0.8"]);
        assert_eq!(cats(3), vec!["hate", "sexual"]);
        assert_eq!(
            config.channel(3).unwrap().audit.as_ref().unwrap().mode,
            ModerationMode::Flag
        );
    }

    #[test]
    fn supplement_rules_use_camel_case_breakpoint() {
        let raw = r#"{"channels": [{"id": 1, "base_url": "http://a",
            "billing_supplement": [{"tokenCount": 1000, "multiplied": 2}]}]}"#;
        let config = GatewayConfig::from_json(raw).unwrap();
        assert_eq!(
            config.channels[0].billing_supplement,
            vec![SupplementRule { token_count: 1000, multiplied: 2 }]
        );
    }

    #[test]
    fn rejects_duplicate_channels_and_bad_urls() {
        let dup = r#"{"channels": [{"id": 1, "base_url": "http://a"}, {"id": 1, "base_url": "http://b"}]}"#;
        assert!(matches!(GatewayConfig::from_json(dup), Err(ConfigError::Invalid(_))));
        let bad = r#"{"channels": [{"id": 1, "base_url": "not a url"}]}"#;
        assert!(matches!(GatewayConfig::from_json(bad), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn channel_serves_model_in_group() {
        let channel = ChannelConfig {
            models: vec!["gpt-4o".into()],
            ..ChannelConfig::default()
        };
        assert!(channel.serves("gpt-4o", "default"));
        assert!(!channel.serves("gpt-4o", "vip"));
        assert!(!channel.serves("claude-3", "default"));
    }
}
