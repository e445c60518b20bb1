//! 外部内容审查：调用 OpenAI 兼容的 moderation 接口，并按阈值或标记模式换算出违规项。

use std::collections::HashMap;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::{AuditSettings, DEFAULT_MODERATION_MODEL, DEFAULT_MODERATION_URL, ModerationMode};

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("moderation api key is not configured")]
    Config,
    #[error("moderation request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("moderation endpoint returned {status}: {body}")]
    Upstream { status: StatusCode, body: String },
    #[error("moderation response is invalid: {0}")]
    InvalidResponse(String),
    #[error("moderation returned no results")]
    EmptyResults,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModerationResult {
    #[serde(default)]
    pub categories: HashMap<String, bool>,
    #[serde(default)]
    pub category_scores: HashMap<String, f64>,
    #[serde(default)]
    pub flagged: bool,
}

#[derive(Debug, Deserialize)]
struct ModerationResponse {
    #[serde(default)]
    results: Vec<ModerationResult>,
}

/// 审查类别的可读描述，未知类别原样显示。
pub fn category_description(category: &str) -> &str {
    match category {
        "harassment" => "Harassment: content that expresses, incites, or promotes harassing language towards any target",
        "harassment/threatening" => "Threatening harassment: harassment that also includes violence or serious harm towards any target",
        "hate" => "Hate: content that expresses, incites, or promotes hate based on a protected attribute",
        "hate/threatening" => "Threatening hate: hateful content that also includes violence or serious harm towards the targeted group",
        "illicit" => "Illicit: content that gives advice or instruction on how to commit illicit acts",
        "illicit/violent" => "Violent illicit: illicit instructions that also include violence or procuring a weapon",
        "self-harm" => "Self-harm: content that promotes, encourages, or depicts acts of self-harm",
        "self-harm/instructions" => "Self-harm instructions: content that encourages or instructs on performing acts of self-harm",
        "self-harm/intent" => "Self-harm intent: the speaker expresses that they are engaging or intend to engage in self-harm",
        "sexual" => "Sexual: content meant to arouse sexual excitement or that promotes sexual services",
        "sexual/minors" => "Sexual content involving minors: sexual content that includes an individual under 18",
        "violence" => "Violence: content that depicts death, violence, or physical injury",
        "violence/graphic" => "Graphic violence: content that depicts death, violence, or injury in graphic detail",
        other => other,
    }
}

/// 解析 `category:threshold` 列表，保持配置顺序；缺少或无法解析阈值的条目被忽略。
pub fn parse_thresholds(categories: &[String]) -> Vec<(String, f64)> {
    let mut parsed: Vec<(String, f64)> = Vec::new();
    for entry in categories {
        let entry = entry.trim();
        let Some((category, threshold)) = entry.split_once(':') else {
            continue;
        };
        let Ok(threshold) = threshold.trim().parse::<f64>() else {
            continue;
        };
        let category = category.trim().to_string();
        match parsed.iter_mut().find(|(existing, _)| *existing == category) {
            Some(slot) => slot.1 = threshold,
            None => parsed.push((category, threshold)),
        }
    }
    parsed
}

/// 阈值模式：分数不低于阈值即违规。没有有效阈值时视为关闭审查。
pub fn threshold_violations(result: &ModerationResult, categories: &[String]) -> Vec<String> {
    parse_thresholds(categories)
        .into_iter()
        .filter_map(|(category, threshold)| {
            let score = *result.category_scores.get(&category)?;
            (score >= threshold).then(|| {
                format!(
                    "{} (score: {score:.4}, threshold: {threshold:.4})",
                    category_description(&category)
                )
            })
        })
        .collect()
}

/// 标记模式：整体未被标记时直接通过，否则收集被请求且被标记的类别。
pub fn flag_violations(result: &ModerationResult, categories: &[String]) -> Vec<String> {
    if !result.flagged {
        return Vec::new();
    }
    categories
        .iter()
        .map(|category| category.trim())
        .filter(|category| result.categories.get(*category).copied().unwrap_or(false))
        .map(|category| category_description(category).to_string())
        .collect()
}

#[derive(Debug, Clone)]
pub struct ModerationClient {
    client: Client,
}

impl ModerationClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// 审查一段内容，返回违规描述列表；通过时返回空列表。
    pub async fn audit(
        &self,
        content: &str,
        settings: &AuditSettings,
    ) -> Result<Vec<String>, ModerationError> {
        if settings.api_key.is_empty() {
            return Err(ModerationError::Config);
        }
        let url = match settings.url.trim() {
            "" => DEFAULT_MODERATION_URL,
            url => url,
        };
        let model = match settings.model.trim() {
            "" => DEFAULT_MODERATION_MODEL,
            model => model,
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(&settings.api_key)
            .json(&json!({ "input": content, "model": model }))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        tracing::debug!(%status, bytes = body.len(), "moderation response received");
        if status != StatusCode::OK {
            return Err(ModerationError::Upstream { status, body });
        }

        let parsed: ModerationResponse = serde_json::from_str(&body)
            .map_err(|err| ModerationError::InvalidResponse(err.to_string()))?;
        let Some(result) = parsed.results.into_iter().next() else {
            return Err(ModerationError::EmptyResults);
        };

        Ok(match settings.mode {
            ModerationMode::Threshold => threshold_violations(&result, &settings.categories),
            ModerationMode::Flag => flag_violations(&result, &settings.categories),
        })
    }
}
