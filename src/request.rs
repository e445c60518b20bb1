//! 统一的 OpenAI 兼容请求/用量结构，以及入站请求校验与 token 估算。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorCode, RelayError};

pub const NO_STREAM_SUFFIX: &str = "-noStream";
pub const DEFAULT_MODERATION_REQUEST_MODEL: &str = "text-moderation-latest";
pub const TOOL_WEB_SEARCH_PREVIEW: &str = "web_search_preview";
pub const TOOL_FILE_SEARCH: &str = "file_search";

const TOKENS_PER_MESSAGE: i64 = 3;
const TOKENS_PER_NAME: i64 = 1;
const REPLY_PRIMING_TOKENS: i64 = 3;
const TOKENS_PER_IMAGE: i64 = 85;

/// 由路由决定的中继模式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    Edits,
}

impl RelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::ChatCompletions => "chat_completions",
            RelayMode::Completions => "completions",
            RelayMode::Embeddings => "embeddings",
            RelayMode::Moderations => "moderations",
            RelayMode::Edits => "edits",
        }
    }

    /// 上游请求路径（相对于渠道 base_url）。
    pub fn upstream_path(&self) -> &'static str {
        match self {
            RelayMode::ChatCompletions => "/v1/chat/completions",
            RelayMode::Completions => "/v1/completions",
            RelayMode::Embeddings => "/v1/embeddings",
            RelayMode::Moderations => "/v1/moderations",
            RelayMode::Edits => "/v1/edits",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Value::String(content.to_string()),
            ..Self::default()
        }
    }

    /// 取出文本内容；多段内容只拼接 `text` 片段。
    pub fn text_content(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    pub fn image_parts(&self) -> usize {
        match &self.content {
            Value::Array(parts) => parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("image_url"))
                .count(),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebSearchOptions {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub search_context_size: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 所有中继模式共用的请求体；未识别的字段原样保留。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneralRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_options: Option<WebSearchOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GeneralRequest {
    pub fn max_output_tokens(&self) -> i64 {
        self.max_tokens
            .unwrap_or(0)
            .max(self.max_completion_tokens.unwrap_or(0))
    }

    pub fn search_context_size(&self) -> Option<&str> {
        self.web_search_options
            .as_ref()
            .map(|options| options.search_context_size.as_str())
    }

    /// 把 system 角色折叠为 user。
    pub fn convert_system_roles(&mut self) {
        for message in &mut self.messages {
            if message.role == "system" {
                message.role = "user".to_string();
            }
        }
    }

    /// 生成外部审查摘录：最后一条用户消息，若其前面有助手回复则一并带上。
    pub fn audit_excerpt(&self) -> String {
        let mut last_user = None;
        let mut last_assistant = None;
        for (idx, message) in self.messages.iter().enumerate().rev() {
            if last_user.is_none() {
                if message.role == "user" {
                    last_user = Some(idx);
                }
                continue;
            }
            if message.role == "assistant" {
                last_assistant = Some(idx);
                break;
            }
        }
        match (last_assistant, last_user) {
            (Some(assistant), Some(user)) => format!(
                "assistant: {}\nuser: {}",
                self.messages[assistant].text_content(),
                self.messages[user].text_content()
            ),
            (None, Some(user)) => format!("user: {}", self.messages[user].text_content()),
            _ => String::new(),
        }
    }

    /// 请求里声明的内置工具，用于初始化工具用量信息。
    pub fn built_in_tools(&self) -> Option<ResponsesUsageInfo> {
        let tools = self.tools.as_ref()?;
        let mut info = ResponsesUsageInfo::default();
        for tool in tools {
            let Some(kind) = tool.get("type").and_then(Value::as_str) else {
                continue;
            };
            if kind != TOOL_WEB_SEARCH_PREVIEW && kind != TOOL_FILE_SEARCH {
                continue;
            }
            let size = tool
                .get("search_context_size")
                .and_then(Value::as_str)
                .unwrap_or("medium")
                .to_string();
            info.built_in_tools.insert(
                kind.to_string(),
                BuiltInTool {
                    call_count: 0,
                    search_context_size: size,
                },
            );
        }
        (!info.built_in_tools.is_empty()).then_some(info)
    }

    /// 拼接本地敏感词检查所需的文本。
    pub fn screened_text(&self, mode: RelayMode) -> String {
        match mode {
            RelayMode::ChatCompletions => self
                .messages
                .iter()
                .map(Message::text_content)
                .collect::<Vec<_>>()
                .join("\n"),
            RelayMode::Completions => self.prompt.as_ref().map(value_text).unwrap_or_default(),
            RelayMode::Embeddings | RelayMode::Moderations => {
                self.input.as_ref().map(value_text).unwrap_or_default()
            }
            RelayMode::Edits => format!(
                "{}\n{}",
                self.instruction.as_deref().unwrap_or_default(),
                self.input.as_ref().map(value_text).unwrap_or_default()
            ),
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => items.iter().map(value_text).collect::<Vec<_>>().join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(text)) => text.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

/// 单个内置工具的调用统计。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuiltInTool {
    pub call_count: i64,
    pub search_context_size: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsesUsageInfo {
    pub built_in_tools: HashMap<String, BuiltInTool>,
}

impl ResponsesUsageInfo {
    pub fn tool(&self, name: &str) -> Option<&BuiltInTool> {
        self.built_in_tools.get(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: i64,
    #[serde(default)]
    pub image_tokens: i64,
    #[serde(default)]
    pub audio_tokens: i64,
}

/// 一次调用的用量记录。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

impl Usage {
    pub fn new(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            prompt_tokens_details: None,
        }
    }

    pub fn details(&self) -> PromptTokensDetails {
        self.prompt_tokens_details.clone().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens + self.completion_tokens == 0
    }
}

/// 解析并校验入站请求体。`path_model` 来自 `/v1/engines/:model/embeddings`。
pub fn parse_request(
    mode: RelayMode,
    body: &[u8],
    path_model: Option<&str>,
) -> Result<GeneralRequest, RelayError> {
    let mut request: GeneralRequest = serde_json::from_slice(body)
        .map_err(|err| RelayError::new(ErrorCode::InvalidRequest, format!("invalid request body: {err}")))?;
    normalize_request(mode, &mut request, path_model)?;
    Ok(request)
}

pub fn normalize_request(
    mode: RelayMode,
    request: &mut GeneralRequest,
    path_model: Option<&str>,
) -> Result<(), RelayError> {
    let invalid = |message: &str| RelayError::new(ErrorCode::InvalidRequest, message);

    if request.model.is_empty() {
        match mode {
            RelayMode::Moderations => request.model = DEFAULT_MODERATION_REQUEST_MODEL.to_string(),
            RelayMode::Embeddings => {
                request.model = path_model.unwrap_or_default().to_string();
            }
            _ => {}
        }
    }
    if request.max_output_tokens() > i64::from(i32::MAX / 2) {
        return Err(invalid("max_tokens is invalid"));
    }
    if request.model.is_empty() {
        return Err(invalid("model is required"));
    }
    if let Some(options) = request.web_search_options.as_mut() {
        match options.search_context_size.as_str() {
            "" => options.search_context_size = "medium".to_string(),
            "high" | "medium" | "low" => {}
            _ => {
                return Err(invalid(
                    "invalid search_context_size, must be one of: high, medium, low",
                ));
            }
        }
    }

    match mode {
        RelayMode::Completions if is_blank(request.prompt.as_ref()) => {
            return Err(invalid("field prompt is required"));
        }
        RelayMode::ChatCompletions if request.messages.is_empty() => {
            return Err(invalid("field messages is required"));
        }
        RelayMode::Moderations if is_blank(request.input.as_ref()) => {
            return Err(invalid("field input is required"));
        }
        RelayMode::Edits
            if request
                .instruction
                .as_deref()
                .is_none_or(str::is_empty) =>
        {
            return Err(invalid("field instruction is required"));
        }
        _ => {}
    }

    if let Some(model) = request.model.strip_suffix(NO_STREAM_SUFFIX) {
        request.model = model.to_string();
        request.stream = false;
    }
    Ok(())
}

/// 估算文本 token：ASCII 约 4 字符一个 token，非 ASCII 字符各算一个。
pub fn count_text_tokens(text: &str) -> i64 {
    let (ascii, other) = text.chars().fold((0i64, 0i64), |(ascii, other), ch| {
        if ch.is_ascii() {
            (ascii + 1, other)
        } else {
            (ascii, other + 1)
        }
    });
    (ascii + 3) / 4 + other
}

pub fn count_input_tokens(value: &Value) -> i64 {
    match value {
        Value::String(text) => count_text_tokens(text),
        Value::Array(items) => items.iter().map(count_input_tokens).sum(),
        Value::Null => 0,
        other => count_text_tokens(&other.to_string()),
    }
}

pub fn count_message_tokens(messages: &[Message]) -> i64 {
    let mut total = 0;
    for message in messages {
        total += TOKENS_PER_MESSAGE;
        total += count_text_tokens(&message.role);
        total += count_text_tokens(&message.text_content());
        total += TOKENS_PER_IMAGE * message.image_parts() as i64;
        if let Some(name) = message.name.as_deref() {
            total += count_text_tokens(name) + TOKENS_PER_NAME;
        }
    }
    total + REPLY_PRIMING_TOKENS
}

/// 按中继模式计算 prompt token 数。
pub fn count_prompt_tokens(mode: RelayMode, request: &GeneralRequest) -> i64 {
    match mode {
        RelayMode::ChatCompletions => count_message_tokens(&request.messages),
        RelayMode::Completions => request.prompt.as_ref().map(count_input_tokens).unwrap_or(0),
        RelayMode::Embeddings | RelayMode::Moderations => {
            request.input.as_ref().map(count_input_tokens).unwrap_or(0)
        }
        RelayMode::Edits => {
            count_text_tokens(request.instruction.as_deref().unwrap_or_default())
                + request.input.as_ref().map(count_input_tokens).unwrap_or(0)
        }
    }
}
