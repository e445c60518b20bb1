use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{
    Adaptor, AdaptorError, AdaptorOutput, MetaReport, RelayBody, ResponseMeta, StreamHandler,
    join_url, spawn_stream, sse_frame,
};
use crate::error::{ErrorCode, RelayError};
use crate::relay::RelayInfo;
use crate::request::{GeneralRequest, Message, PromptTokensDetails, RelayMode, Usage, count_text_tokens};

const MESSAGES_PATH: &str = "/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: i64 = 4096;

/// Anthropic Messages API。
#[derive(Debug, Clone)]
pub struct ClaudeAdaptor {
    client: Client,
}

impl ClaudeAdaptor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
struct ServerToolUse {
    #[serde(default)]
    web_search_requests: i64,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct ClaudeUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    cache_read_input_tokens: i64,
    #[serde(default)]
    cache_creation_input_tokens: i64,
    #[serde(default)]
    server_tool_use: Option<ServerToolUse>,
}

impl ClaudeUsage {
    fn to_usage(&self) -> Usage {
        let prompt = self.input_tokens + self.cache_read_input_tokens + self.cache_creation_input_tokens;
        Usage {
            prompt_tokens: prompt,
            completion_tokens: self.output_tokens,
            total_tokens: prompt + self.output_tokens,
            prompt_tokens_details: (self.cache_read_input_tokens > 0).then(|| PromptTokensDetails {
                cached_tokens: self.cache_read_input_tokens,
                ..PromptTokensDetails::default()
            }),
        }
    }

    fn web_search_requests(&self) -> i64 {
        self.server_tool_use
            .as_ref()
            .map(|tool| tool.web_search_requests)
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ClaudeMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: ClaudeUsage,
}

fn finish_reason(stop_reason: Option<&str>) -> Option<&'static str> {
    stop_reason.map(|reason| match reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => "stop",
    })
}

fn content_blocks(message: &Message) -> Value {
    let Value::Array(parts) = &message.content else {
        return Value::String(message.text_content());
    };
    let blocks: Vec<Value> = parts
        .iter()
        .filter_map(|part| match part.get("type").and_then(Value::as_str) {
            Some("text") => Some(json!({"type": "text", "text": part.get("text").cloned().unwrap_or_default()})),
            Some("image_url") => {
                let url = part
                    .pointer("/image_url/url")
                    .or_else(|| part.get("image_url"))
                    .and_then(Value::as_str)?;
                Some(image_block(url))
            }
            _ => None,
        })
        .collect();
    Value::Array(blocks)
}

fn image_block(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:")
        && let Some((meta, data)) = rest.split_once(',')
    {
        let media_type = meta.trim_end_matches(";base64");
        return json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data}
        });
    }
    json!({"type": "image", "source": {"type": "url", "url": url}})
}

/// 统一请求转 Messages 请求：抽出 system，相邻同角色的纯文本消息合并。
fn to_claude_request(info: &RelayInfo, request: &GeneralRequest) -> Result<Value, AdaptorError> {
    let mut system: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    let prompt_message;
    let source: &[Message] = match info.mode {
        RelayMode::ChatCompletions => &request.messages,
        RelayMode::Completions => {
            let text = match request.prompt.as_ref() {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            prompt_message = [Message::text("user", &text)];
            &prompt_message
        }
        other => {
            return Err(AdaptorError::Convert(format!(
                "relay mode {} is not supported by claude",
                other.as_str()
            )));
        }
    };

    for message in source {
        if message.role == "system" {
            system.push(message.text_content());
            continue;
        }
        let role = if message.role == "assistant" { "assistant" } else { "user" };
        let content = content_blocks(message);
        if let Some(last) = messages.last_mut()
            && last["role"] == role
            && let (Some(previous), Some(current)) = (last["content"].as_str(), content.as_str())
        {
            let merged = format!("{previous}\n\n{current}");
            last["content"] = Value::String(merged);
            continue;
        }
        messages.push(json!({"role": role, "content": content}));
    }

    let max_tokens = match request.max_output_tokens() {
        0 => DEFAULT_MAX_TOKENS,
        value => value,
    };
    let mut body = Map::new();
    body.insert("model".into(), Value::String(info.upstream_model_name.clone()));
    body.insert("messages".into(), Value::Array(messages));
    body.insert("max_tokens".into(), json!(max_tokens));
    if !system.is_empty() {
        body.insert("system".into(), Value::String(system.join("\n")));
    }
    if info.is_stream {
        body.insert("stream".into(), Value::Bool(true));
    }
    for key in ["temperature", "top_p", "top_k", "metadata"] {
        if let Some(value) = request.extra.get(key) {
            body.insert(key.into(), value.clone());
        }
    }
    match request.extra.get("stop") {
        Some(Value::String(stop)) => {
            body.insert("stop_sequences".into(), json!([stop]));
        }
        Some(Value::Array(stops)) => {
            body.insert("stop_sequences".into(), Value::Array(stops.clone()));
        }
        _ => {}
    }
    Ok(Value::Object(body))
}

fn to_chat_completion(message: &ClaudeMessage, model: &str) -> Value {
    let text: String = message
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .map(|block| block.text.as_str())
        .collect();
    json!({
        "id": message.id,
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": if message.model.is_empty() { model } else { message.model.as_str() },
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": finish_reason(message.stop_reason.as_deref()),
        }],
        "usage": message.usage.to_usage(),
    })
}

#[async_trait]
impl Adaptor for ClaudeAdaptor {
    fn init(&mut self, _info: &RelayInfo) {}

    fn convert_request(
        &self,
        info: &RelayInfo,
        request: &GeneralRequest,
    ) -> Result<Value, AdaptorError> {
        to_claude_request(info, request)
    }

    async fn do_request(
        &self,
        info: &RelayInfo,
        body: Bytes,
    ) -> Result<reqwest::Response, AdaptorError> {
        let url = join_url(&info.base_url, MESSAGES_PATH)?;
        let response = self
            .client
            .post(url)
            .header("x-api-key", &info.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        Ok(response)
    }

    async fn do_response(
        &self,
        info: &RelayInfo,
        response: reqwest::Response,
    ) -> Result<AdaptorOutput, RelayError> {
        if info.is_stream {
            let handler = ClaudeStream {
                id: String::new(),
                model: info.upstream_model_name.clone(),
                created: Utc::now().timestamp(),
                include_usage: info.should_include_usage,
                prompt_tokens: info.prompt_tokens,
                usage: ClaudeUsage::default(),
                saw_usage: false,
                text: String::new(),
            };
            let (frames, meta) = spawn_stream(response, handler);
            return Ok(AdaptorOutput {
                content_type: "text/event-stream",
                body: RelayBody::Stream(frames),
                meta: MetaReport::Pending(meta),
            });
        }

        let body = response.bytes().await.map_err(|err| {
            RelayError::new(ErrorCode::ReadRequestBodyFailed, format!("read response body failed: {err}"))
        })?;
        let message: ClaudeMessage = serde_json::from_slice(&body).map_err(|err| {
            RelayError::new(ErrorCode::BadResponseBody, format!("unmarshal response body failed: {err}"))
        })?;
        let converted = to_chat_completion(&message, &info.upstream_model_name);
        let meta = ResponseMeta {
            usage: message.usage.to_usage(),
            claude_web_search_requests: message.usage.web_search_requests(),
            ..ResponseMeta::default()
        };
        let body = serde_json::to_vec(&converted)
            .map_err(|err| RelayError::new(ErrorCode::BadResponseBody, err.to_string()))?;
        Ok(AdaptorOutput {
            content_type: "application/json",
            body: RelayBody::Full(Bytes::from(body)),
            meta: MetaReport::Ready(meta),
        })
    }
}

/// 把 Messages 流事件转成 chat.completion.chunk。
struct ClaudeStream {
    id: String,
    model: String,
    created: i64,
    include_usage: bool,
    prompt_tokens: i64,
    usage: ClaudeUsage,
    saw_usage: bool,
    text: String,
}

impl ClaudeStream {
    fn chunk(&self, delta: Value, finish: Option<&str>) -> Bytes {
        let chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
        });
        sse_frame(&chunk.to_string())
    }

    fn merge_usage(&mut self, usage: &Value) {
        let Ok(update) = serde_json::from_value::<ClaudeUsage>(usage.clone()) else {
            return;
        };
        self.saw_usage = true;
        if update.input_tokens > 0 {
            self.usage.input_tokens = update.input_tokens;
        }
        if update.cache_read_input_tokens > 0 {
            self.usage.cache_read_input_tokens = update.cache_read_input_tokens;
        }
        if update.cache_creation_input_tokens > 0 {
            self.usage.cache_creation_input_tokens = update.cache_creation_input_tokens;
        }
        if update.output_tokens > 0 {
            self.usage.output_tokens = update.output_tokens;
        }
        if update.server_tool_use.is_some() {
            self.usage.server_tool_use = update.server_tool_use;
        }
    }
}

impl StreamHandler for ClaudeStream {
    fn on_event(&mut self, data: &str) -> Vec<Bytes> {
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(id) = event.pointer("/message/id").and_then(Value::as_str) {
                    self.id = id.to_string();
                }
                if let Some(usage) = event.pointer("/message/usage") {
                    self.merge_usage(usage);
                }
                vec![self.chunk(json!({"role": "assistant", "content": ""}), None)]
            }
            Some("content_block_delta") => {
                match event.pointer("/delta/text").and_then(Value::as_str) {
                    Some(text) => {
                        self.text.push_str(text);
                        vec![self.chunk(json!({"content": text}), None)]
                    }
                    None => Vec::new(),
                }
            }
            Some("message_delta") => {
                if let Some(usage) = event.get("usage") {
                    self.merge_usage(usage);
                }
                let stop = event.pointer("/delta/stop_reason").and_then(Value::as_str);
                vec![self.chunk(json!({}), finish_reason(stop).or(Some("stop")))]
            }
            Some("error") => vec![sse_frame(data)],
            _ => Vec::new(),
        }
    }

    fn finish(&mut self) -> (Vec<Bytes>, ResponseMeta) {
        let mut usage = self.usage.to_usage();
        if !self.saw_usage {
            usage = Usage::new(self.prompt_tokens, count_text_tokens(&self.text));
        } else if usage.prompt_tokens == 0 {
            usage.prompt_tokens = self.prompt_tokens;
            usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        }

        let mut tail = Vec::new();
        if self.include_usage {
            let chunk = json!({
                "id": self.id,
                "object": "chat.completion.chunk",
                "created": self.created,
                "model": self.model,
                "choices": [],
                "usage": usage,
            });
            tail.push(sse_frame(&chunk.to_string()));
        }
        tail.push(sse_frame("[DONE]"));
        let meta = ResponseMeta {
            usage,
            claude_web_search_requests: self.usage.web_search_requests(),
            ..ResponseMeta::default()
        };
        (tail, meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::tests::relay_info;

    #[test]
    fn system_prompt_is_extracted_and_roles_merged() {
        let info = relay_info(RelayMode::ChatCompletions, "claude-3-5-sonnet");
        let request = GeneralRequest {
            model: "claude-3-5-sonnet".into(),
            messages: vec![
                Message::text("system", "be brief"),
                Message::text("user", "one"),
                Message::text("user", "two"),
                Message::text("assistant", "ok"),
            ],
            extra: Map::from_iter([("stop".to_string(), json!("END"))]),
            ..GeneralRequest::default()
        };
        let body = to_claude_request(&info, &request).unwrap();
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["messages"][0]["content"], "one\n\ntwo");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["stop_sequences"], json!(["END"]));
    }

    #[test]
    fn embeddings_are_not_supported() {
        let info = relay_info(RelayMode::Embeddings, "claude-3-5-sonnet");
        let err = to_claude_request(&info, &GeneralRequest::default()).unwrap_err();
        assert!(matches!(err, AdaptorError::Convert(_)));
    }

    #[test]
    fn response_converts_to_chat_completion_with_cache_and_search_usage() {
        let raw = json!({
            "id": "msg_1",
            "model": "claude-3-5-sonnet",
            "content": [{"type": "text", "text": "Hello"}],
            "stop_reason": "end_turn",
            "usage": {
                "input_tokens": 10,
                "output_tokens": 5,
                "cache_read_input_tokens": 20,
                "server_tool_use": {"web_search_requests": 2}
            }
        });
        let message: ClaudeMessage = serde_json::from_value(raw).unwrap();
        let converted = to_chat_completion(&message, "claude");
        assert_eq!(converted["choices"][0]["message"]["content"], "Hello");
        assert_eq!(converted["choices"][0]["finish_reason"], "stop");
        let usage = message.usage.to_usage();
        assert_eq!(usage.prompt_tokens, 30);
        assert_eq!(usage.details().cached_tokens, 20);
        assert_eq!(message.usage.web_search_requests(), 2);
    }

    #[test]
    fn stream_events_become_chunks_and_usage() {
        let mut stream = ClaudeStream {
            id: String::new(),
            model: "claude".into(),
            created: 0,
            include_usage: true,
            prompt_tokens: 99,
            usage: ClaudeUsage::default(),
            saw_usage: false,
            text: String::new(),
        };
        let events = [
            json!({"type": "message_start", "message": {"id": "msg_9", "usage": {"input_tokens": 12, "output_tokens": 1}}}),
            json!({"type": "content_block_start", "index": 0}),
            json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Hi"}}),
            json!({"type": "message_delta", "delta": {"stop_reason": "max_tokens"},
                   "usage": {"output_tokens": 7, "server_tool_use": {"web_search_requests": 1}}}),
            json!({"type": "message_stop"}),
        ];
        let frames: usize = events
            .iter()
            .map(|event| stream.on_event(&event.to_string()).len())
            .sum();
        assert_eq!(frames, 3);
        let (tail, meta) = stream.finish();
        assert_eq!(tail.len(), 2);
        assert_eq!(meta.usage, Usage::new(12, 7));
        assert_eq!(meta.claude_web_search_requests, 1);
        assert_eq!(stream.id, "msg_9");
    }
}
