use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;

use super::{
    Adaptor, AdaptorError, AdaptorOutput, MetaReport, RelayBody, ResponseMeta, StreamHandler,
    estimated_usage, join_url, spawn_stream, sse_frame,
};
use crate::error::{ErrorCode, RelayError};
use crate::relay::RelayInfo;
use crate::request::{GeneralRequest, Usage};

/// OpenAI 兼容上游：统一请求即原生请求。
#[derive(Debug, Clone)]
pub struct OpenAiAdaptor {
    client: Client,
    request_path: &'static str,
}

impl OpenAiAdaptor {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            request_path: "/v1/chat/completions",
        }
    }
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn init(&mut self, info: &RelayInfo) {
        self.request_path = info.mode.upstream_path();
    }

    fn convert_request(
        &self,
        info: &RelayInfo,
        request: &GeneralRequest,
    ) -> Result<Value, AdaptorError> {
        let mut value =
            serde_json::to_value(request).map_err(|err| AdaptorError::Convert(err.to_string()))?;
        let Some(object) = value.as_object_mut() else {
            return Err(AdaptorError::Convert("request is not a json object".into()));
        };
        object.insert(
            "model".into(),
            Value::String(info.upstream_model_name.clone()),
        );
        Ok(value)
    }

    async fn do_request(
        &self,
        info: &RelayInfo,
        body: Bytes,
    ) -> Result<reqwest::Response, AdaptorError> {
        let url = join_url(&info.base_url, self.request_path)?;
        let accept = if info.is_stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        let response = self
            .client
            .post(url)
            .bearer_auth(&info.api_key)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, accept)
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
            let handler = OpenAiStream {
                include_usage: info.should_include_usage,
                prompt_tokens: info.prompt_tokens,
                text: String::new(),
                usage: None,
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
        let value: Value = serde_json::from_slice(&body).map_err(|err| {
            RelayError::new(ErrorCode::BadResponseBody, format!("unmarshal response body failed: {err}"))
        })?;
        let meta = response_meta(&value, info.prompt_tokens);
        Ok(AdaptorOutput {
            content_type: "application/json",
            body: RelayBody::Full(body),
            meta: MetaReport::Ready(meta),
        })
    }
}

fn parse_usage(value: &Value) -> Option<Usage> {
    let usage = value.get("usage").filter(|usage| !usage.is_null())?;
    serde_json::from_value::<Usage>(usage.clone())
        .ok()
        .filter(|usage| !usage.is_empty())
}

fn choice_text(value: &Value) -> String {
    let Some(choices) = value.get("choices").and_then(Value::as_array) else {
        return String::new();
    };
    choices
        .iter()
        .filter_map(|choice| {
            choice
                .pointer("/message/content")
                .or_else(|| choice.pointer("/delta/content"))
                .or_else(|| choice.get("text"))
                .and_then(Value::as_str)
        })
        .collect()
}

fn response_meta(value: &Value, prompt_tokens: i64) -> ResponseMeta {
    let usage = parse_usage(value).unwrap_or_else(|| estimated_usage(prompt_tokens, &choice_text(value)));
    let mut meta = ResponseMeta {
        usage,
        ..ResponseMeta::default()
    };
    // Responses 风格的输出项里记录了内置工具调用。
    if let Some(items) = value.get("output").and_then(Value::as_array) {
        for item in items {
            match item.get("type").and_then(Value::as_str) {
                Some("web_search_call") => meta.web_search_calls += 1,
                Some("file_search_call") => meta.file_search_calls += 1,
                _ => {}
            }
        }
    }
    meta
}

struct OpenAiStream {
    include_usage: bool,
    prompt_tokens: i64,
    text: String,
    usage: Option<Usage>,
}

impl StreamHandler for OpenAiStream {
    fn on_event(&mut self, data: &str) -> Vec<Bytes> {
        if data == "[DONE]" {
            return vec![sse_frame(data)];
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return vec![sse_frame(data)];
        };
        self.text.push_str(&choice_text(&value));
        if let Some(usage) = parse_usage(&value) {
            self.usage = Some(usage);
            let no_choices = value
                .get("choices")
                .and_then(Value::as_array)
                .is_none_or(|choices| choices.is_empty());
            // 强制开启的用量块，客户端没要就不转发。
            if no_choices && !self.include_usage {
                return Vec::new();
            }
        }
        vec![sse_frame(data)]
    }

    fn finish(&mut self) -> (Vec<Bytes>, ResponseMeta) {
        let usage = self
            .usage
            .take()
            .unwrap_or_else(|| estimated_usage(self.prompt_tokens, &self.text));
        (
            Vec::new(),
            ResponseMeta {
                usage,
                ..ResponseMeta::default()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn usage_is_read_or_estimated() {
        let with_usage = json!({
            "choices": [{"message": {"content": "hello"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12,
                      "prompt_tokens_details": {"cached_tokens": 4}}
        });
        let meta = response_meta(&with_usage, 99);
        assert_eq!(meta.usage.prompt_tokens, 10);
        assert_eq!(meta.usage.details().cached_tokens, 4);

        let without = json!({"choices": [{"message": {"content": "abcdabcd"}}]});
        let meta = response_meta(&without, 7);
        assert_eq!(meta.usage, Usage::new(7, 2));
    }

    #[test]
    fn responses_output_counts_tool_calls() {
        let value = json!({
            "output": [
                {"type": "web_search_call"},
                {"type": "web_search_call"},
                {"type": "file_search_call"},
                {"type": "message"}
            ],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        });
        let meta = response_meta(&value, 0);
        assert_eq!(meta.web_search_calls, 2);
        assert_eq!(meta.file_search_calls, 1);
    }

    #[test]
    fn forced_usage_chunk_is_hidden_unless_requested() {
        let mut stream = OpenAiStream {
            include_usage: false,
            prompt_tokens: 5,
            text: String::new(),
            usage: None,
        };
        let chunk = json!({"choices": [{"delta": {"content": "hi"}}]}).to_string();
        assert_eq!(stream.on_event(&chunk).len(), 1);
        let usage_chunk = json!({
            "choices": [],
            "usage": {"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6}
        })
        .to_string();
        assert!(stream.on_event(&usage_chunk).is_empty());
        assert_eq!(stream.on_event("[DONE]").len(), 1);
        let (_, meta) = stream.finish();
        assert_eq!(meta.usage, Usage::new(5, 1));
    }

    #[test]
    fn stream_without_usage_falls_back_to_estimate() {
        let mut stream = OpenAiStream {
            include_usage: true,
            prompt_tokens: 3,
            text: String::new(),
            usage: None,
        };
        stream.on_event(&json!({"choices": [{"delta": {"content": "abcd"}}]}).to_string());
        stream.on_event(&json!({"choices": [{"delta": {"content": "efgh"}}]}).to_string());
        let (_, meta) = stream.finish();
        assert_eq!(meta.usage, Usage::new(3, 2));
    }
}
