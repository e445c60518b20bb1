//! 上游供应商适配器：统一请求 → 供应商请求 → HTTP 调用 → 统一响应与用量。

mod claude;
mod openai;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub use claude::ClaudeAdaptor;
pub use openai::OpenAiAdaptor;

use crate::error::{ErrorCode, RelayError};
use crate::relay::RelayInfo;
use crate::request::{GeneralRequest, Usage, count_text_tokens};

const STREAM_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum AdaptorError {
    #[error("failed to convert request: {0}")]
    Convert(String),
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed to build upstream url: {0}")]
    Url(#[from] url::ParseError),
}

impl From<AdaptorError> for RelayError {
    fn from(err: AdaptorError) -> Self {
        match err {
            AdaptorError::Convert(_) => RelayError::new(ErrorCode::ConvertRequestFailed, err.to_string()),
            AdaptorError::Url(_) => RelayError::new(ErrorCode::ConvertRequestFailed, err.to_string()),
            AdaptorError::Request(_) => RelayError::new(ErrorCode::DoRequestFailed, err.to_string()),
        }
    }
}

/// 响应中解析出的计量信息。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseMeta {
    pub usage: Usage,
    pub claude_web_search_requests: i64,
    pub web_search_calls: i64,
    pub file_search_calls: i64,
}

/// 回给客户端的响应体。
#[derive(Debug)]
pub enum RelayBody {
    Full(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

/// 计量信息：非流式立即可得，流式要等上游读完。
#[derive(Debug)]
pub enum MetaReport {
    Ready(ResponseMeta),
    Pending(oneshot::Receiver<ResponseMeta>),
}

impl MetaReport {
    pub async fn resolve(self) -> Option<ResponseMeta> {
        match self {
            MetaReport::Ready(meta) => Some(meta),
            MetaReport::Pending(receiver) => receiver.await.ok(),
        }
    }
}

#[derive(Debug)]
pub struct AdaptorOutput {
    pub content_type: &'static str,
    pub body: RelayBody,
    pub meta: MetaReport,
}

/// 供应商适配器约定。
#[async_trait]
pub trait Adaptor: Send + Sync {
    fn init(&mut self, info: &RelayInfo);
    fn convert_request(
        &self,
        info: &RelayInfo,
        request: &GeneralRequest,
    ) -> Result<Value, AdaptorError>;
    async fn do_request(
        &self,
        info: &RelayInfo,
        body: Bytes,
    ) -> Result<reqwest::Response, AdaptorError>;
    async fn do_response(
        &self,
        info: &RelayInfo,
        response: reqwest::Response,
    ) -> Result<AdaptorOutput, RelayError>;
}

/// 按渠道 api_type 选择适配器；未知类型返回 `None`。
pub fn get_adaptor(api_type: &str, client: Client) -> Option<Box<dyn Adaptor>> {
    match api_type.trim().to_ascii_lowercase().as_str() {
        "openai" | "openai-compatible" | "custom" => Some(Box::new(OpenAiAdaptor::new(client))),
        "claude" | "anthropic" => Some(Box::new(ClaudeAdaptor::new(client))),
        _ => None,
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> Result<url::Url, url::ParseError> {
    url::Url::parse(&format!("{}{}", base.trim_end_matches('/'), path))
}

/// 将上游非 200 响应翻译为 `RelayError`，尽量取出上游错误信息。
pub async fn error_from_response(response: reqwest::Response) -> RelayError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                format!("bad response status code {}", status.as_u16())
            } else {
                body.trim().to_string()
            }
        });
    let status = if status.is_success() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        status
    };
    RelayError::upstream(status, message)
}

/// 增量 SSE 解析：按空行切分事件，拼接 `data:` 行。
#[derive(Debug, Default)]
pub(crate) struct SseBuffer {
    pending: Vec<u8>,
}

impl SseBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));
        let mut events = Vec::new();
        while let Some(pos) = self.pending.windows(2).position(|window| window == b"\n\n") {
            let raw: Vec<u8> = self.pending.drain(..pos + 2).collect();
            if let Some(data) = event_data(&raw) {
                events.push(data);
            }
        }
        events
    }

    pub(crate) fn finish(&mut self) -> Vec<String> {
        let raw = std::mem::take(&mut self.pending);
        event_data(&raw).into_iter().collect()
    }
}

fn event_data(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let mut current = String::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(rest.trim_start());
        }
    }
    (!current.is_empty()).then_some(current)
}

pub(crate) fn sse_frame(payload: &str) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

/// 流式响应的逐事件处理器。
pub(crate) trait StreamHandler: Send + 'static {
    /// 处理一条 `data:` 负载，返回要转发给客户端的帧。
    fn on_event(&mut self, data: &str) -> Vec<Bytes>;
    /// 上游读完后调用，返回收尾帧与计量信息。
    fn finish(&mut self) -> (Vec<Bytes>, ResponseMeta);
}

/// 在后台任务中读完上游流：边读边转发，读完后报告用量。
/// 客户端提前断开时继续读完上游，以便结算。
pub(crate) fn spawn_stream<H: StreamHandler>(
    response: reqwest::Response,
    mut handler: H,
) -> (mpsc::Receiver<Bytes>, oneshot::Receiver<ResponseMeta>) {
    let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);
    let (meta_tx, meta_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut upstream = response.bytes_stream();
        let mut buffer = SseBuffer::default();
        let mut client_open = true;

        while let Some(chunk) = upstream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::warn!(error = %err, "upstream stream interrupted");
                    break;
                }
            };
            for data in buffer.push(&chunk) {
                for frame in handler.on_event(&data) {
                    if client_open && frames_tx.send(frame).await.is_err() {
                        tracing::debug!("client disconnected, draining upstream for billing");
                        client_open = false;
                    }
                }
            }
        }
        for data in buffer.finish() {
            for frame in handler.on_event(&data) {
                if client_open && frames_tx.send(frame).await.is_err() {
                    client_open = false;
                }
            }
        }

        let (tail, meta) = handler.finish();
        for frame in tail {
            if client_open && frames_tx.send(frame).await.is_err() {
                client_open = false;
            }
        }
        let _ = meta_tx.send(meta);
    });

    (frames_rx, meta_rx)
}

/// 上游未返回用量时按补全文本估算。
pub(crate) fn estimated_usage(prompt_tokens: i64, completion_text: &str) -> Usage {
    Usage::new(prompt_tokens, count_text_tokens(completion_text))
}
