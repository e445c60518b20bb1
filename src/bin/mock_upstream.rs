use axum::{
    Json, Router,
    body::Body,
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::post,
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::{net::SocketAddr, time::Duration};
use tokio::task::JoinHandle;

fn prompt_text(body: &Value) -> String {
    body.get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.last())
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn rough_tokens(text: &str) -> i64 {
    (text.len() as i64 + 3) / 4
}

async fn chat_completions(Json(body): Json<Value>) -> Response {
    let model = body["model"].as_str().unwrap_or("mock-model").to_string();
    let prompt = prompt_text(&body);
    // 以 "fail:<status>" 开头的提问返回对应的错误状态，便于演练回滚。
    if let Some(code) = prompt.strip_prefix("fail:")
        && let Ok(status) = code.trim().parse::<u16>()
    {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (
            status,
            Json(json!({"error": {"message": format!("mock failure {status}"), "type": "mock"}})),
        )
            .into_response();
    }

    let reply = format!("echo: {prompt}");
    let prompt_tokens = rough_tokens(&prompt) + 7;
    let completion_tokens = rough_tokens(&reply);
    let usage = json!({
        "prompt_tokens": prompt_tokens,
        "completion_tokens": completion_tokens,
        "total_tokens": prompt_tokens + completion_tokens,
    });

    if body["stream"].as_bool().unwrap_or(false) {
        let include_usage = body["stream_options"]["include_usage"].as_bool().unwrap_or(false);
        let mut sse = String::new();
        for word in reply.split_inclusive(' ') {
            let chunk = json!({
                "id": "chatcmpl-mock",
                "object": "chat.completion.chunk",
                "model": model,
                "choices": [{"index": 0, "delta": {"content": word}, "finish_reason": null}],
            });
            sse.push_str(&format!("data: {chunk}\n\n"));
        }
        if include_usage {
            let chunk = json!({
                "id": "chatcmpl-mock",
                "object": "chat.completion.chunk",
                "model": model,
                "choices": [],
                "usage": usage,
            });
            sse.push_str(&format!("data: {chunk}\n\n"));
        }
        sse.push_str("data: [DONE]\n\n");
        return Response::builder()
            .header(CONTENT_TYPE, "text/event-stream")
            .body(Body::from(sse))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    Json(json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": reply},
            "finish_reason": "stop",
        }],
        "usage": usage,
    }))
    .into_response()
}

async fn embeddings(Json(body): Json<Value>) -> impl IntoResponse {
    let input = body["input"].as_str().unwrap_or_default();
    let tokens = rough_tokens(input);
    Json(json!({
        "object": "list",
        "data": [{"object": "embedding", "index": 0, "embedding": [0.1, 0.2, 0.3]}],
        "usage": {"prompt_tokens": tokens, "total_tokens": tokens},
    }))
}

async fn moderations(Json(body): Json<Value>) -> impl IntoResponse {
    let input = body["input"].as_str().unwrap_or_default().to_ascii_lowercase();
    let violent = input.contains("violence");
    Json(json!({
        "id": "modr-mock",
        "model": body["model"],
        "results": [{
            "flagged": violent,
            "categories": {"violence": violent, "hate": false},
            "category_scores": {"violence": if violent { 0.93 } else { 0.01 }, "hate": 0.0},
        }],
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/moderations", post(moderations));
    let bind_addr =
        std::env::var("MOCK_UPSTREAM_ADDR").unwrap_or_else(|_| "127.0.0.1:58088".to_string());
    let addr: SocketAddr = bind_addr.parse()?;
    println!("Mock upstream on http://{addr}");

    let generator = spawn_generator();

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;

    if let Some(h) = generator {
        let _ = h.await;
    }
    Ok(())
}

/// 可选的流量发生器：向网关持续发送聊天请求。
fn spawn_generator() -> Option<JoinHandle<()>> {
    let relay_base = std::env::var("RELAY_BASE").ok()?;
    let user_header_name = std::env::var("USER_HEADER_NAME").ok();
    let user_id = std::env::var("USER_ID").ok();
    let provided_key = std::env::var("RELAY_KEY").ok();
    let model = std::env::var("GEN_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
    let interval_ms: u64 = std::env::var("GEN_INTERVAL_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5000);

    Some(tokio::spawn(async move {
        let client = Client::new();

        let mut key = provided_key;
        if key.is_none()
            && let (Some(hname), Some(uid)) = (user_header_name.as_deref(), user_id.as_deref())
        {
            match create_token(&client, &relay_base, hname, uid).await {
                Ok(k) => {
                    println!("[mock-gen] created token: {k}");
                    key = Some(k);
                }
                Err(e) => eprintln!("[mock-gen] create token failed: {e}"),
            }
        }

        let Some(key) = key else {
            eprintln!("[mock-gen] no RELAY_KEY and token creation failed; generator idle");
            return;
        };

        let prompts = ["hello there", "fail:429", "tell me a story"];
        let mut i = 0u64;
        loop {
            let prompt = prompts[(i as usize) % prompts.len()];
            let stream = i % 2 == 1;
            let url = format!("{relay_base}/v1/chat/completions");
            let payload = json!({
                "model": model,
                "stream": stream,
                "messages": [{"role": "user", "content": prompt}],
            });
            match client.post(&url).bearer_auth(&key).json(&payload).send().await {
                Ok(resp) => {
                    let sc = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    println!("[mock-gen] {prompt:?} stream={stream} -> {sc}");
                    if !sc.is_success() {
                        eprintln!("[mock-gen] response body: {body}");
                    }
                }
                Err(err) => eprintln!("[mock-gen] request error: {err}"),
            }

            i = i.wrapping_add(1);
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }))
}

#[derive(Deserialize)]
struct TokenSecret {
    key: String,
}

async fn create_token(
    client: &Client,
    base: &str,
    user_header_name: &str,
    user_id: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let url = format!("{base}/api/token");
    let resp = client
        .post(url)
        .header("content-type", "application/json")
        .header(user_header_name, user_id)
        .body(r#"{"name":"mock-gen","unlimited_quota":true}"#)
        .send()
        .await?;
    let resp = resp.error_for_status()?;
    let mut secrets: Vec<TokenSecret> = resp.json().await?;
    secrets
        .pop()
        .map(|secret| secret.key)
        .ok_or_else(|| "token creation returned nothing".into())
}
