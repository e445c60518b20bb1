use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use axum::response::IntoResponse;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::{ConnectInfo, DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, HeaderName, Response, StatusCode},
    response::Json,
    routing::{get, post},
};
use quota_relay::adapter::RelayBody;
use quota_relay::store::{ConsumeLog, NewToken};
use quota_relay::token::{NEVER_EXPIRES, TokenStatus};
use quota_relay::{ErrorCode, RelayError, RelayGateway, RelayMode, StoreError, Token};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

const BODY_LIMIT: usize = 16 * 1024 * 1024; // 16 MiB 默认限制
const DEFAULT_LOG_LIMIT: usize = 50;
const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Clone)]
struct AppState {
    gateway: RelayGateway,
    forward_auth: ForwardAuthConfig,
}

/// 管理接口的身份来自前置代理注入的用户头。
#[derive(Clone, Debug)]
pub struct ForwardAuthConfig {
    user_header: HeaderName,
}

impl ForwardAuthConfig {
    pub fn new(user_header: HeaderName) -> Self {
        Self { user_header }
    }

    fn user_id(&self, headers: &HeaderMap) -> Option<i64> {
        headers
            .get(&self.user_header)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
    }
}

async fn health_check() -> &'static str {
    "ok"
}

pub fn build_router(gateway: RelayGateway, forward_auth: ForwardAuthConfig) -> Router {
    let state = Arc::new(AppState {
        gateway,
        forward_auth,
    });

    Router::new()
        .route("/health", get(health_check))
        .route("/v1/chat/completions", post(relay_chat))
        .route("/v1/completions", post(relay_completions))
        .route("/v1/embeddings", post(relay_embeddings))
        .route("/v1/engines/:model/embeddings", post(relay_engine_embeddings))
        .route("/v1/moderations", post(relay_moderations))
        .route("/v1/edits", post(relay_edits))
        // Token management (forward-auth user)
        .route(
            "/api/token",
            get(list_tokens).post(create_tokens).put(update_token),
        )
        .route("/api/token/status", get(token_status))
        .route("/api/token/batch", post(batch_delete_tokens))
        .route("/api/token/:id", get(get_token).delete(delete_token))
        .route("/api/token/:id/key", get(get_token_key))
        .route("/api/log/consume", get(list_consume_logs))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    gateway: RelayGateway,
    forward_auth: ForwardAuthConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let background = gateway.spawn_background();
    let router = build_router(gateway.clone(), forward_auth);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    tracing::info!(%bound_addr, "quota relay listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    for handle in background {
        handle.abort();
    }
    gateway.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

// ----- Error rendering -----

fn error_response(err: &RelayError) -> Response<Body> {
    let body = json!({
        "error": {
            "message": err.message,
            "type": err.error_type(),
            "code": err.code.as_str(),
        }
    });
    (err.status, Json(body)).into_response()
}

fn store_failure(context: &str, err: StoreError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        StoreError::NotFound => StatusCode::NOT_FOUND,
        StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
        _ => {
            tracing::error!(error = %err, "{context} failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "message": err.to_string() })))
}

fn forbidden() -> (StatusCode, Json<Value>) {
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "message": "missing or invalid user identity" })),
    )
}

// ----- Relay handlers -----

fn bearer_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .and_then(|raw| raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

/// 校验令牌并执行准入检查（IP 白名单）。
async fn admit(
    state: &AppState,
    headers: &HeaderMap,
    client: Option<SocketAddr>,
) -> Result<Token, RelayError> {
    let Some(key) = bearer_key(headers) else {
        return Err(RelayError::new(
            ErrorCode::Unauthorized,
            "no token provided in the Authorization header",
        ));
    };
    let token = state.gateway.authenticate(&key).await?;

    let allowed = token.allowed_ips();
    if !allowed.is_empty() && !client.is_some_and(|addr| allowed.contains(&addr.ip())) {
        tracing::warn!(token_id = token.id, client = ?client, "client ip not in allow list");
        return Err(RelayError::new(
            ErrorCode::AccessDenied,
            "this token is not allowed to be used from this ip address",
        ));
    }
    Ok(token)
}

async fn relay_with_mode(
    state: Arc<AppState>,
    mode: RelayMode,
    client: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
    path_model: Option<String>,
) -> Response<Body> {
    let client = client.map(|ConnectInfo(addr)| addr);
    let token = match admit(&state, &headers, client).await {
        Ok(token) => token,
        Err(err) => return error_response(&err),
    };

    match state
        .gateway
        .relay()
        .relay(mode, &token, body, path_model.as_deref())
        .await
    {
        Ok(response) => relay_response(response.content_type, response.body),
        Err(err) => error_response(&err),
    }
}

fn relay_response(content_type: &'static str, body: RelayBody) -> Response<Body> {
    let response = match body {
        RelayBody::Full(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type)
            .body(Body::from(bytes)),
        RelayBody::Stream(mut frames) => {
            let stream = async_stream::stream! {
                while let Some(frame) = frames.recv().await {
                    yield Ok::<_, Infallible>(frame);
                }
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, content_type)
                .header(CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(stream))
        }
    };
    response.unwrap_or_else(|err| {
        error_response(&RelayError::new(
            ErrorCode::BadResponseBody,
            format!("failed to build response: {err}"),
        ))
    })
}

async fn relay_chat(
    State(state): State<Arc<AppState>>,
    client: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    relay_with_mode(state, RelayMode::ChatCompletions, client, headers, body, None).await
}

async fn relay_completions(
    State(state): State<Arc<AppState>>,
    client: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    relay_with_mode(state, RelayMode::Completions, client, headers, body, None).await
}

async fn relay_embeddings(
    State(state): State<Arc<AppState>>,
    client: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    relay_with_mode(state, RelayMode::Embeddings, client, headers, body, None).await
}

async fn relay_engine_embeddings(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
    client: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    relay_with_mode(state, RelayMode::Embeddings, client, headers, body, Some(model)).await
}

async fn relay_moderations(
    State(state): State<Arc<AppState>>,
    client: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    relay_with_mode(state, RelayMode::Moderations, client, headers, body, None).await
}

async fn relay_edits(
    State(state): State<Arc<AppState>>,
    client: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    relay_with_mode(state, RelayMode::Edits, client, headers, body, None).await
}

// ----- Token management handlers -----

/// 对外展示的令牌：密钥打码。
fn token_view(mut token: Token) -> Token {
    token.key = token.masked_key();
    token
}

#[derive(Debug, Serialize)]
struct TokenPage {
    items: Vec<Token>,
    total: i64,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    p: Option<usize>,
    size: Option<usize>,
}

async fn list_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<Json<TokenPage>, (StatusCode, Json<Value>)> {
    let user_id = state.forward_auth.user_id(&headers).ok_or_else(forbidden)?;
    let size = page.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 100);
    let offset = page.p.unwrap_or(0) * size;
    let store = state.gateway.store();
    let items = store
        .list_user_tokens(user_id, offset as i64, size as i64)
        .await
        .map_err(|err| store_failure("list tokens", err))?;
    let total = store
        .count_user_tokens(user_id)
        .await
        .map_err(|err| store_failure("count tokens", err))?;
    Ok(Json(TokenPage {
        items: items.into_iter().map(token_view).collect(),
        total,
    }))
}

#[derive(Debug, Deserialize)]
struct CreateQuery {
    count: Option<usize>,
}

#[derive(Debug, Serialize)]
struct TokenSecretView {
    id: i64,
    name: String,
    key: String,
}

async fn create_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CreateQuery>,
    Json(payload): Json<NewToken>,
) -> Result<(StatusCode, Json<Vec<TokenSecretView>>), (StatusCode, Json<Value>)> {
    let user_id = state.forward_auth.user_id(&headers).ok_or_else(forbidden)?;
    let count = query.count.unwrap_or(1).clamp(1, 100);
    state
        .gateway
        .store()
        .issue_tokens(user_id, payload, count)
        .await
        .map(|tokens| {
            let secrets = tokens
                .into_iter()
                .map(|token| TokenSecretView {
                    id: token.id,
                    name: token.name,
                    key: format!("sk-{}", token.key),
                })
                .collect();
            (StatusCode::CREATED, Json(secrets))
        })
        .map_err(|err| store_failure("create token", err))
}

#[derive(Debug, Deserialize)]
struct UpdateQuery {
    #[serde(default)]
    status_only: bool,
}

#[derive(Debug, Deserialize)]
struct UpdateTokenRequest {
    id: i64,
    #[serde(default)]
    status: Option<i64>,
    #[serde(flatten)]
    edit: NewToken,
}

async fn update_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<UpdateQuery>,
    Json(payload): Json<UpdateTokenRequest>,
) -> Result<Json<Token>, (StatusCode, Json<Value>)> {
    let user_id = state.forward_auth.user_id(&headers).ok_or_else(forbidden)?;
    state
        .gateway
        .store()
        .apply_token_edit(
            user_id,
            payload.id,
            payload.edit,
            payload.status.map(TokenStatus::from),
            query.status_only,
        )
        .await
        .map(|token| Json(token_view(token)))
        .map_err(|err| store_failure("update token", err))
}

async fn get_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Token>, (StatusCode, Json<Value>)> {
    let user_id = state.forward_auth.user_id(&headers).ok_or_else(forbidden)?;
    state
        .gateway
        .store()
        .get_token_by_ids(id, user_id)
        .await
        .map(|token| Json(token_view(token)))
        .map_err(|err| store_failure("get token", err))
}

async fn get_token_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let user_id = state.forward_auth.user_id(&headers).ok_or_else(forbidden)?;
    state
        .gateway
        .store()
        .get_token_by_ids(id, user_id)
        .await
        .map(|token| Json(json!({ "key": format!("sk-{}", token.key) })))
        .map_err(|err| store_failure("get token key", err))
}

async fn delete_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    let user_id = state.forward_auth.user_id(&headers).ok_or_else(forbidden)?;
    state
        .gateway
        .store()
        .delete_token_by_id(id, user_id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|err| store_failure("delete token", err))
}

#[derive(Debug, Deserialize)]
struct BatchDeleteRequest {
    ids: Vec<i64>,
}

async fn batch_delete_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<BatchDeleteRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let user_id = state.forward_auth.user_id(&headers).ok_or_else(forbidden)?;
    state
        .gateway
        .store()
        .batch_delete_tokens(&payload.ids, user_id)
        .await
        .map(|deleted| Json(json!({ "deleted": deleted })))
        .map_err(|err| store_failure("batch delete tokens", err))
}

/// 兼容 OpenAI 旧版 billing 接口的令牌余额视图。
async fn token_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response<Body> {
    let Some(key) = bearer_key(&headers) else {
        return error_response(&RelayError::new(
            ErrorCode::Unauthorized,
            "no token provided in the Authorization header",
        ));
    };
    let token = match state.gateway.authenticate(&key).await {
        Ok(token) => token,
        Err(err) => return error_response(&RelayError::from(err)),
    };
    let expires_at = if token.expired_time == NEVER_EXPIRES {
        0
    } else {
        token.expired_time * 1000
    };
    Json(json!({
        "object": "credit_summary",
        "total_granted": token.remain_quota,
        "total_used": 0,
        "total_available": token.remain_quota,
        "expires_at": expires_at,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn list_consume_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<LogsQuery>,
) -> Result<Json<Vec<ConsumeLog>>, (StatusCode, Json<Value>)> {
    let user_id = state.forward_auth.user_id(&headers).ok_or_else(forbidden)?;
    let limit = params.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, 500);
    state
        .gateway
        .store()
        .recent_consume_logs(Some(user_id), limit)
        .await
        .map(Json)
        .map_err(|err| store_failure("list consume logs", err))
}
