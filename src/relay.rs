//! 中继流水线：解析校验 → 渠道策略（角色转换、外部审查）→ 敏感词 → 模型映射 →
//! 计数与定价 → 预扣费 → 适配器转发 → 结算与消费日志。任何一步失败即终止。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use rand::seq::SliceRandom;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value, json};

use crate::adapter::{
    AdaptorOutput, MetaReport, RelayBody, ResponseMeta, error_from_response, get_adaptor,
};
use crate::billing::{BillingInput, PriceData, compute_quota, resolve_price};
use crate::config::{AuditSettings, ChannelConfig, GatewayConfig};
use crate::error::{ErrorCode, RelayError, StoreError};
use crate::moderation::ModerationClient;
use crate::request::{
    BuiltInTool, GeneralRequest, RelayMode, ResponsesUsageInfo, StreamOptions, TOOL_FILE_SEARCH,
    TOOL_WEB_SEARCH_PREVIEW, count_prompt_tokens, parse_request,
};
use crate::sensitive::SensitiveFilter;
use crate::store::{ConsumeLog, QuotaLookup, ReserveError, TokenStore};
use crate::token::Token;

/// 余额超过预估的这个倍数即视为可信，跳过预扣费。
const TRUST_MULTIPLIER: i64 = 100;

/// 单次请求的中继上下文，结算后丢弃。
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub mode: RelayMode,
    pub api_type: String,
    pub user_id: i64,
    pub token_id: i64,
    pub token_key: String,
    pub token_name: String,
    pub token_unlimited: bool,
    pub group: String,
    pub channel_id: i64,
    pub base_url: String,
    pub api_key: String,
    /// 客户端请求的模型名（去掉 `-noStream` 之后）。
    pub origin_model_name: String,
    pub upstream_model_name: String,
    pub prompt_tokens: i64,
    pub is_stream: bool,
    /// 客户端自己是否要求了 usage 块。
    pub should_include_usage: bool,
    pub supports_stream_options: bool,
    pub start_time: Instant,
    pub param_override: Map<String, Value>,
    pub responses_usage_info: Option<ResponsesUsageInfo>,
    pub search_context_size: Option<String>,
}

impl RelayInfo {
    fn new(
        mode: RelayMode,
        token: &Token,
        channel: &ChannelConfig,
        request: &GeneralRequest,
        group: &str,
    ) -> Self {
        Self {
            mode,
            api_type: channel.api_type.clone(),
            user_id: token.user_id,
            token_id: token.id,
            token_key: token.key.clone(),
            token_name: token.name.clone(),
            token_unlimited: token.unlimited_quota,
            group: group.to_string(),
            channel_id: channel.id,
            base_url: channel.base_url.clone(),
            api_key: channel.key.clone(),
            origin_model_name: request.model.clone(),
            upstream_model_name: request.model.clone(),
            prompt_tokens: 0,
            is_stream: request.stream,
            should_include_usage: request
                .stream_options
                .as_ref()
                .is_some_and(|options| options.include_usage),
            supports_stream_options: channel.supports_stream_options,
            start_time: Instant::now(),
            param_override: channel.param_override.clone(),
            responses_usage_info: request.built_in_tools(),
            search_context_size: request.search_context_size().map(str::to_owned),
        }
    }
}

/// 中继成功后交给 HTTP 层的响应。
#[derive(Debug)]
pub struct RelayResponse {
    pub content_type: &'static str,
    pub body: RelayBody,
}

/// 结算所需的上下文，流式场景下会被移入后台任务。
struct Settlement {
    info: RelayInfo,
    price: PriceData,
    reserved: i64,
    channel: ChannelConfig,
}

#[derive(Clone)]
pub struct Relay {
    config: Arc<GatewayConfig>,
    store: TokenStore,
    lookup: Arc<dyn QuotaLookup>,
    client: Client,
    moderation: ModerationClient,
    sensitive: Option<Arc<SensitiveFilter>>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("channels", &self.config.channels.len())
            .field("sensitive", &self.sensitive.is_some())
            .finish()
    }
}

impl Relay {
    pub fn new(config: Arc<GatewayConfig>, store: TokenStore, client: Client) -> Self {
        let sensitive = SensitiveFilter::from_config(&config.sensitive).map(Arc::new);
        Self {
            lookup: Arc::new(store.clone()),
            moderation: ModerationClient::new(client.clone()),
            config,
            store,
            client,
            sensitive,
        }
    }

    /// 替换可信判断使用的余额来源。
    pub fn with_quota_lookup(mut self, lookup: Arc<dyn QuotaLookup>) -> Self {
        self.lookup = lookup;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// 处理一次中继请求。令牌已经由调用方校验。
    pub async fn relay(
        &self,
        mode: RelayMode,
        token: &Token,
        body: Bytes,
        path_model: Option<&str>,
    ) -> Result<RelayResponse, RelayError> {
        let mut request = parse_request(mode, &body, path_model)?;
        if !token.allows_model(&request.model) {
            return Err(RelayError::new(
                ErrorCode::AccessDenied,
                format!("this token has no access to model {}", request.model),
            ));
        }

        let group = if token.group.is_empty() {
            self.config.default_group.clone()
        } else {
            token.group.clone()
        };
        let channel = self.select_channel(&request.model, &group)?.clone();
        let mut info = RelayInfo::new(mode, token, &channel, &request, &group);

        if channel.convert_system_role {
            request.convert_system_roles();
        }
        if mode == RelayMode::ChatCompletions
            && let Some(settings) = channel.audit.as_ref().filter(|settings| settings.enabled)
        {
            self.audit(&request, settings).await?;
        }
        self.screen_sensitive(mode, &request)?;

        info.upstream_model_name = map_model(&channel.model_mapping, &request.model)?;
        request.model = info.upstream_model_name.clone();
        info.prompt_tokens = count_prompt_tokens(mode, &request);

        let price = resolve_price(
            &self.config.pricing,
            &info.origin_model_name,
            &group,
            info.prompt_tokens,
            request.max_output_tokens(),
        )?;
        let reserved = self.pre_consume(token, price.pre_consume_quota).await?;

        if info.is_stream && channel.supports_stream_options && self.config.force_stream_option {
            request.stream_options = Some(StreamOptions {
                include_usage: true,
            });
        }
        if !info.is_stream || !channel.supports_stream_options {
            request.stream_options = None;
        }

        let output = match self.dispatch(&mut info, &channel, &request, &body).await {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(
                    channel_id = channel.id,
                    model = %info.origin_model_name,
                    code = %err.code,
                    status = err.status.as_u16(),
                    error = %err.message,
                    "relay failed"
                );
                self.rollback(&info, reserved);
                return Err(err);
            }
        };

        let AdaptorOutput {
            content_type,
            body,
            meta,
        } = output;
        let settlement = Settlement {
            info,
            price,
            reserved,
            channel,
        };
        match meta {
            MetaReport::Ready(meta) => self.settle(settlement, meta).await,
            pending @ MetaReport::Pending(_) => {
                let relay = self.clone();
                tokio::spawn(async move {
                    match pending.resolve().await {
                        Some(meta) => relay.settle(settlement, meta).await,
                        None => {
                            tracing::warn!(
                                token_id = settlement.info.token_id,
                                "stream ended without usage report, rolling back reservation"
                            );
                            relay.rollback(&settlement.info, settlement.reserved);
                        }
                    }
                });
            }
        }

        Ok(RelayResponse { content_type, body })
    }

    fn select_channel(&self, model: &str, group: &str) -> Result<&ChannelConfig, RelayError> {
        let candidates: Vec<&ChannelConfig> = self
            .config
            .channels
            .iter()
            .filter(|channel| channel.serves(model, group))
            .collect();
        candidates
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or_else(|| {
                RelayError::new(
                    ErrorCode::NoAvailableChannel,
                    format!("no available channel for model {model} under group {group}"),
                )
            })
    }

    async fn audit(
        &self,
        request: &GeneralRequest,
        settings: &AuditSettings,
    ) -> Result<(), RelayError> {
        let excerpt = request.audit_excerpt();
        if excerpt.is_empty() {
            return Ok(());
        }
        match self.moderation.audit(&excerpt, settings).await {
            Ok(violations) if violations.is_empty() => Ok(()),
            Ok(violations) => {
                let listed = violations
                    .iter()
                    .enumerate()
                    .map(|(idx, violation)| format!("{}. {violation}", idx + 1))
                    .collect::<Vec<_>>()
                    .join("\n");
                Err(RelayError::new(
                    ErrorCode::ContentReviewFailed,
                    format!("content review failed, the request violates policy:\n{listed}"),
                ))
            }
            Err(err) => {
                tracing::warn!(error = %err, "content review request failed");
                Err(RelayError::new(
                    ErrorCode::ContentReviewFailed,
                    format!("content review failed: {err}"),
                ))
            }
        }
    }

    fn screen_sensitive(&self, mode: RelayMode, request: &GeneralRequest) -> Result<(), RelayError> {
        let Some(filter) = self.sensitive.as_ref() else {
            return Ok(());
        };
        let hits = filter.find(&request.screened_text(mode));
        if hits.is_empty() {
            return Ok(());
        }
        Err(RelayError::new(
            ErrorCode::SensitiveWordsDetected,
            format!("sensitive words detected: {}", hits.join(", ")),
        ))
    }

    /// 预扣费，返回实际预留的额度（可信时为 0）。
    async fn pre_consume(&self, token: &Token, estimate: i64) -> Result<i64, RelayError> {
        let user_quota = match self.lookup.user_quota(token.user_id).await {
            Ok(quota) => quota,
            Err(StoreError::NotFound) => 0,
            Err(err) => return Err(RelayError::new(ErrorCode::QueryDataError, err.to_string())),
        };
        if user_quota <= 0 || user_quota < estimate {
            return Err(RelayError::new(
                ErrorCode::InsufficientUserQuota,
                format!("user quota is not enough, remain: {user_quota}, need: {estimate}"),
            ));
        }

        let margin = estimate.saturating_mul(TRUST_MULTIPLIER);
        if user_quota > margin {
            if token.unlimited_quota {
                tracing::debug!(user_id = token.user_id, user_quota, "trusted user with unlimited token, skipping pre-consume");
                return Ok(0);
            }
            let token_quota = self
                .lookup
                .token_quota(token)
                .await
                .map_err(|err| RelayError::new(ErrorCode::QueryDataError, err.to_string()))?;
            if token_quota > margin {
                tracing::debug!(token_id = token.id, token_quota, "trusted token, skipping pre-consume");
                return Ok(0);
            }
        }

        if estimate <= 0 {
            return Ok(0);
        }
        match self.store.reserve_quota(token, estimate).await {
            Ok(()) => Ok(estimate),
            Err(err @ ReserveError::TokenQuota { .. }) => Err(RelayError::new(
                ErrorCode::PreConsumeTokenQuotaFailed,
                err.to_string(),
            )),
            Err(err) => Err(RelayError::new(ErrorCode::UpdateDataError, err.to_string())),
        }
    }

    async fn dispatch(
        &self,
        info: &mut RelayInfo,
        channel: &ChannelConfig,
        request: &GeneralRequest,
        raw: &Bytes,
    ) -> Result<AdaptorOutput, RelayError> {
        let mut adaptor = get_adaptor(&info.api_type, self.client.clone()).ok_or_else(|| {
            RelayError::new(
                ErrorCode::InvalidApiType,
                format!("invalid api type: {}", info.api_type),
            )
        })?;
        adaptor.init(info);

        let body = if self.config.pass_through_request {
            raw.clone()
        } else {
            let mut converted = adaptor.convert_request(info, request)?;
            apply_param_override(&mut converted, &info.param_override)?;
            let encoded = serde_json::to_vec(&converted)
                .map_err(|err| RelayError::new(ErrorCode::ConvertRequestFailed, err.to_string()))?;
            Bytes::from(encoded)
        };

        let response = adaptor.do_request(info, body).await?;
        if response.status() != StatusCode::OK {
            let mut err = error_from_response(response).await;
            err.remap_status(&channel.status_code_mapping);
            return Err(err);
        }
        let event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));
        if event_stream {
            info.is_stream = true;
        }

        adaptor.do_response(info, response).await.map_err(|mut err| {
            err.remap_status(&channel.status_code_mapping);
            err
        })
    }

    /// 后台返还预扣的额度。
    fn rollback(&self, info: &RelayInfo, reserved: i64) {
        if reserved == 0 {
            return;
        }
        let store = self.store.clone();
        let (token_id, user_id, key) = (info.token_id, info.user_id, info.token_key.clone());
        self.store
            .tasks()
            .spawn(format!("rollback:token:{token_id}"), async move {
                store
                    .apply_settlement_delta(token_id, &key, user_id, reserved)
                    .await
                    .map_err(|err| err.to_string())
            });
    }

    async fn settle(&self, settlement: Settlement, meta: ResponseMeta) {
        let token_id = settlement.info.token_id;
        if let Err(err) = self.post_consume(settlement, meta).await {
            tracing::error!(token_id, error = %err, "failed to settle quota");
        }
    }

    /// 按实际用量结算：补扣或返还差额，累加用量并写消费日志。
    async fn post_consume(
        &self,
        settlement: Settlement,
        meta: ResponseMeta,
    ) -> Result<ConsumeLog, StoreError> {
        let Settlement {
            info,
            price,
            reserved,
            channel,
        } = settlement;
        let tools = merge_tool_calls(info.responses_usage_info.clone(), &meta);
        let input = BillingInput {
            usage: &meta.usage,
            price: &price,
            model_name: &info.origin_model_name,
            tools: tools.as_ref(),
            search_context_size: info.search_context_size.as_deref(),
            claude_web_search_requests: meta.claude_web_search_requests,
            supplements: &channel.billing_supplement,
        };
        let breakdown = compute_quota(&self.config.pricing, &input);

        let total_tokens = meta.usage.prompt_tokens + meta.usage.completion_tokens;
        let (quota, content) = if total_tokens == 0 {
            tracing::warn!(
                token_id = info.token_id,
                channel_id = info.channel_id,
                model = %info.origin_model_name,
                reserved,
                "upstream reported zero usage, nothing charged"
            );
            (
                0,
                format!("upstream reported no usage; reserved quota {reserved} returned"),
            )
        } else {
            (breakdown.quota, breakdown.content.clone())
        };

        let delta = quota - reserved;
        self.store
            .apply_settlement_delta(info.token_id, &info.token_key, info.user_id, -delta)
            .await?;
        if total_tokens > 0 {
            self.store
                .update_user_used_quota_and_request_count(info.user_id, quota)
                .await?;
            self.store
                .update_channel_used_quota(info.channel_id, quota)
                .await?;
        }

        let mut other = breakdown.other_info(&input);
        other.insert("pre_consumed_quota".into(), json!(reserved));
        let log = ConsumeLog {
            user_id: info.user_id,
            created_at: Utc::now().timestamp(),
            channel_id: info.channel_id,
            token_id: info.token_id,
            token_name: info.token_name.clone(),
            model_name: log_model_name(&info.origin_model_name),
            prompt_tokens: meta.usage.prompt_tokens,
            completion_tokens: meta.usage.completion_tokens,
            quota,
            content,
            use_time_seconds: info.start_time.elapsed().as_secs() as i64,
            is_stream: info.is_stream,
            group: info.group.clone(),
            other,
            ..ConsumeLog::default()
        };
        let id = self.store.record_consume_log(&log).await?;

        tracing::info!(
            user_id = info.user_id,
            token_id = info.token_id,
            channel_id = info.channel_id,
            model = %log.model_name,
            prompt_tokens = log.prompt_tokens,
            completion_tokens = log.completion_tokens,
            quota,
            reserved,
            delta,
            breakdown = %log.content,
            "request settled"
        );
        Ok(ConsumeLog { id, ..log })
    }
}

/// 逐级解析模型映射；出现环时报错，自映射视为终点。
pub fn map_model(mapping: &HashMap<String, String>, model: &str) -> Result<String, RelayError> {
    let mut current = model.to_string();
    let mut seen = HashSet::from([current.clone()]);
    while let Some(next) = mapping.get(&current).filter(|next| !next.is_empty()) {
        if *next == current {
            break;
        }
        if !seen.insert(next.clone()) {
            return Err(RelayError::new(
                ErrorCode::ChannelModelMappedError,
                format!("model mapping contains a cycle at {next}"),
            ));
        }
        current = next.clone();
    }
    Ok(current)
}

/// 浅层覆盖：顶层同名键直接替换。
pub fn apply_param_override(
    payload: &mut Value,
    overrides: &Map<String, Value>,
) -> Result<(), RelayError> {
    if overrides.is_empty() {
        return Ok(());
    }
    let Some(object) = payload.as_object_mut() else {
        return Err(RelayError::new(
            ErrorCode::ChannelParamOverrideInvalid,
            "converted request is not a json object",
        ));
    };
    for (key, value) in overrides {
        object.insert(key.clone(), value.clone());
    }
    Ok(())
}

pub fn log_model_name(model: &str) -> String {
    if model.starts_with("gpt-4-gizmo") {
        "gpt-4-gizmo-*".to_string()
    } else if model.starts_with("gpt-4o-gizmo") {
        "gpt-4o-gizmo-*".to_string()
    } else {
        model.to_string()
    }
}

/// 把响应里统计到的内置工具调用次数并入请求声明的工具信息。
fn merge_tool_calls(
    declared: Option<ResponsesUsageInfo>,
    meta: &ResponseMeta,
) -> Option<ResponsesUsageInfo> {
    if meta.web_search_calls == 0 && meta.file_search_calls == 0 {
        return declared;
    }
    let mut info = declared.unwrap_or_default();
    for (name, calls) in [
        (TOOL_WEB_SEARCH_PREVIEW, meta.web_search_calls),
        (TOOL_FILE_SEARCH, meta.file_search_calls),
    ] {
        if calls == 0 {
            continue;
        }
        info.built_in_tools
            .entry(name.to_string())
            .or_insert_with(|| BuiltInTool {
                call_count: 0,
                search_context_size: "medium".to_string(),
            })
            .call_count = calls;
    }
    Some(info)
}
