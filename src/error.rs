use std::collections::HashMap;
use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;

/// 存储层错误（主库或缓存镜像）。
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("{0}")]
    Invalid(String),
    #[error("record not found")]
    NotFound,
}

/// 令牌校验结果中的失败分支，每种情况对应不同的错误。
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no token provided or token not found")]
    NotFound,
    #[error("failed to activate token")]
    ActivationFailed(#[source] StoreError),
    #[error("token quota exhausted [{masked}]")]
    Exhausted { masked: String, remain_quota: i64 },
    #[error("token expired")]
    Expired,
    #[error("token is not available (status {status})")]
    Unavailable { status: i64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 启动与装配阶段的错误。
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// 面向客户端的稳定错误码。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidRequest,
    SensitiveWordsDetected,
    ContentReviewFailed,
    InsufficientUserQuota,
    PreConsumeTokenQuotaFailed,
    ChannelModelMappedError,
    ChannelParamOverrideInvalid,
    ConvertRequestFailed,
    InvalidApiType,
    ReadRequestBodyFailed,
    DoRequestFailed,
    BadResponseStatusCode,
    BadResponseBody,
    CountTokenFailed,
    ModelPriceError,
    QueryDataError,
    UpdateDataError,
    NoAvailableChannel,
    Unauthorized,
    AccessDenied,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::SensitiveWordsDetected => "sensitive_words_detected",
            ErrorCode::ContentReviewFailed => "content_review_abnormality",
            ErrorCode::InsufficientUserQuota => "insufficient_user_quota",
            ErrorCode::PreConsumeTokenQuotaFailed => "pre_consume_token_quota_failed",
            ErrorCode::ChannelModelMappedError => "channel:model_mapped_error",
            ErrorCode::ChannelParamOverrideInvalid => "channel:param_override_invalid",
            ErrorCode::ConvertRequestFailed => "convert_request_failed",
            ErrorCode::InvalidApiType => "invalid_api_type",
            ErrorCode::ReadRequestBodyFailed => "read_request_body_failed",
            ErrorCode::DoRequestFailed => "do_request_failed",
            ErrorCode::BadResponseStatusCode => "bad_response_status_code",
            ErrorCode::BadResponseBody => "bad_response_body",
            ErrorCode::CountTokenFailed => "count_token_failed",
            ErrorCode::ModelPriceError => "model_price_error",
            ErrorCode::QueryDataError => "query_data_error",
            ErrorCode::UpdateDataError => "update_data_error",
            ErrorCode::NoAvailableChannel => "no_available_channel",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::AccessDenied => "access_denied",
        }
    }

    fn default_status(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequest
            | ErrorCode::SensitiveWordsDetected
            | ErrorCode::ContentReviewFailed
            | ErrorCode::ReadRequestBodyFailed => StatusCode::BAD_REQUEST,
            ErrorCode::InsufficientUserQuota | ErrorCode::PreConsumeTokenQuotaFailed => {
                StatusCode::FORBIDDEN
            }
            ErrorCode::AccessDenied => StatusCode::FORBIDDEN,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::NoAvailableChannel => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 中继流水线对外暴露的错误：错误码 + HTTP 状态 + 信息。
#[derive(Debug, Clone, Error)]
#[error("{message} ({code})")]
pub struct RelayError {
    pub code: ErrorCode,
    pub status: StatusCode,
    pub message: String,
    /// 错误是否来自上游供应商。
    pub upstream: bool,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            status: code.default_status(),
            message: message.into(),
            upstream: false,
        }
    }

    pub fn with_status(code: ErrorCode, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            status,
            message: message.into(),
            upstream: false,
        }
    }

    pub fn upstream(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::BadResponseStatusCode,
            status,
            message: message.into(),
            upstream: true,
        }
    }

    pub fn error_type(&self) -> &'static str {
        if self.upstream {
            "upstream_error"
        } else {
            "quota_relay_error"
        }
    }

    /// 按渠道配置的状态码映射表重写状态码，200 不参与映射。
    pub fn remap_status(&mut self, mapping: &HashMap<String, String>) {
        if mapping.is_empty() || self.status == StatusCode::OK {
            return;
        }
        let Some(target) = mapping.get(self.status.as_str()) else {
            return;
        };
        match target
            .trim()
            .parse::<u16>()
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok())
        {
            Some(status) => self.status = status,
            None => tracing::warn!(target = %target, "ignoring unparsable status code mapping"),
        }
    }
}

impl From<TokenError> for RelayError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Store(source) => {
                RelayError::new(ErrorCode::QueryDataError, source.to_string())
            }
            TokenError::ActivationFailed(_) => {
                RelayError::new(ErrorCode::UpdateDataError, err.to_string())
            }
            other => RelayError::new(ErrorCode::Unauthorized, other.to_string()),
        }
    }
}
