use crate::dispatch::Attempt;
use crate::quota::{QuotaDenial, WindowKind};
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// `dispatch` 的终止性错误：调用方只会看到这几种，不会看到底层网络异常。
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// 调用方级别配额不足，未联系任何 provider。
    #[error("调用方 {caller_id} 配额不足: {denial}")]
    QuotaExceeded {
        caller_id: String,
        denial: QuotaDenial,
    },

    /// 所有 provider/凭据组合都已尝试或被跳过。
    #[error("所有 provider 均不可用（共 {} 次尝试）", .attempts.len())]
    AllProvidersExhausted { attempts: Vec<Attempt> },

    #[error("请求无效: {0}")]
    InvalidRequest(String),
}

impl DispatchError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::QuotaExceeded { denial, .. } => denial.retry_after(),
            _ => None,
        }
    }

    pub fn window(&self) -> Option<WindowKind> {
        match self {
            Self::QuotaExceeded { denial, .. } => Some(denial.window()),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    r#type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    window: Option<WindowKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempts: Option<Vec<Attempt>>,
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let retry_after = self.retry_after();
        let (status, ty) = match &self {
            Self::QuotaExceeded { .. } => (StatusCode::TOO_MANY_REQUESTS, "quota_exceeded"),
            Self::AllProvidersExhausted { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "all_providers_exhausted")
            }
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        };

        let message = self.to_string();
        let window = self.window();
        let attempts = match self {
            Self::AllProvidersExhausted { attempts } => Some(attempts),
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorBodyInner {
                message,
                r#type: ty,
                window,
                // 向上取整，避免客户端过早重试。
                retry_after_secs: retry_after.map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0)),
                attempts,
            },
        };

        let mut resp = (status, Json(body)).into_response();
        if let Some(d) = retry_after {
            let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(RETRY_AFTER, v);
            }
        }
        resp
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Dispatch(e) => e.into_response(),
            AppError::BadRequest(_) => {
                let body = ErrorBody {
                    error: ErrorBodyInner {
                        message: self.to_string(),
                        r#type: "bad_request",
                        window: None,
                        retry_after_secs: None,
                        attempts: None,
                    },
                };
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
        }
    }
}
