use crate::config::Config;
use crate::credential::{ApiStyle, Credential, Provider};
use crate::logging::{self, LogLevel};
use crate::upstream::Invoker;
use crate::upstream::types::{
    CloudflareRequest, CloudflareResponse, Completion, OpenAiRequest, OpenAiResponse, PreparedCall,
};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use sonic_rs::JsonValueTrait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("上游返回 {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("调用超时（{}ms）", .0.as_millis())]
    Timeout(Duration),

    #[error("上游响应缺少内容: {0}")]
    Malformed(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }

    /// 上游明确表示"这把 key 暂时别用"时，建议的暂停时长。
    ///
    /// - 401/403：按 `auth_suspend` 暂停
    /// - 429 且带有重试提示：按提示暂停
    pub fn suspend_hint(&self, auth_suspend: Duration) -> Option<Duration> {
        if self.is_auth_failure() {
            return Some(auth_suspend);
        }
        match self {
            Self::Http {
                status: 429,
                retry_after: Some(d),
                ..
            } => Some(*d),
            _ => None,
        }
    }
}

/// 基于 reqwest 的出站调用。
#[derive(Debug, Clone)]
pub struct HttpInvoker {
    http: reqwest::Client,
    user_agent: String,
    log_level: LogLevel,
}

impl HttpInvoker {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10));

        // 单次调用的总超时由分发器控制；这里只兜底。
        if cfg.call_timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.call_timeout_ms.saturating_mul(2)));
        }
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            user_agent: cfg.user_agent.clone(),
            log_level: cfg.log_level(),
        })
    }

    fn build_headers(&self, secret: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent).unwrap_or(HeaderValue::from_static("dispatchd")),
        );
        h.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {secret}")).unwrap_or(HeaderValue::from_static("")),
        );
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h
    }

    async fn post(&self, url: &str, secret: &str, body: Vec<u8>) -> Result<Vec<u8>, ApiError> {
        let headers = self.build_headers(secret);
        if self.log_level.bodies_enabled() {
            logging::backend_request("POST", url, &headers, &body);
        }

        let start = std::time::Instant::now();
        let resp = self.http.post(url).headers(headers).body(body).send().await?;

        let status = resp.status();
        let retry_header = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_delay);
        let bytes = resp.bytes().await?;
        if self.log_level.bodies_enabled() {
            logging::backend_response(status.as_u16(), start.elapsed(), &bytes);
        }

        if !status.is_success() {
            return Err(extract_error_details(status.as_u16(), retry_header, &bytes));
        }
        Ok(bytes.to_vec())
    }

    async fn call_openai(
        &self,
        provider: &Provider,
        credential: &Credential,
        call: &PreparedCall,
    ) -> Result<Completion, ApiError> {
        let body = sonic_rs::to_vec(&OpenAiRequest {
            model: &call.model,
            messages: &call.messages,
            temperature: call.temperature,
            max_tokens: call.max_tokens,
        })?;
        let bytes = self.post(&provider.endpoint, &credential.secret, body).await?;
        let resp: OpenAiResponse = sonic_rs::from_slice(&bytes)?;

        let content = resp
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ApiError::Malformed("choices[0].message.content".to_string()))?;
        Ok(Completion {
            content,
            model: if resp.model.is_empty() {
                call.model.clone()
            } else {
                resp.model
            },
            total_tokens: resp.usage.and_then(|u| u.total_tokens),
        })
    }

    async fn call_cloudflare(
        &self,
        provider: &Provider,
        credential: &Credential,
        call: &PreparedCall,
    ) -> Result<Completion, ApiError> {
        let url = format!("{}/{}", provider.endpoint.trim_end_matches('/'), call.model);
        let body = sonic_rs::to_vec(&CloudflareRequest {
            messages: &call.messages,
            max_tokens: call.max_tokens,
        })?;
        let bytes = self.post(&url, &credential.secret, body).await?;
        let resp: CloudflareResponse = sonic_rs::from_slice(&bytes)?;

        if !resp.success {
            let message = resp
                .errors
                .into_iter()
                .map(|e| e.message)
                .filter(|m| !m.is_empty())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ApiError::Http {
                status: 502,
                message: if message.is_empty() {
                    "success=false".to_string()
                } else {
                    message
                },
                retry_after: None,
            });
        }

        let result = resp
            .result
            .ok_or_else(|| ApiError::Malformed("result".to_string()))?;
        let content = result
            .response
            .ok_or_else(|| ApiError::Malformed("result.response".to_string()))?;
        Ok(Completion {
            content,
            model: call.model.clone(),
            total_tokens: result.tokens_used,
        })
    }
}

impl Invoker for HttpInvoker {
    async fn invoke(
        &self,
        provider: &Provider,
        credential: &Credential,
        call: &PreparedCall,
    ) -> Result<Completion, ApiError> {
        match provider.api_style {
            ApiStyle::OpenAiCompatible => self.call_openai(provider, credential, call).await,
            ApiStyle::Cloudflare => self.call_cloudflare(provider, credential, call).await,
        }
    }
}

fn extract_error_details(status: u16, retry_header: Option<Duration>, body: &[u8]) -> ApiError {
    let mut message = String::new();

    if let Ok(v) = sonic_rs::from_slice::<sonic_rs::Value>(body) {
        // OpenAI 兼容：{"error":{"message":...}}；Cloudflare：{"errors":[{"message":...}]}
        if let Some(m) = v
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            message = m.to_string();
        } else if let Some(m) = v.get("error").and_then(|e| e.as_str()) {
            message = m.to_string();
        } else if let Some(m) = v
            .get("errors")
            .and_then(|e| e.get(0))
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            message = m.to_string();
        }
    }
    if message.is_empty() {
        message = logging::truncate_text_for_log(String::from_utf8_lossy(body).trim());
    }
    if message.is_empty() {
        message = "Unknown error".to_string();
    }

    let retry_after = retry_header.or_else(|| {
        if status == 429 {
            retry_hint_in_message(&message)
        } else {
            None
        }
    });

    ApiError::Http {
        status,
        message,
        retry_after,
    }
}

/// 从 "Please try again in 7.66s." 这类提示中提取等待时间。
fn retry_hint_in_message(message: &str) -> Option<Duration> {
    let idx = message.find("try again in ")?;
    let rest = &message[idx + "try again in ".len()..];
    let token = rest.split_whitespace().next()?;
    parse_retry_delay(token.trim_end_matches(['.', ',']))
}

/// 兼容 "30"、"2.5s"、"120ms"、"1m26.5s"、"1h2m"。精度到毫秒。
fn parse_retry_delay(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<f64>() {
        return finite_millis(secs * 1000.0);
    }

    let mut total_ms = 0f64;
    let mut num = String::new();
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() || ch == '.' {
            num.push(ch);
            continue;
        }
        let value: f64 = num.parse().ok()?;
        num.clear();
        let unit_ms = match ch {
            'h' => 3_600_000.0,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1.0
            }
            'm' => 60_000.0,
            's' => 1_000.0,
            _ => return None,
        };
        total_ms += value * unit_ms;
    }
    if !num.is_empty() {
        return None;
    }
    finite_millis(total_ms)
}

fn finite_millis(ms: f64) -> Option<Duration> {
    if !(ms.is_finite() && ms >= 0.0) {
        return None;
    }
    Some(Duration::from_millis(ms.round() as u64))
}
