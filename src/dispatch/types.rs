use crate::cache::CacheValue;
use crate::quota::{QuotaDenial, WindowKind};
use crate::upstream::ChatMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 请求体中的补全参数。`model` 为空时由凭据决定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl CompletionPayload {
    /// 预估 token：`ceil(字符数 / 4) + max_tokens`。
    pub fn estimate_tokens(&self, max_tokens: u32) -> u64 {
        let chars: usize = self.messages.iter().map(|m| m.content.chars().count()).sum();
        (chars as u64).div_ceil(4) + u64::from(max_tokens)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    /// 逻辑操作名（例如 `summarize`），参与缓存键。
    pub operation: String,
    /// 为空时由网关从 `X-Caller-Id` 请求头补全。
    #[serde(default)]
    pub caller_id: String,
    pub payload: CompletionPayload,
    #[serde(default)]
    pub preferred_provider: Option<String>,
    /// 只有幂等请求才会查询/写入结果缓存。
    #[serde(default)]
    pub idempotent: bool,
    /// 显式成本，覆盖按字符数的预估。
    #[serde(default)]
    pub cost: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub credential: String,
    pub total_tokens: Option<u64>,
}

impl CacheValue for CompletionResponse {
    fn is_empty_result(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// 单次尝试被跳过或失败的原因。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AttemptOutcome {
    QuotaDenied {
        window: WindowKind,
        retry_after_secs: Option<u64>,
        message: String,
    },
    CircuitOpen {
        open_until: DateTime<Utc>,
    },
    CallFailed {
        status: Option<u16>,
        error: String,
    },
    Suspended {
        until: Option<DateTime<Utc>>,
    },
    ModelUnsupported {
        model: String,
    },
}

impl AttemptOutcome {
    pub fn quota_denied(denial: &QuotaDenial) -> Self {
        Self::QuotaDenied {
            window: denial.window(),
            retry_after_secs: denial.retry_after().map(|d| d.as_secs()),
            message: denial.to_string(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuotaDenied { .. } => "quota_denied",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::CallFailed { .. } => "call_failed",
            Self::Suspended { .. } => "suspended",
            Self::ModelUnsupported { .. } => "model_unsupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub provider: String,
    pub credential: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub request_id: String,
    pub response: CompletionResponse,
    pub provider: String,
    pub credential: String,
    /// 成功之前是否已有其他组合被尝试或跳过。
    pub fallback_used: bool,
    pub cached: bool,
    pub attempts: Vec<Attempt>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_is_quarter_chars_rounded_up_plus_max_tokens() {
        let p = CompletionPayload {
            model: None,
            messages: vec![ChatMessage::user("abcde"), ChatMessage::user("fgh")],
            temperature: None,
            max_tokens: None,
        };
        assert_eq!(p.estimate_tokens(100), 2 + 100);
    }

    #[test]
    fn attempt_serializes_reason_tag() {
        let a = Attempt {
            provider: "groq".into(),
            credential: "groq#1".into(),
            outcome: AttemptOutcome::CallFailed {
                status: Some(502),
                error: "bad gateway".into(),
            },
        };
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["reason"], "call_failed");
        assert_eq!(v["status"], 502);
        assert_eq!(v["credential"], "groq#1");
    }

    #[test]
    fn blank_completion_counts_as_empty() {
        let r = CompletionResponse {
            content: "  ".into(),
            model: "m".into(),
            provider: "p".into(),
            credential: "p#1".into(),
            total_tokens: None,
        };
        assert!(r.is_empty_result());
    }
}
