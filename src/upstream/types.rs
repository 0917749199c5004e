use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// 发往某个凭据的一次调用（模型已映射、max_tokens 已按凭据上限截断）。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedCall {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: u32,
}

/// 后端返回的补全结果（与具体格式无关）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub model: String,
    /// 后端报告的 token 总数；缺失时由调用方按预估值处理。
    pub total_tokens: Option<u64>,
}

// ---- OpenAI 兼容格式 ----

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<OpenAiChoice>,
    #[serde(default)]
    pub usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiChoice {
    pub message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiUsage {
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

// ---- Cloudflare Workers AI ----

#[derive(Debug, Serialize)]
pub(crate) struct CloudflareRequest<'a> {
    pub messages: &'a [ChatMessage],
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CloudflareResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub result: Option<CloudflareResult>,
    #[serde(default)]
    pub errors: Vec<CloudflareError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CloudflareResult {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub tokens_used: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CloudflareError {
    #[serde(default)]
    pub message: String,
}

fn default_true() -> bool {
    true
}
