use crate::logging::mask_key;
use crate::quota::QuotaLimits;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const DEFAULT_MAX_TOKENS_PER_CALL: u32 = 4000;

/// 后端的请求/响应格式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStyle {
    /// `POST {endpoint}`，body 为 `{model, messages, temperature, max_tokens}`。
    #[default]
    #[serde(alias = "openai")]
    OpenAiCompatible,
    /// `POST {endpoint}/{model}`，body 为 `{messages, max_tokens}`，结果在 `result.response`。
    Cloudflare,
}

/// 一个可调用的（provider, key）组合。
///
/// 启动时由配置生成，进程生命周期内不会被销毁；可变状态（健康、轮换、配额）由
/// `ProviderPool` 与 `QuotaTracker` 持有。
#[derive(Clone, Serialize)]
pub struct Credential {
    pub provider: String,
    /// `provider#n`，日志与状态快照中只使用它指代凭据。
    pub key_id: String,
    #[serde(skip)]
    pub secret: String,
    /// 在所属 provider 内的位置。
    #[serde(skip)]
    pub index: usize,
    pub models: Vec<String>,
    pub max_tokens_per_call: u32,
    pub limits: QuotaLimits,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("key_id", &self.key_id)
            .field("secret", &mask_key(&self.secret))
            .field("models", &self.models)
            .field("max_tokens_per_call", &self.max_tokens_per_call)
            .finish()
    }
}

impl Credential {
    pub fn new(provider: &str, index: usize, secret: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            key_id: format!("{provider}#{}", index + 1),
            secret: secret.into(),
            index,
            models: Vec::new(),
            max_tokens_per_call: DEFAULT_MAX_TOKENS_PER_CALL,
            limits: QuotaLimits::default(),
        }
    }

    pub fn quota_subject(&self) -> String {
        format!("credential:{}", self.key_id)
    }

    pub fn masked_secret(&self) -> String {
        mask_key(&self.secret)
    }

    /// 模型列表为空表示不限制。
    pub fn supports(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }

    pub fn clamp_max_tokens(&self, requested: Option<u32>) -> u32 {
        let cap = self.max_tokens_per_call.max(1);
        requested.unwrap_or(cap).clamp(1, cap)
    }
}

/// 一个后端 provider：静态优先级 + 若干凭据。
#[derive(Debug, Clone, Serialize)]
pub struct Provider {
    pub name: String,
    /// 数值越小越优先。
    pub priority: u32,
    pub api_style: ApiStyle,
    pub endpoint: String,
    pub model_aliases: HashMap<String, String>,
    pub credentials: Vec<Credential>,
}

impl Provider {
    /// 把请求中的模型名映射为该凭据可服务的模型。
    ///
    /// - 请求未指定模型：使用凭据的第一个模型
    /// - 映射后的模型不在凭据能力列表内：返回 `None`
    pub fn resolve_model(&self, requested: Option<&str>, credential: &Credential) -> Option<String> {
        let requested = requested.map(str::trim).filter(|m| !m.is_empty());
        match requested {
            Some(m) => {
                let mapped = self.model_aliases.get(m).map(String::as_str).unwrap_or(m);
                credential.supports(mapped).then(|| mapped.to_string())
            }
            None => credential.models.first().cloned(),
        }
    }
}
