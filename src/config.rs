use crate::breaker::BreakerSettings;
use crate::cache::CacheSettings;
use crate::credential::{ApiStyle, Credential, DEFAULT_MAX_TOKENS_PER_CALL, HealthSettings, Provider};
use crate::logging::mask_key;
use crate::quota::QuotaLimits;
use anyhow::Context;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8050;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_USER_AGENT: &str = "dispatchd/0.1";
const DEFAULT_CONFIG_FILE: &str = "dispatch.toml";
/// 每个 provider 最多读取的编号 key（`NAME_API_KEY_1` ..= `NAME_API_KEY_8`）。
const MAX_NUMBERED_KEYS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub user_agent: String,
    pub proxy: String,
    pub debug: String,

    /// 单次出站调用的超时。
    pub call_timeout_ms: u64,
    /// 闲置配额 subject 的清理间隔。
    pub prune_interval_secs: u64,

    pub breaker: BreakerConfig,
    pub credential: CredentialConfig,
    pub cache: CacheConfig,

    /// 调用方级别的配额（与凭据级别相互独立）。
    pub caller_limits: QuotaLimits,

    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub failure_threshold: u32,
    pub suspend_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub capacity: u64,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: String,
    pub priority: u32,
    pub api_style: ApiStyle,
    pub endpoint: String,
    pub models: Vec<String>,
    pub model_aliases: HashMap<String, String>,
    pub max_tokens_per_call: Option<u32>,
    /// 每把 key 各自的配额。
    pub limits: QuotaLimits,
    /// 直接写在配置文件里的 key；环境变量中发现的 key 追加在后面。
    pub keys: Vec<String>,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.keys.iter().map(|k| mask_key(k)).collect();
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("api_style", &self.api_style)
            .field("endpoint", &self.endpoint)
            .field("models", &self.models)
            .field("keys", &keys)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            proxy: String::new(),
            debug: "off".to_string(),
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            prune_interval_secs: 600,
            breaker: BreakerConfig::default(),
            credential: CredentialConfig::default(),
            cache: CacheConfig::default(),
            caller_limits: QuotaLimits::default(),
            providers: Vec::new(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            suspend_secs: 300,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 600,
            capacity: 10_000,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            priority: 100,
            api_style: ApiStyle::OpenAiCompatible,
            endpoint: String::new(),
            models: Vec::new(),
            model_aliases: HashMap::new(),
            max_tokens_per_call: None,
            limits: QuotaLimits::default(),
            keys: Vec::new(),
        }
    }
}

/// 环境变量覆盖（优先级高于配置文件）。
#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,
    #[serde(alias = "API_USER_AGENT")]
    api_user_agent: Option<String>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,
    #[serde(alias = "DEBUG")]
    debug: Option<String>,
    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,

    #[serde(alias = "BREAKER_THRESHOLD")]
    breaker_threshold: Option<u32>,
    #[serde(alias = "BREAKER_COOLDOWN")]
    breaker_cooldown: Option<u64>,
    #[serde(alias = "CREDENTIAL_FAILURE_THRESHOLD")]
    credential_failure_threshold: Option<u32>,
    #[serde(alias = "CREDENTIAL_SUSPEND")]
    credential_suspend: Option<u64>,

    #[serde(alias = "CACHE_ENABLED")]
    cache_enabled: Option<bool>,
    #[serde(alias = "CACHE_TTL")]
    cache_ttl: Option<u64>,

    #[serde(alias = "CALLER_PER_MINUTE")]
    caller_per_minute: Option<u64>,
    #[serde(alias = "CALLER_PER_HOUR")]
    caller_per_hour: Option<u64>,
    #[serde(alias = "CALLER_PER_DAY")]
    caller_per_day: Option<u64>,
    #[serde(alias = "CALLER_PER_MONTH")]
    caller_per_month: Option<u64>,
}

impl Config {
    /// 加载顺序：默认值 → 配置文件（`DISPATCH_CONFIG`，默认 `./dispatch.toml`）→ 环境变量。
    ///
    /// 先把 .env 注入进程环境变量，因此会修改进程环境变量，必须在启动任何其他线程（包括 tokio 运行时）之前调用。
    pub fn load() -> anyhow::Result<Self> {
        load_dotenv();

        let explicit = std::env::var("DISPATCH_CONFIG").ok().filter(|s| !s.trim().is_empty());
        let path = PathBuf::from(explicit.as_deref().unwrap_or(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if path.is_file() {
            figment = figment.merge(Toml::file(&path));
        } else if explicit.is_some() {
            anyhow::bail!("配置文件不存在: {}", path.display());
        }
        let mut cfg: Config = figment
            .extract()
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();
        cfg.apply_env(raw);

        if cfg.providers.is_empty() {
            cfg.providers = builtin_providers(|k| std::env::var(k).ok());
        }
        cfg.discover_keys(|k| std::env::var(k).ok());

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        Ok(cfg)
    }

    #[cfg(test)]
    fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string(s))
            .extract()?)
    }

    fn apply_env(&mut self, raw: RawEnv) {
        if let Some(v) = raw.host {
            self.host = v;
        }
        if let Some(v) = raw.port {
            self.port = v;
        }
        if let Some(v) = raw.api_user_agent {
            self.user_agent = v;
        }
        if let Some(v) = raw.proxy {
            self.proxy = v;
        }
        if let Some(v) = raw.debug {
            self.debug = v;
        }
        if let Some(v) = raw.timeout {
            self.call_timeout_ms = v;
        }
        if let Some(v) = raw.breaker_threshold {
            self.breaker.failure_threshold = v;
        }
        if let Some(v) = raw.breaker_cooldown {
            self.breaker.cooldown_secs = v;
        }
        if let Some(v) = raw.credential_failure_threshold {
            self.credential.failure_threshold = v;
        }
        if let Some(v) = raw.credential_suspend {
            self.credential.suspend_secs = v;
        }
        if let Some(v) = raw.cache_enabled {
            self.cache.enabled = v;
        }
        if let Some(v) = raw.cache_ttl {
            self.cache.ttl_secs = v;
        }
        if raw.caller_per_minute.is_some() {
            self.caller_limits.per_minute = raw.caller_per_minute;
        }
        if raw.caller_per_hour.is_some() {
            self.caller_limits.per_hour = raw.caller_per_hour;
        }
        if raw.caller_per_day.is_some() {
            self.caller_limits.per_day = raw.caller_per_day;
        }
        if raw.caller_per_month.is_some() {
            self.caller_limits.per_month = raw.caller_per_month;
        }
    }

    /// 为每个 provider 追加环境变量中的 key：优先 `NAME_API_KEY_1..=8`，都没有时回退到 `NAME_API_KEY`。
    fn discover_keys(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for p in &mut self.providers {
            let prefix = env_prefix(&p.name);
            let mut found: Vec<String> = (1..=MAX_NUMBERED_KEYS)
                .filter_map(|i| lookup(&format!("{prefix}_API_KEY_{i}")))
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
            if found.is_empty()
                && let Some(k) = lookup(&format!("{prefix}_API_KEY"))
                && !k.trim().is_empty()
            {
                found.push(k.trim().to_string());
            }
            for k in found {
                if !p.keys.contains(&k) {
                    p.keys.push(k);
                }
            }
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.max(1))
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.breaker.failure_threshold.max(1),
            cooldown: Duration::from_secs(self.breaker.cooldown_secs),
        }
    }

    pub fn health_settings(&self) -> HealthSettings {
        HealthSettings {
            failure_threshold: self.credential.failure_threshold.max(1),
            suspend: Duration::from_secs(self.credential.suspend_secs),
        }
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            enabled: self.cache.enabled,
            ttl: Duration::from_secs(self.cache.ttl_secs),
        }
    }

    /// 生成运行时使用的 provider 列表；缺少 endpoint 或 key 的 provider 被跳过。
    pub fn build_providers(&self) -> Vec<Provider> {
        let mut out = Vec::new();
        for pc in &self.providers {
            let name = pc.name.trim();
            if name.is_empty() {
                tracing::warn!("provider 缺少 name，已跳过");
                continue;
            }
            if pc.endpoint.trim().is_empty() {
                tracing::warn!(provider = name, "provider 缺少 endpoint，已跳过");
                continue;
            }
            if pc.keys.is_empty() {
                tracing::warn!(
                    provider = name,
                    "未找到 key（{}_API_KEY 或 {}_API_KEY_1..{}），已跳过",
                    env_prefix(name),
                    env_prefix(name),
                    MAX_NUMBERED_KEYS
                );
                continue;
            }
            let credentials = pc
                .keys
                .iter()
                .enumerate()
                .map(|(i, key)| {
                    let mut c = Credential::new(name, i, key.clone());
                    c.models = pc.models.clone();
                    c.max_tokens_per_call = pc.max_tokens_per_call.unwrap_or(DEFAULT_MAX_TOKENS_PER_CALL);
                    c.limits = pc.limits.clone();
                    c
                })
                .collect();
            out.push(Provider {
                name: name.to_string(),
                priority: pc.priority,
                api_style: pc.api_style,
                endpoint: pc.endpoint.trim().to_string(),
                model_aliases: pc.model_aliases.clone(),
                credentials,
            });
        }
        out
    }
}

/// `groq` → `GROQ`，`together-ai` → `TOGETHER_AI`。
fn env_prefix(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// 配置文件未声明任何 provider 时使用的内置列表（按免费额度从高到低排序）。
fn builtin_providers(lookup: impl Fn(&str) -> Option<String>) -> Vec<ProviderConfig> {
    let daily_requests = |n: u64| QuotaLimits {
        per_day: Some(n),
        ..QuotaLimits::default()
    };

    let mut out = vec![
        ProviderConfig {
            name: "cerebras".into(),
            priority: 1,
            endpoint: "https://api.cerebras.ai/v1/chat/completions".into(),
            models: vec!["llama-3.3-70b".into(), "llama3.1-8b".into()],
            limits: daily_requests(14_400),
            ..ProviderConfig::default()
        },
        ProviderConfig {
            name: "groq".into(),
            priority: 2,
            endpoint: "https://api.groq.com/openai/v1/chat/completions".into(),
            models: vec![
                "llama-3.3-70b-versatile".into(),
                "llama-3.1-8b-instant".into(),
            ],
            model_aliases: HashMap::from([
                ("llama-3.3-70b".to_string(), "llama-3.3-70b-versatile".to_string()),
                ("llama3.1-8b".to_string(), "llama-3.1-8b-instant".to_string()),
            ]),
            limits: daily_requests(1_000),
            ..ProviderConfig::default()
        },
        // 免费 key 按自然月计数，放在最后兜底。
        ProviderConfig {
            name: "cohere".into(),
            priority: 4,
            endpoint: "https://api.cohere.ai/compatibility/v1/chat/completions".into(),
            models: vec!["command-r-08-2024".into()],
            limits: QuotaLimits {
                per_month: Some(1_000),
                ..QuotaLimits::default()
            },
            ..ProviderConfig::default()
        },
    ];

    if let Some(account) = lookup("CLOUDFLARE_ACCOUNT_ID").filter(|s| !s.trim().is_empty()) {
        out.push(ProviderConfig {
            name: "cloudflare".into(),
            priority: 3,
            api_style: ApiStyle::Cloudflare,
            endpoint: format!(
                "https://api.cloudflare.com/client/v4/accounts/{}/ai/run",
                account.trim()
            ),
            models: vec!["@cf/meta/llama-3.1-8b-instruct".into()],
            model_aliases: HashMap::from([(
                "llama3.1-8b".to_string(),
                "@cf/meta/llama-3.1-8b-instruct".to_string(),
            )]),
            max_tokens_per_call: Some(2048),
            limits: daily_requests(10_000),
            ..ProviderConfig::default()
        });
    }
    out
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };
    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // 已存在的进程环境变量优先。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：set_var 为 unsafe。main 在创建 tokio 运行时之前调用 Config::load，
        // 此时没有其他线程读写环境变量。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }
        // 发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }
        match dir.parent() {
            Some(parent) if parent != dir => dir = parent,
            _ => return None,
        }
    }
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let raw = raw.trim();
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }
    Some((key.to_string(), strip_inline_comment(raw).trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] == b'#' && (i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t') {
            return value[..i].trim_end();
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::QuotaUnit;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn toml_overrides_defaults() {
        let cfg = Config::from_toml_str(
            r#"
            call_timeout_ms = 5000

            [breaker]
            failure_threshold = 2

            [caller_limits]
            unit = "tokens"
            per_minute = 20000
            per_request = 8000

            [[providers]]
            name = "groq"
            priority = 1
            endpoint = "https://api.groq.com/openai/v1/chat/completions"
            models = ["llama-3.3-70b-versatile"]
            keys = ["gsk_inline"]
            limits = { per_day = 1000 }
            "#,
        )
        .unwrap();

        assert_eq!(cfg.call_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.breaker.failure_threshold, 2);
        assert_eq!(cfg.breaker.cooldown_secs, 60);
        assert_eq!(cfg.caller_limits.unit, QuotaUnit::Tokens);
        assert_eq!(cfg.caller_limits.per_request, Some(8000));
        assert_eq!(cfg.providers[0].limits.per_day, Some(1000));
        assert!(cfg.cache.enabled);
    }

    #[test]
    fn numbered_keys_take_precedence_over_single_key() {
        let mut cfg = Config {
            providers: vec![ProviderConfig {
                name: "groq".into(),
                keys: vec!["inline".into()],
                ..ProviderConfig::default()
            }],
            ..Config::default()
        };
        cfg.discover_keys(env(&[
            ("GROQ_API_KEY", "single"),
            ("GROQ_API_KEY_1", "k1"),
            ("GROQ_API_KEY_3", " k3 "),
            ("GROQ_API_KEY_9", "ignored"),
        ]));
        assert_eq!(cfg.providers[0].keys, ["inline", "k1", "k3"]);

        let mut cfg = Config {
            providers: vec![ProviderConfig {
                name: "together-ai".into(),
                ..ProviderConfig::default()
            }],
            ..Config::default()
        };
        cfg.discover_keys(env(&[("TOGETHER_AI_API_KEY", "only")]));
        assert_eq!(cfg.providers[0].keys, ["only"]);
    }

    #[test]
    fn providers_without_keys_or_endpoint_are_skipped() {
        let cfg = Config {
            providers: vec![
                ProviderConfig {
                    name: "groq".into(),
                    endpoint: "https://example/v1".into(),
                    keys: vec!["a".into(), "b".into()],
                    max_tokens_per_call: Some(1024),
                    ..ProviderConfig::default()
                },
                ProviderConfig {
                    name: "nokey".into(),
                    endpoint: "https://example/v1".into(),
                    ..ProviderConfig::default()
                },
                ProviderConfig {
                    name: "noendpoint".into(),
                    keys: vec!["a".into()],
                    ..ProviderConfig::default()
                },
            ],
            ..Config::default()
        };
        let providers = cfg.build_providers();
        assert_eq!(providers.len(), 1);
        let creds = &providers[0].credentials;
        assert_eq!(creds[1].key_id, "groq#2");
        assert_eq!(creds[1].index, 1);
        assert_eq!(creds[0].max_tokens_per_call, 1024);
    }

    #[test]
    fn builtin_cohere_is_metered_per_month() {
        let builtin = builtin_providers(env(&[]));
        let cohere = builtin.iter().find(|p| p.name == "cohere").unwrap();
        assert_eq!(cohere.limits.per_month, Some(1_000));
        assert_eq!(cohere.limits.per_day, None);
        assert!(builtin.iter().all(|p| p.priority <= cohere.priority));
    }

    #[test]
    fn builtin_cloudflare_requires_account_id() {
        assert!(builtin_providers(env(&[])).iter().all(|p| p.name != "cloudflare"));
        let with_cf = builtin_providers(env(&[("CLOUDFLARE_ACCOUNT_ID", "acc123")]));
        let cf = with_cf.iter().find(|p| p.name == "cloudflare").unwrap();
        assert!(cf.endpoint.contains("/accounts/acc123/ai/run"));
        assert_eq!(cf.api_style, ApiStyle::Cloudflare);
    }

    #[test]
    fn env_overrides_apply_on_top_of_file() {
        let mut cfg = Config::default();
        cfg.apply_env(RawEnv {
            port: Some(9000),
            timeout: Some(1500),
            cache_enabled: Some(false),
            caller_per_day: Some(50),
            caller_per_month: Some(900),
            ..RawEnv::default()
        });
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.call_timeout_ms, 1500);
        assert!(!cfg.cache_settings().enabled);
        assert_eq!(cfg.caller_limits.per_day, Some(50));
        assert_eq!(cfg.caller_limits.per_month, Some(900));
        assert_eq!(cfg.caller_limits.per_minute, None);
    }

    #[test]
    fn dotenv_lines() {
        assert_eq!(
            parse_dotenv_line("export GROQ_API_KEY=\"gsk_x # y\""),
            Some(("GROQ_API_KEY".into(), "gsk_x # y".into()))
        );
        assert_eq!(
            parse_dotenv_line("PORT=8050 # local"),
            Some(("PORT".into(), "8050".into()))
        );
        assert_eq!(parse_dotenv_line("# comment"), None);
        assert_eq!(parse_dotenv_line("=value"), None);
    }
}
