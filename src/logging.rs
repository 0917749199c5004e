use reqwest::header::HeaderMap;
use std::time::Duration;

/// 日志等级（`DEBUG` 配置项）：
/// - off：关闭全部日志输出
/// - low：额外输出每次分发的最终结果
/// - medium：额外输出每一次尝试（凭据、耗时、失败原因）
/// - high：额外输出后端请求/响应体（鉴权头脱敏）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    #[default]
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "outcome" => Self::Low,
            "medium" | "attempt" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn outcomes_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn attempts_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn bodies_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

/// 只保留前 4 个字符，其余以 `…` 代替；不超过 4 个字符的 key 整个隐藏。
pub fn mask_key(key: &str) -> String {
    let key = key.trim();
    if key.is_empty() {
        return String::new();
    }
    if key.chars().count() <= 4 {
        return "…".to_string();
    }
    let head: String = key.chars().take(4).collect();
    format!("{head}…")
}

pub fn backend_request(method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端请求 ========================\n[后端请求] {method} {url}\n[后端请求头]\n{}\n{}\n==========================================================",
        format_headers(headers),
        format_body_bytes(body)
    );
}

pub fn backend_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut obj = sonic_rs::Object::new();
    for (name, value) in headers.iter() {
        let key = name.as_str();
        let key_lc = key.to_lowercase();
        let v = if key_lc == "authorization" || key_lc == "proxy-authorization" {
            sonic_rs::Value::from("Bearer ***")
        } else {
            match value.to_str() {
                Ok(s) => sonic_rs::Value::from(s),
                Err(_) => sonic_rs::Value::from("<binary>"),
            }
        };
        obj.insert(key, v);
    }
    format_body_value(&obj.into_value())
}

fn format_body_value(v: &sonic_rs::Value) -> String {
    match sonic_rs::to_string_pretty(v) {
        Ok(s) => s,
        Err(_) => v.to_string(),
    }
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    const MAX_PARSE_BYTES: usize = 512 * 1024;
    if bytes.len() > MAX_PARSE_BYTES {
        return format!(
            "(body too large: {} bytes)\n{}",
            bytes.len(),
            truncate_text_for_log(&String::from_utf8_lossy(&bytes[..MAX_PARSE_BYTES]))
        );
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => format_body_value(&v),
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

pub fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 16 * 1024;
    if s.chars().count() <= MAX_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_CHARS).collect();
    out.push_str("...[TRUNCATED]");
    out
}
