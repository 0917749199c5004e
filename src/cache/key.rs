use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// 结果缓存的键：`sha256(operation + "\n" + 规范化参数)` 的十六进制。
///
/// 参数先转成 `serde_json::Value` 并按键名排序，因此字段顺序不同的等价请求命中同一条目。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new<A: Serialize + ?Sized>(operation: &str, args: &A) -> Result<Self, serde_json::Error> {
        let canonical = canonicalize(serde_json::to_value(args)?);
        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        hasher.update(b"\n");
        hasher.update(serde_json::to_vec(&canonical)?);
        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 递归地按键名排序对象字段。
fn canonicalize(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 日志里只需要前缀。
        f.write_str(&self.0[..self.0.len().min(12)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_order_does_not_change_key() {
        let a = CacheKey::new("chat", &json!({"model": "m", "messages": [1, 2]})).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"messages":[1,2],"model":"m"}"#).unwrap();
        let b = CacheKey::new("chat", &b).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn operation_is_part_of_identity() {
        let args = json!({"q": "AAPL"});
        let a = CacheKey::new("summarize", &args).unwrap();
        let b = CacheKey::new("classify", &args).unwrap();
        assert_ne!(a, b);
    }
}
