use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// 熔断器对外展示的状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// 正常放行，失败计数。
    Closed,
    /// 冷却中，直接拒绝。
    Open,
    /// 冷却已过，允许（或正在进行）一次探测调用。
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// 连续失败达到该值即熔断。
    pub failure_threshold: u32,
    /// 熔断持续时间。
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// 熔断器拒绝了本次调用（依赖本身没有被触达）。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("熔断器 {name} 已打开，{open_until} 前拒绝调用")]
pub struct BreakerRejection {
    pub name: String,
    pub open_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_until: Option<DateTime<Utc>>,
    pub times_opened: u64,
}
