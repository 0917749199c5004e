//! 熔断器（Circuit Breaker）模块。
//!
//! 每个具名依赖（后端 provider）一个状态机：连续失败达到阈值后打开，
//! 冷却期内直接拒绝；冷却结束后只放行一次探测调用，成功则关闭，失败则重新打开。

mod registry;
mod types;

pub use registry::{BreakerPermit, CircuitBreakerRegistry};
pub use types::{BreakerRejection, BreakerSettings, BreakerState, BreakerStatus};
