//! 配额跟踪（Quota Tracker）模块。
//!
//! 目标：对同一个 subject（调用方或凭据）同时执行多个用量上限
//! （每分钟 / 每小时 / 每天 / 单次请求），预留要么全部计入，要么全部不计入。

mod pruner;
mod tracker;
mod types;
mod window;

pub use pruner::spawn_prune_task;
pub use tracker::{CostTelemetry, QuotaTracker};
pub use types::{QuotaDenial, QuotaLimits, QuotaUnit, Reservation, WindowKind, WindowUsage};
