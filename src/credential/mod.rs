//! 凭据与 provider 池。
//!
//! `Credential`/`Provider` 是启动时由配置生成的不可变描述；
//! 健康状态、轮换游标由 `ProviderPool` 持有，配额由 `QuotaTracker` 持有。

mod pool;
mod types;

pub use pool::{CredentialHealth, HealthSettings, ProviderPool};
pub use types::{ApiStyle, Credential, DEFAULT_MAX_TOKENS_PER_CALL, Provider};
