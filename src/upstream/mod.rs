//! 出站调用：把一次已准备好的补全请求发给某个凭据。

mod client;
mod types;

use crate::credential::{Credential, Provider};
use std::future::Future;

pub use client::{ApiError, HttpInvoker};
pub use types::{ChatMessage, Completion, PreparedCall};

/// 对某个凭据发起一次调用。分发器只依赖这个接口，不关心具体的请求格式。
pub trait Invoker: Send + Sync + 'static {
    fn invoke(
        &self,
        provider: &Provider,
        credential: &Credential,
        call: &PreparedCall,
    ) -> impl Future<Output = Result<Completion, ApiError>> + Send;
}
