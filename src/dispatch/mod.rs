//! 分发：按优先级与凭据轮换走完回退链，配额、熔断与缓存都在这里汇合。

mod dispatcher;
mod status;
mod types;

pub use dispatcher::{DispatchSettings, Dispatcher};
pub use status::{CredentialStatus, ProviderStatus, StatusSnapshot};
pub use types::{
    Attempt, AttemptOutcome, CompletionPayload, CompletionResponse, DispatchRequest,
    DispatchResult,
};
