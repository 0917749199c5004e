//! 分发器的 HTTP 外壳。

mod handler;

use crate::dispatch::Dispatcher;
use crate::upstream::Invoker;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;

pub use handler::{CALLER_ID_HEADER, handle_dispatch, handle_health, handle_status};

pub fn router<I: Invoker>(dispatcher: Arc<Dispatcher<I>>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status::<I>))
        .route("/v1/dispatch", post(handle_dispatch::<I>))
        // 允许尾随斜杠的同一路径
        .route("/v1/dispatch/", post(handle_dispatch::<I>))
        .with_state(dispatcher)
}
