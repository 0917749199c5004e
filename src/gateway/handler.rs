use crate::dispatch::{DispatchRequest, DispatchResult, Dispatcher, StatusSnapshot};
use crate::error::AppError;
use crate::upstream::Invoker;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use std::sync::Arc;

/// 请求体未携带 `caller_id` 时使用的请求头。
pub const CALLER_ID_HEADER: &str = "x-caller-id";

pub async fn handle_health() -> &'static str {
    "ok"
}

pub async fn handle_status<I: Invoker>(
    State(dispatcher): State<Arc<Dispatcher<I>>>,
) -> Json<StatusSnapshot> {
    Json(dispatcher.status().await)
}

pub async fn handle_dispatch<I: Invoker>(
    State(dispatcher): State<Arc<Dispatcher<I>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<DispatchResult>, AppError> {
    let mut req: DispatchRequest = sonic_rs::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("请求体解析失败: {e}")))?;

    if req.caller_id.trim().is_empty()
        && let Some(v) = headers.get(CALLER_ID_HEADER).and_then(|v| v.to_str().ok())
    {
        req.caller_id = v.trim().to_string();
    }

    let result = dispatcher.dispatch(req).await?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{ApiStyle, Credential, Provider};
    use crate::dispatch::DispatchSettings;
    use crate::quota::QuotaLimits;
    use crate::upstream::{ApiError, Completion, PreparedCall};
    use crate::util::clock::ManualClock;
    use axum::http::{HeaderValue, StatusCode, header::RETRY_AFTER};
    use axum::response::IntoResponse;
    use std::collections::HashMap;

    #[derive(Debug)]
    struct EchoInvoker;

    impl Invoker for EchoInvoker {
        async fn invoke(
            &self,
            _provider: &Provider,
            credential: &Credential,
            call: &PreparedCall,
        ) -> Result<Completion, ApiError> {
            Ok(Completion {
                content: format!("{}:{}", credential.key_id, call.messages[0].content),
                model: call.model.clone(),
                total_tokens: None,
            })
        }
    }

    fn dispatcher(caller_limits: QuotaLimits) -> Arc<Dispatcher<EchoInvoker>> {
        let mut c = Credential::new("groq", 0, "gsk_test");
        c.models = vec!["m1".into()];
        let p = Provider {
            name: "groq".into(),
            priority: 1,
            api_style: ApiStyle::OpenAiCompatible,
            endpoint: "http://groq.invalid".into(),
            model_aliases: HashMap::new(),
            credentials: vec![c],
        };
        Arc::new(Dispatcher::new(
            vec![p],
            caller_limits,
            DispatchSettings::default(),
            100,
            EchoInvoker,
            Arc::new(ManualClock::at_epoch_boundary()),
        ))
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const BODY: &str =
        r#"{"operation":"summarize","payload":{"messages":[{"role":"user","content":"hi"}]}}"#;

    #[tokio::test]
    async fn dispatch_uses_caller_header_when_body_has_none() {
        let d = dispatcher(QuotaLimits::default());
        let mut headers = HeaderMap::new();
        headers.insert(CALLER_ID_HEADER, HeaderValue::from_static("alice"));

        let Json(res) = handle_dispatch(State(d), headers, Bytes::from_static(BODY.as_bytes()))
            .await
            .unwrap();
        assert_eq!(res.response.content, "groq#1:hi");
        assert_eq!(res.credential, "groq#1");
    }

    #[tokio::test]
    async fn missing_caller_is_bad_request() {
        let d = dispatcher(QuotaLimits::default());
        let resp = handle_dispatch(State(d), HeaderMap::new(), Bytes::from_static(BODY.as_bytes()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let v = body_json(resp).await;
        assert_eq!(v["error"]["type"], "bad_request");
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let d = dispatcher(QuotaLimits::default());
        let resp = handle_dispatch(State(d), HeaderMap::new(), Bytes::from_static(b"{not json"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn caller_quota_surfaces_as_429() {
        let d = dispatcher(QuotaLimits {
            per_minute: Some(1),
            ..QuotaLimits::default()
        });
        let mut headers = HeaderMap::new();
        headers.insert(CALLER_ID_HEADER, HeaderValue::from_static("alice"));

        let ok = handle_dispatch(State(d.clone()), headers.clone(), Bytes::from_static(BODY.as_bytes()))
            .await
            .into_response();
        assert_eq!(ok.status(), StatusCode::OK);

        let denied = handle_dispatch(State(d), headers, Bytes::from_static(BODY.as_bytes()))
            .await
            .into_response();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denied.headers().get(RETRY_AFTER).unwrap(), "60");
        let v = body_json(denied).await;
        assert_eq!(v["error"]["type"], "quota_exceeded");
        assert_eq!(v["error"]["window"], "minute");
    }

    #[tokio::test]
    async fn status_lists_providers() {
        let d = dispatcher(QuotaLimits::default());
        let Json(snap) = handle_status(State(d)).await;
        assert_eq!(snap.providers.len(), 1);
        assert!(snap.providers[0].available);
        assert_eq!(handle_health().await, "ok");
    }
}
