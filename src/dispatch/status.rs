use crate::breaker::{BreakerState, BreakerStatus};
use crate::cache::CacheStats;
use crate::credential::{ApiStyle, CredentialHealth, Provider};
use crate::dispatch::Dispatcher;
use crate::quota::{CostTelemetry, WindowUsage};
use crate::upstream::Invoker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /status` 返回的运维快照。
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub generated_at: DateTime<Utc>,
    /// 有任一后备存储处于降级（跳过）模式。
    pub degraded: bool,
    pub cache: CacheStats,
    pub providers: Vec<ProviderStatus>,
    pub breakers: Vec<BreakerStatus>,
    pub quota_subjects: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub priority: u32,
    pub api_style: ApiStyle,
    /// 熔断未打开，且至少有一个健康、未超额的凭据。
    pub available: bool,
    pub breaker: BreakerState,
    pub credentials: Vec<CredentialStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub key_id: String,
    pub masked_key: String,
    pub models: Vec<String>,
    pub healthy: bool,
    pub under_quota: bool,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub successes: u64,
    pub failures: u64,
    pub usage: Vec<WindowUsage>,
    /// 按 token 计量时，预估与实际成本的累计对比。
    pub cost: CostTelemetry,
}

impl<I: Invoker> Dispatcher<I> {
    pub async fn status(&self) -> StatusSnapshot {
        let mut health: HashMap<String, CredentialHealth> = self
            .pool
            .health_snapshot()
            .into_iter()
            .map(|h| (h.key_id.clone(), h))
            .collect();

        let providers = futures::future::join_all(
            self.pool
                .providers()
                .iter()
                .map(|p| (p.clone(), collect_health(&mut health, p)))
                .map(|(p, h)| async move { self.provider_status(&p, h).await }),
        )
        .await;

        let cache = self.cache.stats();
        StatusSnapshot {
            generated_at: self.clock.now(),
            degraded: cache.degraded,
            cache,
            providers,
            breakers: self.breakers.snapshot(),
            quota_subjects: self.quota.subject_count().await,
        }
    }

    async fn provider_status(
        &self,
        provider: &Provider,
        mut health: Vec<Option<CredentialHealth>>,
    ) -> ProviderStatus {
        let breaker = self.breakers.state(&provider.name);
        let mut credentials = Vec::with_capacity(provider.credentials.len());
        for (cred, h) in provider.credentials.iter().zip(health.iter_mut()) {
            let h = h.take().unwrap_or_else(|| CredentialHealth {
                provider: provider.name.clone(),
                key_id: cred.key_id.clone(),
                healthy: true,
                consecutive_failures: 0,
                suspended_until: None,
                successes: 0,
                failures: 0,
                last_error: None,
            });
            let subject = cred.quota_subject();
            let usage = self.quota.usage(&subject, &cred.limits).await;
            let cost = self.quota.telemetry(&subject).await;
            let under_quota = self
                .quota
                .check(&subject, &cred.limits, 1)
                .await
                .is_none();
            credentials.push(CredentialStatus {
                key_id: cred.key_id.clone(),
                masked_key: cred.masked_secret(),
                models: cred.models.clone(),
                healthy: h.healthy,
                under_quota,
                consecutive_failures: h.consecutive_failures,
                suspended_until: h.suspended_until,
                last_error: h.last_error,
                successes: h.successes,
                failures: h.failures,
                usage,
                cost,
            });
        }

        let available =
            breaker != BreakerState::Open && credentials.iter().any(|c| c.healthy && c.under_quota);
        ProviderStatus {
            name: provider.name.clone(),
            priority: provider.priority,
            api_style: provider.api_style,
            available,
            breaker,
            credentials,
        }
    }
}

fn collect_health(
    health: &mut HashMap<String, CredentialHealth>,
    provider: &Provider,
) -> Vec<Option<CredentialHealth>> {
    provider
        .credentials
        .iter()
        .map(|c| health.remove(&c.key_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::credential::{ApiStyle, Credential, Provider};
    use crate::dispatch::{CompletionPayload, DispatchRequest, DispatchSettings, Dispatcher};
    use crate::quota::{QuotaLimits, QuotaUnit};
    use crate::upstream::{ApiError, ChatMessage, Completion, Invoker, PreparedCall};
    use crate::util::clock::ManualClock;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[derive(Debug)]
    struct FailingInvoker;

    /// 返回固定 token 用量。
    #[derive(Debug)]
    struct MeteredInvoker;

    impl Invoker for MeteredInvoker {
        async fn invoke(
            &self,
            _provider: &Provider,
            _credential: &Credential,
            call: &PreparedCall,
        ) -> Result<Completion, ApiError> {
            Ok(Completion {
                content: "ok".into(),
                model: call.model.clone(),
                total_tokens: Some(900),
            })
        }
    }

    impl Invoker for FailingInvoker {
        async fn invoke(
            &self,
            _provider: &Provider,
            _credential: &Credential,
            _call: &PreparedCall,
        ) -> Result<Completion, ApiError> {
            Err(ApiError::Http {
                status: 500,
                message: "down".into(),
                retry_after: None,
            })
        }
    }

    fn request() -> DispatchRequest {
        DispatchRequest {
            operation: "op".into(),
            caller_id: "bob".into(),
            payload: CompletionPayload {
                model: None,
                messages: vec![ChatMessage::user("hi")],
                temperature: None,
                max_tokens: None,
            },
            preferred_provider: None,
            idempotent: false,
            cost: None,
        }
    }

    fn provider() -> Provider {
        let mut c = Credential::new("groq", 0, "gsk_secret_value");
        c.models = vec!["m1".into()];
        c.limits = QuotaLimits {
            per_day: Some(10),
            ..QuotaLimits::default()
        };
        Provider {
            name: "groq".into(),
            priority: 1,
            api_style: ApiStyle::OpenAiCompatible,
            endpoint: "http://groq.invalid".into(),
            model_aliases: HashMap::new(),
            credentials: vec![c],
        }
    }

    #[tokio::test]
    async fn snapshot_reports_usage_health_and_breaker() {
        let mut settings = DispatchSettings::default();
        settings.breaker.failure_threshold = 1;
        let d = Dispatcher::new(
            vec![provider()],
            QuotaLimits::default(),
            settings,
            100,
            FailingInvoker,
            Arc::new(ManualClock::at_epoch_boundary()),
        );
        assert!(d.dispatch(request()).await.is_err());

        let snap = d.status().await;
        assert_eq!(
            snap.generated_at,
            chrono::TimeZone::with_ymd_and_hms(&chrono::Utc, 2026, 1, 1, 0, 0, 0).unwrap()
        );
        assert!(!snap.degraded);
        // 调用方未配置上限，不会建立 subject。
        assert_eq!(snap.quota_subjects, 1);
        let p = &snap.providers[0];
        assert_eq!(p.name, "groq");
        assert!(!p.available);
        assert_eq!(p.breaker, crate::breaker::BreakerState::Open);
        let c = &p.credentials[0];
        assert_eq!(c.masked_key, "gsk_…");
        assert_eq!(c.consecutive_failures, 1);
        assert_eq!(c.usage.len(), 1);
        assert_eq!(c.usage[0].used, 1);
        assert_eq!(c.usage[0].ceiling, 10);
        assert!(c.under_quota);
        assert_eq!(c.cost, crate::quota::CostTelemetry::default());

        let json = serde_json::to_value(&snap).unwrap();
        assert!(!json.to_string().contains("gsk_secret_value"));
        assert_eq!(json["breakers"][0]["state"], "open");
    }

    #[tokio::test]
    async fn snapshot_reports_token_cost_telemetry() {
        let mut p = provider();
        p.credentials[0].limits = QuotaLimits {
            unit: QuotaUnit::Tokens,
            per_day: Some(100_000),
            ..QuotaLimits::default()
        };
        let d = Dispatcher::new(
            vec![p],
            QuotaLimits::default(),
            DispatchSettings::default(),
            100,
            MeteredInvoker,
            Arc::new(ManualClock::at_epoch_boundary()),
        );
        let mut req = request();
        req.cost = Some(300);
        d.dispatch(req).await.unwrap();

        let snap = d.status().await;
        let c = &snap.providers[0].credentials[0];
        assert_eq!(c.cost.estimated_total, 300);
        assert_eq!(c.cost.actual_total, 900);
        assert_eq!(c.cost.pending_correction, 600);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["providers"][0]["credentials"][0]["cost"]["actual_total"], 900);
    }
}
