use crate::breaker::{BreakerSettings, CircuitBreakerRegistry};
use crate::cache::{CacheKey, CacheSettings, ResultCache};
use crate::config::Config;
use crate::credential::{Credential, DEFAULT_MAX_TOKENS_PER_CALL, HealthSettings, Provider, ProviderPool};
use crate::dispatch::types::{
    Attempt, AttemptOutcome, CompletionResponse, DispatchRequest, DispatchResult,
};
use crate::error::DispatchError;
use crate::logging::{self, LogLevel};
use crate::quota::{QuotaLimits, QuotaTracker};
use crate::upstream::{ApiError, HttpInvoker, Invoker, PreparedCall};
use crate::util::clock::Clock;
use crate::util::id;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 可在运行时整体替换的分发参数。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchSettings {
    pub call_timeout: Duration,
    pub log_level: LogLevel,
    pub breaker: BreakerSettings,
    pub health: HealthSettings,
    pub cache: CacheSettings,
}

impl DispatchSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            call_timeout: cfg.call_timeout(),
            log_level: cfg.log_level(),
            breaker: cfg.breaker_settings(),
            health: cfg.health_settings(),
            cache: cfg.cache_settings(),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// 分发器：持有 provider 池、配额、熔断与缓存，负责一次请求的完整回退链。
pub struct Dispatcher<I: Invoker = HttpInvoker> {
    pub(crate) pool: ProviderPool,
    pub(crate) quota: Arc<QuotaTracker>,
    pub(crate) breakers: CircuitBreakerRegistry,
    pub(crate) cache: ResultCache,
    invoker: I,
    caller_limits: ArcSwap<QuotaLimits>,
    settings: ArcSwap<DispatchSettings>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl<I: Invoker> Dispatcher<I> {
    pub fn new(
        providers: Vec<Provider>,
        caller_limits: QuotaLimits,
        settings: DispatchSettings,
        cache_capacity: u64,
        invoker: I,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool: ProviderPool::new(providers, settings.health, clock.clone()),
            quota: Arc::new(QuotaTracker::new(clock.clone())),
            breakers: CircuitBreakerRegistry::new(settings.breaker, clock.clone()),
            cache: ResultCache::in_memory(cache_capacity, settings.cache, clock.clone()),
            invoker,
            caller_limits: ArcSwap::from_pointee(caller_limits),
            settings: ArcSwap::from_pointee(settings),
            clock,
        }
    }

    pub fn from_config(cfg: &Config, invoker: I, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            cfg.build_providers(),
            cfg.caller_limits.clone(),
            DispatchSettings::from_config(cfg),
            cfg.cache.capacity,
            invoker,
            clock,
        )
    }

    pub fn quota(&self) -> Arc<QuotaTracker> {
        self.quota.clone()
    }

    pub fn settings(&self) -> DispatchSettings {
        **self.settings.load()
    }

    /// 替换运行时参数，并同步到熔断、凭据健康与缓存。
    pub fn update_settings(&self, settings: DispatchSettings) {
        self.breakers.update_settings(settings.breaker);
        self.pool.update_settings(settings.health);
        self.cache.update_settings(settings.cache);
        self.settings.store(Arc::new(settings));
    }

    pub fn caller_limits(&self) -> QuotaLimits {
        (**self.caller_limits.load()).clone()
    }

    pub fn update_caller_limits(&self, limits: QuotaLimits) {
        self.caller_limits.store(Arc::new(limits));
    }

    pub async fn dispatch(&self, req: DispatchRequest) -> Result<DispatchResult, DispatchError> {
        let request_id = id::request_id();
        let settings = self.settings();
        let started = Instant::now();
        validate(&req)?;

        // 1. 调用方配额：失败则不联系任何 provider。
        let caller_subject = format!("caller:{}", req.caller_id.trim());
        let caller_limits = self.caller_limits();
        let caller_estimate = req.cost.unwrap_or_else(|| {
            req.payload
                .estimate_tokens(req.payload.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS_PER_CALL))
        });
        if let Err(denial) = self
            .quota
            .reserve(&caller_subject, &caller_limits, caller_estimate)
            .await
        {
            tracing::info!(
                request_id = %request_id,
                caller = %req.caller_id,
                window = %denial.window(),
                "调用方配额不足: {denial}"
            );
            return Err(DispatchError::QuotaExceeded {
                caller_id: req.caller_id.clone(),
                denial,
            });
        }

        // 2. 结果缓存包住整条回退链；只有幂等请求参与。
        let mut attempts = Vec::new();
        let outcome = if req.idempotent {
            match CacheKey::new(&req.operation, &req.payload) {
                Ok(key) => {
                    let trail = &mut attempts;
                    let req_ref = &req;
                    let settings_ref = &settings;
                    self.cache
                        .get_or_compute(&key, settings.cache.ttl, move || async move {
                            self.run_chain(req_ref, settings_ref, trail).await
                        })
                        .await
                        .map(|c| (c.value, c.from_cache))
                }
                Err(e) => {
                    tracing::warn!(request_id = %request_id, error = %e, "无法生成缓存键，跳过缓存");
                    self.run_chain(&req, &settings, &mut attempts)
                        .await
                        .map(|r| (r, false))
                }
            }
        } else {
            self.run_chain(&req, &settings, &mut attempts)
                .await
                .map(|r| (r, false))
        };

        match outcome {
            Ok((response, cached)) => {
                if !cached {
                    let actual = response.total_tokens.unwrap_or(caller_estimate);
                    self.quota
                        .record_actual(&caller_subject, &caller_limits, caller_estimate, actual)
                        .await;
                }
                if settings.log_level.outcomes_enabled() {
                    tracing::info!(
                        request_id = %request_id,
                        caller = %req.caller_id,
                        provider = %response.provider,
                        credential = %response.credential,
                        cached,
                        attempts = attempts.len(),
                        elapsed_ms = logging::format_duration_ms(started.elapsed()),
                        "分发成功"
                    );
                }
                Ok(DispatchResult {
                    request_id,
                    provider: response.provider.clone(),
                    credential: response.credential.clone(),
                    fallback_used: !cached && !attempts.is_empty(),
                    cached,
                    attempts,
                    response,
                })
            }
            Err(e) => {
                tracing::warn!(
                    request_id = %request_id,
                    caller = %req.caller_id,
                    elapsed_ms = logging::format_duration_ms(started.elapsed()),
                    "分发失败: {e}"
                );
                Err(e)
            }
        }
    }

    /// 按优先级、凭据轮换顺序依次尝试，第一个成功即返回。
    async fn run_chain(
        &self,
        req: &DispatchRequest,
        settings: &DispatchSettings,
        attempts: &mut Vec<Attempt>,
    ) -> Result<CompletionResponse, DispatchError> {
        for provider in self.pool.ordered(req.preferred_provider.as_deref()) {
            for idx in self.pool.rotation_order(&provider) {
                let Some(cred) = provider.credentials.get(idx) else {
                    continue;
                };
                match self.try_credential(req, settings, &provider, cred).await {
                    Step::Done(resp) => return Ok(resp),
                    Step::Next(outcome) => {
                        record(settings, attempts, &provider, cred, outcome);
                    }
                    Step::SkipProvider(outcome) => {
                        record(settings, attempts, &provider, cred, outcome);
                        break;
                    }
                }
            }
        }
        Err(DispatchError::AllProvidersExhausted {
            attempts: attempts.clone(),
        })
    }

    /// 健康 → 模型能力 → 熔断 → 凭据配额 → 调用。
    async fn try_credential(
        &self,
        req: &DispatchRequest,
        settings: &DispatchSettings,
        provider: &Provider,
        cred: &Credential,
    ) -> Step {
        if !self.pool.is_healthy(cred) {
            return Step::Next(AttemptOutcome::Suspended {
                until: self.pool.suspended_until(cred),
            });
        }

        let Some(model) = provider.resolve_model(req.payload.model.as_deref(), cred) else {
            return Step::Next(AttemptOutcome::ModelUnsupported {
                model: req.payload.model.clone().unwrap_or_default(),
            });
        };

        let permit = match self.breakers.acquire(&provider.name) {
            Ok(p) => p,
            Err(rejection) => {
                return Step::SkipProvider(AttemptOutcome::CircuitOpen {
                    open_until: rejection.open_until,
                });
            }
        };

        let max_tokens = cred.clamp_max_tokens(req.payload.max_tokens);
        let estimate = req
            .cost
            .unwrap_or_else(|| req.payload.estimate_tokens(max_tokens));
        let subject = cred.quota_subject();
        if let Err(denial) = self
            .quota
            .reserve(&subject, &cred.limits, estimate)
            .await
        {
            // 未发出调用：许可直接丢弃，不计成功也不计失败。
            drop(permit);
            return Step::Next(AttemptOutcome::quota_denied(&denial));
        }

        self.pool.mark_used(cred);
        let call = PreparedCall {
            model,
            messages: req.payload.messages.clone(),
            temperature: req.payload.temperature,
            max_tokens,
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(
            settings.call_timeout,
            self.invoker.invoke(provider, cred, &call),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(ApiError::Timeout(settings.call_timeout)),
        };

        match result {
            Ok(completion) => {
                self.breakers.record_success(permit);
                self.pool.record_success(cred);
                let actual = completion.total_tokens.unwrap_or(estimate);
                self.quota
                    .record_actual(&subject, &cred.limits, estimate, actual)
                    .await;
                if settings.log_level.attempts_enabled() {
                    tracing::info!(
                        provider = %provider.name,
                        credential = %cred.key_id,
                        model = %completion.model,
                        elapsed_ms = logging::format_duration_ms(started.elapsed()),
                        "调用成功"
                    );
                }
                Step::Done(CompletionResponse {
                    content: completion.content,
                    model: completion.model,
                    provider: provider.name.clone(),
                    credential: cred.key_id.clone(),
                    total_tokens: completion.total_tokens,
                })
            }
            Err(e) => {
                self.breakers.record_failure(permit);
                let message = e.to_string();
                self.pool.record_failure(cred, &message);
                if let Some(d) = e.suspend_hint(settings.health.suspend) {
                    let reason = if e.is_auth_failure() {
                        "鉴权失败"
                    } else {
                        "上游限流"
                    };
                    self.pool.suspend_for(cred, d, reason);
                }
                Step::Next(AttemptOutcome::CallFailed {
                    status: e.status(),
                    error: message,
                })
            }
        }
    }
}

enum Step {
    Done(CompletionResponse),
    Next(AttemptOutcome),
    /// 熔断打开：该 provider 的其余凭据也不再尝试。
    SkipProvider(AttemptOutcome),
}

fn record(
    settings: &DispatchSettings,
    attempts: &mut Vec<Attempt>,
    provider: &Provider,
    cred: &Credential,
    outcome: AttemptOutcome,
) {
    if settings.log_level.attempts_enabled() {
        tracing::info!(
            provider = %provider.name,
            credential = %cred.key_id,
            reason = outcome.as_str(),
            "跳过: {outcome:?}"
        );
    } else {
        tracing::debug!(
            provider = %provider.name,
            credential = %cred.key_id,
            reason = outcome.as_str(),
            "跳过"
        );
    }
    attempts.push(Attempt {
        provider: provider.name.clone(),
        credential: cred.key_id.clone(),
        outcome,
    });
}

fn validate(req: &DispatchRequest) -> Result<(), DispatchError> {
    if req.caller_id.trim().is_empty() {
        return Err(DispatchError::InvalidRequest("caller_id 不能为空".into()));
    }
    if req.operation.trim().is_empty() {
        return Err(DispatchError::InvalidRequest("operation 不能为空".into()));
    }
    if req.payload.messages.is_empty() {
        return Err(DispatchError::InvalidRequest("messages 不能为空".into()));
    }
    Ok(())
}
