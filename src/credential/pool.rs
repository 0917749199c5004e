use crate::credential::types::{Credential, Provider};
use crate::util::clock::Clock;
use crate::util::id;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// 凭据级健康判定参数（与 provider 级熔断相互独立）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSettings {
    pub failure_threshold: u32,
    pub suspend: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            suspend: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CredentialState {
    last_used: u64,
    consecutive_failures: u32,
    suspended_until: Option<DateTime<Utc>>,
    successes: u64,
    failures: u64,
    last_error: Option<String>,
}

#[derive(Debug)]
struct ProviderState {
    credentials: Vec<CredentialState>,
}

/// 状态快照中的单个凭据。
#[derive(Debug, Clone, Serialize)]
pub struct CredentialHealth {
    pub provider: String,
    pub key_id: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub suspended_until: Option<DateTime<Utc>>,
    pub successes: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

/// provider 集合及其凭据的健康、轮换状态。
#[derive(Debug)]
pub struct ProviderPool {
    providers: Vec<Arc<Provider>>,
    states: HashMap<String, Mutex<ProviderState>>,
    settings: ArcSwap<HealthSettings>,
    clock: Arc<dyn Clock>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ProviderPool {
    /// 按优先级排序（数值小者优先，同级保持配置顺序）；没有凭据的 provider 被丢弃。
    pub fn new(mut providers: Vec<Provider>, settings: HealthSettings, clock: Arc<dyn Clock>) -> Self {
        providers.retain(|p| {
            if p.credentials.is_empty() {
                tracing::warn!(provider = %p.name, "provider 没有可用凭据，已忽略");
                return false;
            }
            true
        });
        providers.sort_by_key(|p| p.priority);

        let states = providers
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    Mutex::new(ProviderState {
                        credentials: vec![CredentialState::default(); p.credentials.len()],
                    }),
                )
            })
            .collect();

        Self {
            providers: providers.into_iter().map(Arc::new).collect(),
            states,
            settings: ArcSwap::from_pointee(settings),
            clock,
        }
    }

    pub fn providers(&self) -> &[Arc<Provider>] {
        &self.providers
    }

    pub fn get(&self, name: &str) -> Option<Arc<Provider>> {
        self.providers.iter().find(|p| p.name == name).cloned()
    }

    pub fn settings(&self) -> HealthSettings {
        **self.settings.load()
    }

    pub fn update_settings(&self, settings: HealthSettings) {
        self.settings.store(Arc::new(settings));
    }

    /// 本次分发尝试 provider 的顺序：指定的 provider 最先，其余按静态优先级。
    pub fn ordered(&self, preferred: Option<&str>) -> Vec<Arc<Provider>> {
        let preferred = preferred.map(str::trim).filter(|s| !s.is_empty());
        let mut out = Vec::with_capacity(self.providers.len());
        if let Some(name) = preferred {
            match self.get(name) {
                Some(p) => out.push(p),
                None => tracing::debug!(provider = name, "指定的 provider 不存在，按默认优先级"),
            }
        }
        out.extend(
            self.providers
                .iter()
                .filter(|p| Some(p.name.as_str()) != preferred)
                .cloned(),
        );
        out
    }

    /// 按"最久未使用"排列该 provider 的凭据下标，并立即把队首标记为已使用，
    /// 使并发的分发从不同凭据开始。
    pub fn rotation_order(&self, provider: &Provider) -> Vec<usize> {
        let Some(state) = self.states.get(&provider.name) else {
            return Vec::new();
        };
        let mut st = lock(state);
        let mut order: Vec<usize> = (0..st.credentials.len()).collect();
        order.sort_by_key(|&i| (st.credentials[i].last_used, i));
        if let Some(&head) = order.first() {
            st.credentials[head].last_used = id::next_sequence();
        }
        order
    }

    /// 记录某个凭据刚被实际调用。
    pub fn mark_used(&self, credential: &Credential) {
        self.with_state(credential, |c| c.last_used = id::next_sequence());
    }

    pub fn is_healthy(&self, credential: &Credential) -> bool {
        let now = self.clock.now();
        self.with_state(credential, |c| match c.suspended_until {
            Some(until) => now >= until,
            None => true,
        })
        .unwrap_or(false)
    }

    pub fn suspended_until(&self, credential: &Credential) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.with_state(credential, |c| c.suspended_until.filter(|u| now < *u))
            .flatten()
    }

    pub fn record_success(&self, credential: &Credential) {
        self.with_state(credential, |c| {
            c.consecutive_failures = 0;
            c.suspended_until = None;
            c.successes += 1;
            c.last_error = None;
        });
    }

    /// 记录一次调用失败；连续失败达到阈值时暂停该凭据。返回本次是否触发了暂停。
    pub fn record_failure(&self, credential: &Credential, error: &str) -> bool {
        let settings = self.settings();
        let now = self.clock.now();
        let suspended = self.with_state(credential, |c| {
            c.failures += 1;
            c.last_error = Some(error.to_string());
            c.consecutive_failures += 1;
            if c.consecutive_failures >= settings.failure_threshold.max(1) {
                c.consecutive_failures = 0;
                c.suspended_until = Some(now + to_chrono(settings.suspend));
                return true;
            }
            false
        });
        let suspended = suspended.unwrap_or(false);
        if suspended {
            tracing::warn!(
                credential = %credential.key_id,
                threshold = settings.failure_threshold,
                suspend_secs = settings.suspend.as_secs(),
                "凭据连续失败达到阈值，暂停使用"
            );
        }
        suspended
    }

    /// 立即暂停（鉴权失败、上游给出 Retry-After 等）。不会缩短已有的暂停。
    pub fn suspend_for(&self, credential: &Credential, duration: Duration, reason: &str) {
        let until = self.clock.now() + to_chrono(duration);
        self.with_state(credential, |c| {
            c.consecutive_failures = 0;
            c.suspended_until = Some(c.suspended_until.map_or(until, |u| u.max(until)));
        });
        tracing::warn!(
            credential = %credential.key_id,
            secs = duration.as_secs(),
            reason,
            "凭据被暂停"
        );
    }

    pub fn health_snapshot(&self) -> Vec<CredentialHealth> {
        let now = self.clock.now();
        let mut out = Vec::new();
        for p in &self.providers {
            let Some(state) = self.states.get(&p.name) else {
                continue;
            };
            let st = lock(state);
            for (cred, c) in p.credentials.iter().zip(st.credentials.iter()) {
                let suspended_until = c.suspended_until.filter(|u| now < *u);
                out.push(CredentialHealth {
                    provider: p.name.clone(),
                    key_id: cred.key_id.clone(),
                    healthy: suspended_until.is_none(),
                    consecutive_failures: c.consecutive_failures,
                    suspended_until,
                    successes: c.successes,
                    failures: c.failures,
                    last_error: c.last_error.clone(),
                });
            }
        }
        out
    }

    fn with_state<R>(&self, credential: &Credential, f: impl FnOnce(&mut CredentialState) -> R) -> Option<R> {
        let state = self.states.get(&credential.provider)?;
        let mut st = lock(state);
        st.credentials.get_mut(credential.index).map(f)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}
