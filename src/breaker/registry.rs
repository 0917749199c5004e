use crate::breaker::types::{BreakerRejection, BreakerSettings, BreakerState, BreakerStatus};
use crate::util::clock::Clock;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// 所有具名依赖的熔断状态（进程级共享）。
///
/// 临界区很短且不跨 await，使用同步锁；放行许可在 Drop 时能可靠归还探测名额。
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    circuits: Mutex<HashMap<String, Arc<Mutex<Circuit>>>>,
    settings: ArcSwap<BreakerSettings>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct Circuit {
    failures: u32,
    open_until: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    times_opened: u64,
}

impl Circuit {
    fn state(&self, now: DateTime<Utc>) -> BreakerState {
        match self.open_until {
            None => BreakerState::Closed,
            Some(until) if now < until => BreakerState::Open,
            Some(_) => BreakerState::HalfOpen,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Normal,
    Probe,
}

/// 一次被放行的调用。必须交回 `record_success` / `record_failure`；
/// 若被直接丢弃（例如调用被取消），探测名额会被释放，且不计为失败。
#[derive(Debug)]
pub struct BreakerPermit {
    name: String,
    circuit: Arc<Mutex<Circuit>>,
    kind: PermitKind,
    settled: bool,
}

impl BreakerPermit {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_probe(&self) -> bool {
        self.kind == PermitKind::Probe
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.kind == PermitKind::Probe {
            lock(&self.circuit).probe_in_flight = false;
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl CircuitBreakerRegistry {
    pub fn new(settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            settings: ArcSwap::from_pointee(settings),
            clock,
        }
    }

    pub fn settings(&self) -> BreakerSettings {
        **self.settings.load()
    }

    pub fn update_settings(&self, settings: BreakerSettings) {
        self.settings.store(Arc::new(settings));
    }

    fn circuit(&self, name: &str) -> Arc<Mutex<Circuit>> {
        lock(&self.circuits)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// 询问是否允许调用 `name`。拒绝本身不会改变任何计数。
    pub fn acquire(&self, name: &str) -> Result<BreakerPermit, BreakerRejection> {
        let circuit = self.circuit(name);
        let kind = {
            let mut c = lock(&circuit);
            let now = self.clock.now();
            let open_until = c.open_until;
            match open_until {
                None => PermitKind::Normal,
                Some(until) if now < until => {
                    return Err(BreakerRejection {
                        name: name.to_string(),
                        open_until: until,
                    });
                }
                Some(until) => {
                    if c.probe_in_flight {
                        return Err(BreakerRejection {
                            name: name.to_string(),
                            open_until: until,
                        });
                    }
                    c.probe_in_flight = true;
                    tracing::info!(breaker = %name, "熔断冷却结束，放行一次探测调用");
                    PermitKind::Probe
                }
            }
        };
        Ok(BreakerPermit {
            name: name.to_string(),
            circuit,
            kind,
            settled: false,
        })
    }

    pub fn record_success(&self, mut permit: BreakerPermit) {
        permit.settled = true;
        let mut c = lock(&permit.circuit);
        match permit.kind {
            PermitKind::Probe => {
                c.open_until = None;
                c.probe_in_flight = false;
                c.failures = 0;
                tracing::info!(breaker = %permit.name, "探测成功，熔断器关闭");
            }
            PermitKind::Normal => {
                // 打开期间才返回的旧调用不影响状态；只有探测能关闭熔断器。
                if c.open_until.is_none() {
                    c.failures = 0;
                }
            }
        }
    }

    pub fn record_failure(&self, mut permit: BreakerPermit) {
        permit.settled = true;
        let settings = self.settings();
        let now = self.clock.now();
        let cooldown = chrono::Duration::from_std(settings.cooldown)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut c = lock(&permit.circuit);
        match permit.kind {
            PermitKind::Probe => {
                c.open_until = Some(now + cooldown);
                c.probe_in_flight = false;
                c.failures = 0;
                c.times_opened += 1;
                tracing::warn!(
                    breaker = %permit.name,
                    cooldown_secs = settings.cooldown.as_secs(),
                    "探测失败，熔断器重新打开"
                );
            }
            PermitKind::Normal => {
                if c.open_until.is_some() {
                    return;
                }
                c.failures += 1;
                if c.failures >= settings.failure_threshold.max(1) {
                    c.open_until = Some(now + cooldown);
                    c.failures = 0;
                    c.times_opened += 1;
                    tracing::warn!(
                        breaker = %permit.name,
                        threshold = settings.failure_threshold,
                        cooldown_secs = settings.cooldown.as_secs(),
                        "连续失败达到阈值，熔断器打开"
                    );
                }
            }
        }
    }

    pub fn state(&self, name: &str) -> BreakerState {
        let now = self.clock.now();
        match lock(&self.circuits).get(name) {
            Some(c) => lock(c).state(now),
            None => BreakerState::Closed,
        }
    }

    pub fn snapshot(&self) -> Vec<BreakerStatus> {
        let now = self.clock.now();
        let circuits = lock(&self.circuits);
        let mut out: Vec<BreakerStatus> = circuits
            .iter()
            .map(|(name, c)| {
                let c = lock(c);
                BreakerStatus {
                    name: name.clone(),
                    state: c.state(now),
                    consecutive_failures: c.failures,
                    open_until: c.open_until,
                    times_opened: c.times_opened,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
