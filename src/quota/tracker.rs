use crate::quota::types::{
    QuotaDenial, QuotaLimits, QuotaUnit, Reservation, WindowKind, WindowUsage,
};
use crate::quota::window::QuotaWindow;
use crate::util::clock::Clock;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// 多窗口配额跟踪器：调用方（caller:*）与凭据（credential:*）共用同一套实现。
///
/// 每个 subject 一把互斥锁，预留时"检查全部窗口 → 全部提交"在同一临界区内完成，
/// 因此并发预留不会同时通过只该放行一个的检查。
#[derive(Debug)]
pub struct QuotaTracker {
    subjects: RwLock<HashMap<String, Arc<Mutex<SubjectState>>>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug)]
struct SubjectState {
    windows: BTreeMap<WindowKind, QuotaWindow>,
    /// 事后修正（实际 token 多于预估）待结算的差额，只在后续预留时计入。
    pending_correction: u64,
    estimated_total: u64,
    actual_total: u64,
}

impl SubjectState {
    fn new() -> Self {
        Self {
            windows: BTreeMap::new(),
            pending_correction: 0,
            estimated_total: 0,
            actual_total: 0,
        }
    }

    /// 所有窗口都已滚过、也没有待结算修正：删掉与保留没有区别。
    fn is_idle(&self, now: DateTime<Utc>) -> bool {
        self.pending_correction == 0 && self.windows.values().all(|w| w.is_expired(now))
    }

    /// 按当前配置准备窗口并滚动到 `now`。未在 limits 中出现的窗口保持原样（不参与本次检查）。
    fn sync_windows(&mut self, limits: &QuotaLimits, now: DateTime<Utc>) {
        for (kind, ceiling) in limits.rolling_windows() {
            let w = self
                .windows
                .entry(kind)
                .or_insert_with(|| QuotaWindow::new(kind, ceiling, now));
            w.set_ceiling(ceiling);
            w.roll(now);
        }
    }
}

/// 事后修正的统计信息。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CostTelemetry {
    pub estimated_total: u64,
    pub actual_total: u64,
    pub pending_correction: u64,
}

impl QuotaTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            subjects: RwLock::new(HashMap::new()),
            clock,
        }
    }

    async fn subject(&self, subject: &str) -> Arc<Mutex<SubjectState>> {
        if let Some(s) = self.subjects.read().await.get(subject) {
            return s.clone();
        }
        let mut subjects = self.subjects.write().await;
        subjects
            .entry(subject.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SubjectState::new())))
            .clone()
    }

    /// 原子地在全部已配置窗口上预留一次请求，`estimate` 为预估 token 数。
    ///
    /// - 单次上限与 `estimate` 比较（不论计量单位），先于滚动窗口检查，
    ///   超限直接拒绝（不是"稍后重试"）。
    /// - 滚动窗口按 `limits.unit` 计费：requests 计 1，tokens 计 `estimate`。
    /// - 任一窗口放不下则全部不计数，并报告第一个被违反的窗口。
    pub async fn reserve(
        &self,
        subject: &str,
        limits: &QuotaLimits,
        estimate: u64,
    ) -> Result<Reservation, QuotaDenial> {
        if let Some(denial) = oversized(limits, estimate) {
            return Err(denial);
        }
        let cost = limits.unit.cost_of(estimate);
        if limits.rolling_windows().next().is_none() {
            return Ok(Reservation {
                cost,
                charged: cost,
            });
        }

        let state = self.subject(subject).await;
        let mut st = state.lock().await;
        let now = self.clock.now();
        st.sync_windows(limits, now);

        for (kind, _) in limits.rolling_windows() {
            let Some(w) = st.windows.get(&kind) else {
                continue;
            };
            if !w.fits(cost) {
                return Err(QuotaDenial::WindowExceeded {
                    window: kind,
                    ceiling: w.ceiling(),
                    used: w.count(),
                    requested: cost,
                    retry_after: w.retry_after(now),
                });
            }
        }

        // 待结算的修正只占用本次提交后的剩余空间，绝不导致拒绝或超限。
        let mut correction = st.pending_correction;
        for (kind, _) in limits.rolling_windows() {
            if let Some(w) = st.windows.get(&kind) {
                correction = correction.min(w.headroom() - cost);
            }
        }
        let charged = cost + correction;
        for (kind, _) in limits.rolling_windows() {
            if let Some(w) = st.windows.get_mut(&kind) {
                w.commit(charged);
            }
        }
        st.pending_correction -= correction;

        Ok(Reservation { cost, charged })
    }

    /// 上报真实成本（例如后端返回的 token 数）。
    ///
    /// 只对按 token 计费的 subject 生效；差额记为待结算，留给后续预留，
    /// 已提交的计数不会被回溯修改。
    pub async fn record_actual(
        &self,
        subject: &str,
        limits: &QuotaLimits,
        estimated: u64,
        actual: u64,
    ) {
        if limits.unit != QuotaUnit::Tokens || limits.rolling_windows().next().is_none() {
            return;
        }
        let state = self.subject(subject).await;
        let mut st = state.lock().await;
        st.estimated_total = st.estimated_total.saturating_add(estimated);
        st.actual_total = st.actual_total.saturating_add(actual);
        if actual > estimated {
            st.pending_correction = st.pending_correction.saturating_add(actual - estimated);
        }
        tracing::trace!(subject, estimated, actual, "记录实际成本");
    }

    /// 各窗口当前用量；没有记录的 subject 视为全部为 0。
    pub async fn usage(&self, subject: &str, limits: &QuotaLimits) -> Vec<WindowUsage> {
        let now = self.clock.now();
        let existing = self.subjects.read().await.get(subject).cloned();
        let mut out = Vec::new();
        match existing {
            Some(state) => {
                let mut st = state.lock().await;
                st.sync_windows(limits, now);
                for (kind, _) in limits.rolling_windows() {
                    if let Some(w) = st.windows.get(&kind) {
                        out.push(WindowUsage {
                            window: kind,
                            used: w.count(),
                            ceiling: w.ceiling(),
                            resets_at: w.resets_at(),
                        });
                    }
                }
            }
            None => {
                for (kind, ceiling) in limits.rolling_windows() {
                    let w = QuotaWindow::new(kind, ceiling, now);
                    out.push(WindowUsage {
                        window: kind,
                        used: 0,
                        ceiling,
                        resets_at: w.resets_at(),
                    });
                }
            }
        }
        out
    }

    /// 若此刻预留 `estimate` 会被拒绝，返回对应的拒绝原因（只读，不预留）。
    pub async fn check(
        &self,
        subject: &str,
        limits: &QuotaLimits,
        estimate: u64,
    ) -> Option<QuotaDenial> {
        if let Some(denial) = oversized(limits, estimate) {
            return Some(denial);
        }
        let cost = limits.unit.cost_of(estimate);
        let now = self.clock.now();
        self.usage(subject, limits)
            .await
            .into_iter()
            .find(|u| u.used.saturating_add(cost) > u.ceiling)
            .map(|u| QuotaDenial::WindowExceeded {
                window: u.window,
                ceiling: u.ceiling,
                used: u.used,
                requested: cost,
                retry_after: (u.resets_at - now).to_std().unwrap_or_default(),
            })
    }

    pub async fn telemetry(&self, subject: &str) -> CostTelemetry {
        let Some(state) = self.subjects.read().await.get(subject).cloned() else {
            return CostTelemetry::default();
        };
        let st = state.lock().await;
        CostTelemetry {
            estimated_total: st.estimated_total,
            actual_total: st.actual_total,
            pending_correction: st.pending_correction,
        }
    }

    pub async fn subject_count(&self) -> usize {
        self.subjects.read().await.len()
    }

    /// 清理闲置 subject：全部窗口已滚动且没有待结算修正，且当前无人持有。
    ///
    /// 在写锁下判断 `strong_count`，保证不会删掉正在被预留使用的状态。
    pub async fn prune_idle(&self) -> usize {
        let now = self.clock.now();
        let mut subjects = self.subjects.write().await;
        let before = subjects.len();
        subjects.retain(|_, state| {
            if Arc::strong_count(state) > 1 {
                return true;
            }
            let Ok(st) = state.try_lock() else {
                return true;
            };
            !st.is_idle(now)
        });
        before - subjects.len()
    }
}

fn oversized(limits: &QuotaLimits, estimate: u64) -> Option<QuotaDenial> {
    let ceiling = limits.per_request?;
    (estimate > ceiling).then_some(QuotaDenial::RequestTooLarge {
        ceiling,
        requested: estimate,
    })
}
