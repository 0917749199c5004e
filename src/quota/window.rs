use crate::quota::types::WindowKind;
use chrono::{DateTime, Utc};

/// 单个滚动窗口的计数。
///
/// 计数只会因"跨越窗口边界"而归零，其余时候只增不减。
#[derive(Debug, Clone)]
pub struct QuotaWindow {
    kind: WindowKind,
    ceiling: u64,
    count: u64,
    start: i64,
}

impl QuotaWindow {
    pub fn new(kind: WindowKind, ceiling: u64, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            ceiling,
            count: 0,
            start: kind.window_start(now),
        }
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// 配置热更新后同步上限；已计入的数量保持不变。
    pub fn set_ceiling(&mut self, ceiling: u64) {
        self.ceiling = ceiling;
    }

    /// `now` 是否已处于下一个窗口（计数实际为 0）。
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.kind.window_start(now) != self.start
    }

    /// 若 `now` 已进入新窗口则归零，返回是否发生了滚动。
    pub fn roll(&mut self, now: DateTime<Utc>) -> bool {
        let start = self.kind.window_start(now);
        if start != self.start {
            self.start = start;
            self.count = 0;
            return true;
        }
        false
    }

    pub fn fits(&self, cost: u64) -> bool {
        self.count.saturating_add(cost) <= self.ceiling
    }

    pub fn headroom(&self) -> u64 {
        self.ceiling.saturating_sub(self.count)
    }

    /// 调用方必须先用 `fits` 检查。
    pub fn commit(&mut self, amount: u64) {
        self.count = self.count.saturating_add(amount);
    }

    pub fn resets_at(&self) -> DateTime<Utc> {
        let end = self.kind.window_end(self.start);
        DateTime::<Utc>::from_timestamp(end, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn retry_after(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.resets_at() - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn roll_resets_only_across_boundary() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 58).unwrap();
        let mut w = QuotaWindow::new(WindowKind::Minute, 3, t0);
        w.commit(3);
        assert!(!w.fits(1));

        assert!(!w.roll(t0 + chrono::Duration::seconds(1)));
        assert_eq!(w.count(), 3);

        assert!(w.roll(t0 + chrono::Duration::seconds(2)));
        assert_eq!(w.count(), 0);
        assert!(w.fits(3));
    }

    #[test]
    fn month_window_rolls_on_the_first() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 31, 23, 0, 0).unwrap();
        let mut w = QuotaWindow::new(WindowKind::Month, 1_000, t0);
        w.commit(1_000);
        assert_eq!(
            w.resets_at(),
            Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(w.retry_after(t0), Duration::from_secs(3_600));

        // 跨天但未跨月：不滚动。
        assert!(!w.roll(Utc.with_ymd_and_hms(2026, 1, 31, 23, 59, 59).unwrap()));
        assert!(!w.fits(1));
        assert!(w.is_expired(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()));
        assert!(w.roll(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()));
        assert_eq!(w.count(), 0);
    }

    #[test]
    fn retry_after_counts_down_to_window_end() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 10, 59, 0).unwrap();
        let w = QuotaWindow::new(WindowKind::Hour, 1, t0);
        assert_eq!(w.retry_after(t0), Duration::from_secs(60));
        assert_eq!(
            w.resets_at(),
            Utc.with_ymd_and_hms(2026, 1, 1, 11, 0, 0).unwrap()
        );
    }
}
