use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// 配额窗口种类。
///
/// minute/hour/day 按固定纪元（UTC）对齐滚动；month 为自然月，在每月 1 日 UTC 零点滚动；
/// request 为单次请求上限。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Minute,
    Hour,
    Day,
    Month,
    Request,
}

impl WindowKind {
    pub const ROLLING: [WindowKind; 4] = [Self::Minute, Self::Hour, Self::Day, Self::Month];

    /// 固定长度窗口的秒数；month 长度不固定，request 不是滚动窗口。
    fn fixed_secs(self) -> Option<i64> {
        match self {
            Self::Minute => Some(60),
            Self::Hour => Some(3_600),
            Self::Day => Some(86_400),
            Self::Month | Self::Request => None,
        }
    }

    /// 包含 `now` 的窗口起点（Unix 秒）。
    pub fn window_start(self, now: DateTime<Utc>) -> i64 {
        match self {
            Self::Month => month_start(now.date_naive()).unwrap_or_else(|| now.timestamp()),
            _ => match self.fixed_secs() {
                Some(d) => now.timestamp().div_euclid(d) * d,
                None => now.timestamp(),
            },
        }
    }

    /// 起点为 `start` 的窗口的结束时刻（即下一个窗口的起点）。
    pub fn window_end(self, start: i64) -> i64 {
        match self {
            Self::Month => DateTime::<Utc>::from_timestamp(start, 0)
                .and_then(|t| t.date_naive().checked_add_months(Months::new(1)))
                .and_then(month_start)
                .unwrap_or(start + 31 * 86_400),
            _ => start + self.fixed_secs().unwrap_or(0),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
            Self::Request => "request",
        }
    }
}

fn month_start(date: NaiveDate) -> Option<i64> {
    date.with_day(1)?
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc().timestamp())
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 配额计量单位。
///
/// 单次请求上限（`per_request`）总是与预估 token 数比较，与单位无关。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaUnit {
    /// 每次预留计 1。
    #[default]
    Requests,
    /// 按预估 token 数计费。
    Tokens,
}

impl QuotaUnit {
    pub fn cost_of(self, estimated_tokens: u64) -> u64 {
        match self {
            Self::Requests => 1,
            Self::Tokens => estimated_tokens,
        }
    }
}

/// 一组同时生效的配额上限。未配置（None）的窗口不做限制。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    pub unit: QuotaUnit,
    pub per_minute: Option<u64>,
    pub per_hour: Option<u64>,
    pub per_day: Option<u64>,
    pub per_month: Option<u64>,
    pub per_request: Option<u64>,
}

impl QuotaLimits {
    pub fn ceiling(&self, kind: WindowKind) -> Option<u64> {
        match kind {
            WindowKind::Minute => self.per_minute,
            WindowKind::Hour => self.per_hour,
            WindowKind::Day => self.per_day,
            WindowKind::Month => self.per_month,
            WindowKind::Request => self.per_request,
        }
    }

    /// 已配置的滚动窗口及其上限。
    pub fn rolling_windows(&self) -> impl Iterator<Item = (WindowKind, u64)> + '_ {
        WindowKind::ROLLING
            .into_iter()
            .filter_map(|k| self.ceiling(k).map(|c| (k, c)))
    }
}

/// 预留被拒绝的原因。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaDenial {
    /// 单次成本超过上限：直接失败，稍后重试也不会成功。
    #[error("单次请求成本 {requested} 超过上限 {ceiling}")]
    RequestTooLarge { ceiling: u64, requested: u64 },

    #[error("{window} 配额已用尽（已用 {used}/{ceiling}，本次 {requested}），{}s 后重置", .retry_after.as_secs())]
    WindowExceeded {
        window: WindowKind,
        ceiling: u64,
        used: u64,
        requested: u64,
        retry_after: Duration,
    },
}

impl QuotaDenial {
    pub fn window(&self) -> WindowKind {
        match self {
            Self::RequestTooLarge { .. } => WindowKind::Request,
            Self::WindowExceeded { window, .. } => *window,
        }
    }

    /// 建议的重试等待时间；单次超限没有意义，返回 None。
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RequestTooLarge { .. } => None,
            Self::WindowExceeded { retry_after, .. } => Some(*retry_after),
        }
    }
}

/// 一次成功预留的回执。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub cost: u64,
    /// 实际记入窗口的数量（cost + 本次顺带结算的事后修正）。
    pub charged: u64,
}

/// 某个窗口的当前用量（状态快照用）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowUsage {
    pub window: WindowKind,
    pub used: u64,
    pub ceiling: u64,
    pub resets_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_start_aligns_to_fixed_epoch() {
        let t = Utc.with_ymd_and_hms(2026, 3, 7, 13, 45, 12).unwrap();
        let day = Utc.with_ymd_and_hms(2026, 3, 7, 0, 0, 0).unwrap().timestamp();
        let hour = Utc.with_ymd_and_hms(2026, 3, 7, 13, 0, 0).unwrap().timestamp();
        let minute = Utc.with_ymd_and_hms(2026, 3, 7, 13, 45, 0).unwrap().timestamp();
        assert_eq!(WindowKind::Day.window_start(t), day);
        assert_eq!(WindowKind::Hour.window_start(t), hour);
        assert_eq!(WindowKind::Minute.window_start(t), minute);
    }

    #[test]
    fn month_window_follows_calendar() {
        let t = Utc.with_ymd_and_hms(2026, 2, 17, 9, 30, 0).unwrap();
        let feb = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap().timestamp();
        let mar = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap().timestamp();
        assert_eq!(WindowKind::Month.window_start(t), feb);
        assert_eq!(WindowKind::Month.window_end(feb), mar);

        // 12 月滚到次年 1 月。
        let dec = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap();
        let dec_start = WindowKind::Month.window_start(dec);
        assert_eq!(
            WindowKind::Month.window_end(dec_start),
            Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap().timestamp()
        );
        assert_eq!(WindowKind::Day.window_end(feb), feb + 86_400);
    }

    #[test]
    fn unit_cost() {
        assert_eq!(QuotaUnit::Requests.cost_of(900), 1);
        assert_eq!(QuotaUnit::Tokens.cost_of(900), 900);
    }

    #[test]
    fn limits_deserialize_with_defaults() {
        let l: QuotaLimits = serde_json::from_str(r#"{"unit":"tokens","per_day":1000}"#).unwrap();
        assert_eq!(l.unit, QuotaUnit::Tokens);
        assert_eq!(l.per_day, Some(1000));
        assert_eq!(l.per_minute, None);
        let windows: Vec<_> = l.rolling_windows().collect();
        assert_eq!(windows, vec![(WindowKind::Day, 1000)]);
        assert_eq!(QuotaLimits::default().rolling_windows().count(), 0);
    }

    #[test]
    fn denial_reports_window_and_retry_hint() {
        let too_large = QuotaDenial::RequestTooLarge {
            ceiling: 10,
            requested: 11,
        };
        assert_eq!(too_large.window(), WindowKind::Request);
        assert_eq!(too_large.retry_after(), None);

        let exceeded = QuotaDenial::WindowExceeded {
            window: WindowKind::Hour,
            ceiling: 5,
            used: 5,
            requested: 1,
            retry_after: Duration::from_secs(42),
        };
        assert_eq!(exceeded.window(), WindowKind::Hour);
        assert_eq!(exceeded.retry_after(), Some(Duration::from_secs(42)));
    }
}
