//! 时间源抽象。
//!
//! 配额窗口按固定纪元对齐、熔断冷却按截止时间判断，二者都依赖"当前时间"。
//! 生产环境使用系统时钟；测试中用 `ManualClock` 精确推进时间，避免真实等待。

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
    use super::Clock;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    /// 手动推进的时钟（仅测试）。
    #[derive(Debug)]
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn at(now: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(now),
            }
        }

        /// 2026-01-01T00:00:00Z，恰好处于分钟/小时/天边界。
        pub fn at_epoch_boundary() -> Self {
            Self::at(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
        }

        pub fn advance(&self, d: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::from_std(d).unwrap();
        }

        pub fn set(&self, t: DateTime<Utc>) {
            *self.now.lock().unwrap() = t;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }
}
