// 并发分片数策略
//
// 高峰时段限制并发，减少繁忙时段的带宽占用。
// 策略以 trait 注入，测试时不依赖系统时钟。

use crate::config::UploadConfig;
use chrono::{Local, NaiveTime, Timelike};

/// 并发分片数策略
pub trait ConcurrencyPolicy: Send + Sync {
    /// 给定本地时间下的并发分片数（至少为 1）
    fn limit_at(&self, now: NaiveTime) -> usize;

    /// 当前时间下的并发分片数
    fn current_limit(&self) -> usize {
        self.limit_at(Local::now().time())
    }
}

/// 按时段区分的并发策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeakHoursPolicy {
    /// 高峰开始（一天中的分钟数，含）
    pub peak_start_minute: u32,
    /// 高峰结束（一天中的分钟数，含）
    pub peak_end_minute: u32,
    /// 高峰并发数
    pub peak_limit: usize,
    /// 非高峰并发数
    pub off_peak_limit: usize,
}

impl PeakHoursPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            peak_start_minute: config.peak_start_minute,
            peak_end_minute: config.peak_end_minute,
            peak_limit: config.peak_concurrency,
            off_peak_limit: config.off_peak_concurrency,
        }
    }

    /// 是否处于高峰时段
    pub fn is_peak(&self, now: NaiveTime) -> bool {
        let minute = now.hour() * 60 + now.minute();
        minute >= self.peak_start_minute && minute <= self.peak_end_minute
    }
}

impl Default for PeakHoursPolicy {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}

impl ConcurrencyPolicy for PeakHoursPolicy {
    fn limit_at(&self, now: NaiveTime) -> usize {
        let limit = if self.is_peak(now) {
            self.peak_limit
        } else {
            self.off_peak_limit
        };
        limit.max(1)
    }
}

/// 固定并发数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedConcurrency(pub usize);

impl ConcurrencyPolicy for FixedConcurrency {
    fn limit_at(&self, _now: NaiveTime) -> usize {
        self.0.max(1)
    }
}

impl<F> ConcurrencyPolicy for F
where
    F: Fn(NaiveTime) -> usize + Send + Sync,
{
    fn limit_at(&self, now: NaiveTime) -> usize {
        self(now).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_peak_window_boundaries() {
        let policy = PeakHoursPolicy::default();

        assert_eq!(policy.limit_at(at(6, 59)), 2);
        assert_eq!(policy.limit_at(at(7, 0)), 5);
        assert_eq!(policy.limit_at(at(12, 0)), 5);
        assert_eq!(policy.limit_at(at(19, 30)), 5);
        assert_eq!(policy.limit_at(at(19, 31)), 2);
        assert_eq!(policy.limit_at(at(0, 0)), 2);
    }

    #[test]
    fn test_custom_table() {
        let policy = PeakHoursPolicy {
            peak_start_minute: 9 * 60,
            peak_end_minute: 17 * 60,
            peak_limit: 4,
            off_peak_limit: 0,
        };
        assert_eq!(policy.limit_at(at(10, 0)), 4);
        // 0 按 1 处理
        assert_eq!(policy.limit_at(at(20, 0)), 1);
    }

    #[test]
    fn test_fixed_and_closure_policies() {
        assert_eq!(FixedConcurrency(3).limit_at(at(8, 0)), 3);

        let by_hour = |now: NaiveTime| -> usize {
            if now.hour() < 12 {
                1
            } else {
                6
            }
        };
        assert_eq!(by_hour.limit_at(at(9, 0)), 1);
        assert_eq!(by_hour.limit_at(at(15, 0)), 6);
    }
}
