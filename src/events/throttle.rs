//! 进度事件节流器
//!
//! 控制字节级进度回调的发布频率，避免事件风暴（建议 200-250ms）

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 尚未发布过事件
const NEVER_EMITTED: u64 = u64::MAX;

/// 进度事件节流器
///
/// 线程安全，使用原子操作避免锁竞争。
/// 每次更新进度时调用 `should_emit()`，返回 true 时才发布；首次调用总是返回 true
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 计时起点
    origin: Instant,
    /// 上次发布时距起点的纳秒数
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    /// 创建新的节流器
    ///
    /// # 参数
    /// * `interval` - 最小发布间隔
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(NEVER_EMITTED),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    /// 使用指定毫秒间隔创建节流器
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查是否应该发布事件
    ///
    /// 距离上次发布超过节流间隔时返回 true 并更新时间戳
    pub fn should_emit(&self) -> bool {
        let now = self.elapsed_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        let due = last == NEVER_EMITTED || now.saturating_sub(last) >= self.interval_nanos;
        if !due {
            return false;
        }

        // 被其他线程抢先更新时本次不发布
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制发布（最后一次更新时使用）
    pub fn force_emit(&self) -> bool {
        self.last_emit_nanos
            .store(self.elapsed_nanos(), Ordering::Relaxed);
        true
    }

    /// 重置节流器状态
    pub fn reset(&self) {
        self.last_emit_nanos.store(NEVER_EMITTED, Ordering::Relaxed);
    }

    fn elapsed_nanos(&self) -> u64 {
        // NEVER_EMITTED 保留给哨兵
        (self.origin.elapsed().as_nanos() as u64).min(NEVER_EMITTED - 1)
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
