// 重试策略
//
// 线性退避：第 n 次失败后等待 n × 步长（默认 500ms、1s）。
// 只重试网络错误和临时性服务端错误；取消、4xx 立即返回。
// 每次重试都是完整地重新调用传输层。

use crate::api::UploadError;
use crate::config::UploadConfig;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// 默认最大尝试次数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// 默认退避步长（毫秒）
pub const DEFAULT_BACKOFF_STEP_MS: u64 = 500;

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 退避步长
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_step: Duration::from_millis(DEFAULT_BACKOFF_STEP_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_step: Duration) -> Self {
        Self {
            max_attempts,
            backoff_step,
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(
            config.max_retry_attempts,
            Duration::from_millis(config.retry_backoff_ms),
        )
    }

    /// 第 `attempt` 次失败后的等待时间（attempt 从 1 开始）
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }

    /// 带重试执行操作
    ///
    /// # 参数
    /// * `cancel` - 取消令牌，触发后不再发起新的尝试
    /// * `label` - 日志前缀
    /// * `operation` - 操作，参数为当前尝试序号（从 1 开始）
    ///
    /// # 返回
    /// 操作结果，或用尽次数后的最后一个错误
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        label: &str,
        mut operation: F,
    ) -> Result<T, UploadError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if error.is_cancelled() {
                return Err(error);
            }

            if !error.is_retriable() {
                error!("{} 失败（不可重试, {}）: {}", label, error.kind(), error);
                return Err(error);
            }

            if attempt >= max_attempts {
                error!("{} 失败，已达最大尝试次数 ({}): {}", label, max_attempts, error);
                return Err(error);
            }

            let backoff = self.backoff_for(attempt);
            warn!(
                "{} 失败，等待 {}ms 后重试 ({}/{}): {}",
                label,
                backoff.as_millis(),
                attempt,
                max_attempts,
                error
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }

            attempt += 1;
        }
    }
}
