// 完成通知与状态轮询
//
// 所有分片上传后通知后端合并，再按固定间隔轮询处理状态，直到：
// - 成功并返回对象
// - 后端报告失败或会话过期
// - 达到轮询上限（超时）
// - 任务被取消

use crate::api::{ChunkedStatusResponse, SessionStatus, StorageApi, UploadError, UploadedObject};
use crate::config::UploadConfig;
use crate::uploader::task::Phase;
use crate::uploader::{ProgressReporter, ProgressUpdate, UploadSession, UploadTask};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 对一次状态响应的判定
#[derive(Debug, Clone, PartialEq)]
pub enum StatusVerdict {
    /// 还在上传/排队，继续轮询
    Pending,
    /// 后端处理中，继续轮询
    Processing,
    /// 处理成功
    Completed(UploadedObject),
    /// 处理失败（终态）
    Failed(String),
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// 判定状态响应
///
/// 失败信息优先取 error，其次 message
pub fn evaluate_status(response: &ChunkedStatusResponse) -> StatusVerdict {
    let status = response.session_status();
    let error = non_empty(&response.error);
    let message = non_empty(&response.message);

    if response.is_complete {
        if let (Some(object), None) = (&response.object, error) {
            return StatusVerdict::Completed(object.clone());
        }
    }

    if error.is_some() || status == SessionStatus::Failed {
        return StatusVerdict::Failed(
            error.or(message).unwrap_or("Processing failed").to_string(),
        );
    }

    if status == SessionStatus::Expired {
        return StatusVerdict::Failed(message.unwrap_or("Upload session expired").to_string());
    }

    if response.is_complete {
        return StatusVerdict::Failed(
            message
                .unwrap_or("Upload completed but no file was created")
                .to_string(),
        );
    }

    match status {
        SessionStatus::Processing => StatusVerdict::Processing,
        _ => StatusVerdict::Pending,
    }
}

/// 完成通知与轮询器
pub struct CompletionPoller {
    api: Arc<dyn StorageApi>,
    /// 轮询间隔
    interval: Duration,
    /// 最大轮询次数
    max_attempts: u32,
}

impl CompletionPoller {
    pub fn new(api: Arc<dyn StorageApi>, interval: Duration, max_attempts: u32) -> Self {
        Self {
            api,
            interval,
            max_attempts,
        }
    }

    pub fn from_config(api: Arc<dyn StorageApi>, config: &UploadConfig) -> Self {
        Self::new(
            api,
            Duration::from_millis(config.poll_interval_ms),
            config.max_poll_attempts,
        )
    }

    /// 通知完成并等待后端处理结束
    ///
    /// # 返回
    /// 后端创建的对象；失败、超时或取消时返回对应错误
    pub async fn finish(
        &self,
        task: &UploadTask,
        session: &UploadSession,
        reporter: &ProgressReporter,
    ) -> Result<UploadedObject, UploadError> {
        let cancel = &task.cancel_token;

        reporter.report(
            ProgressUpdate::new(Phase::Processing)
                .percent(88)
                .message("Finalizing..."),
        );

        let response = self
            .api
            .complete_session(&task.bucket_id, &session.upload_id, cancel)
            .await?;
        info!(
            "[{}] 已通知后端合并分片: upload_id={}, status={}",
            task.id, session.upload_id, response.status
        );

        reporter.report(
            ProgressUpdate::new(Phase::Processing)
                .percent(90)
                .message("Processing file..."),
        );

        self.poll(task, session, reporter).await
    }

    /// 轮询处理状态
    pub async fn poll(
        &self,
        task: &UploadTask,
        session: &UploadSession,
        reporter: &ProgressReporter,
    ) -> Result<UploadedObject, UploadError> {
        let cancel = &task.cancel_token;

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }

            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let response = match self
                .api
                .session_status(&task.bucket_id, &session.upload_id, cancel)
                .await
            {
                Ok(response) => response,
                // 临时性错误只消耗一次轮询机会
                Err(e) if e.is_retriable() => {
                    warn!(
                        "[{}] 状态查询失败 ({}/{}): {}",
                        task.id, attempt, self.max_attempts, e
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            match evaluate_status(&response) {
                StatusVerdict::Completed(object) => {
                    info!(
                        "[{}] 后端处理完成: object_id={}, 轮询 {} 次",
                        task.id, object.id, attempt
                    );
                    return Ok(object);
                }
                StatusVerdict::Failed(message) => {
                    warn!("[{}] 后端处理失败: {}", task.id, message);
                    return Err(UploadError::Processing(message));
                }
                StatusVerdict::Processing => {
                    debug!("[{}] 后端处理中 ({}/{})", task.id, attempt, self.max_attempts);
                    reporter.report(
                        ProgressUpdate::new(Phase::Processing)
                            .percent(95)
                            .message("Verifying integrity..."),
                    );
                }
                StatusVerdict::Pending => {
                    debug!(
                        "[{}] 状态: {} ({}/{})",
                        task.id, response.status, attempt, self.max_attempts
                    );
                }
            }
        }

        warn!(
            "[{}] 轮询 {} 次仍未完成，判定超时",
            task.id, self.max_attempts
        );
        Err(UploadError::Timeout("Processing timeout".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::testing::{completed_status, object, status, MockStorageApi};
    use crate::uploader::UploadFile;
    use tokio_util::sync::CancellationToken;

    fn task() -> UploadTask {
        UploadTask::new(
            "bucket-1",
            "",
            UploadFile::from_bytes("big.bin", vec![0u8; 16]),
            CancellationToken::new(),
        )
    }

    fn session() -> UploadSession {
        UploadSession {
            upload_id: "session-1".to_string(),
            chunk_size: 8,
            total_chunks: 2,
            temp_prefix: None,
            expires_at: None,
        }
    }

    fn poller(api: Arc<MockStorageApi>, max_attempts: u32) -> CompletionPoller {
        CompletionPoller::new(api, Duration::from_millis(1), max_attempts)
    }

    #[test]
    fn test_evaluate_completed() {
        assert_eq!(
            evaluate_status(&completed_status("a.bin", 3)),
            StatusVerdict::Completed(object("a.bin", 3))
        );
        assert_eq!(evaluate_status(&status("PROCESSING", false)), StatusVerdict::Processing);
        assert_eq!(evaluate_status(&status("UPLOADING", false)), StatusVerdict::Pending);
    }

    #[test]
    fn test_evaluate_failure_messages() {
        // error 优先于 message
        let mut response = status("FAILED", false);
        response.error = Some("checksum mismatch".to_string());
        response.message = Some("ignored".to_string());
        assert_eq!(
            evaluate_status(&response),
            StatusVerdict::Failed("checksum mismatch".to_string())
        );

        // 数字状态 500 视为失败
        assert_eq!(
            evaluate_status(&status("500", false)),
            StatusVerdict::Failed("Processing failed".to_string())
        );

        assert_eq!(
            evaluate_status(&status("EXPIRED", false)),
            StatusVerdict::Failed("Upload session expired".to_string())
        );

        // 完成但没有对象
        assert_eq!(
            evaluate_status(&status("COMPLETED", true)),
            StatusVerdict::Failed("Upload completed but no file was created".to_string())
        );

        // 有对象但同时带错误，按失败处理
        let mut response = completed_status("a.bin", 3);
        response.error = Some("virus detected".to_string());
        assert_eq!(
            evaluate_status(&response),
            StatusVerdict::Failed("virus detected".to_string())
        );
    }

    #[tokio::test]
    async fn test_processing_then_completed() {
        let api = Arc::new(MockStorageApi::new());
        api.push_status(status("PROCESSING", false));
        api.push_status(completed_status("big.bin", 16));
        let (reporter, mut rx) = ProgressReporter::channel();

        let object = poller(api.clone(), 10)
            .finish(&task(), &session(), &reporter)
            .await
            .unwrap();

        assert_eq!(object.origin_name, "big.bin");
        assert_eq!(api.complete_calls(), 1);
        assert_eq!(api.status_calls(), 2);

        let percents: Vec<u8> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|u| u.percent)
            .collect();
        assert_eq!(percents, vec![88, 90, 95]);
    }

    #[tokio::test]
    async fn test_backend_failure_is_terminal() {
        let api = Arc::new(MockStorageApi::new());
        let mut failed = status("FAILED", false);
        failed.message = Some("merge failed".to_string());
        api.push_status(failed);
        let (reporter, _rx) = ProgressReporter::channel();

        let err = poller(api.clone(), 10)
            .finish(&task(), &session(), &reporter)
            .await
            .unwrap_err();

        assert_eq!(err, UploadError::Processing("merge failed".to_string()));
        assert_eq!(api.status_calls(), 1);
    }

    #[tokio::test]
    async fn test_timeout_after_max_attempts() {
        let api = Arc::new(MockStorageApi::new());
        let (reporter, _rx) = ProgressReporter::channel();

        let err = poller(api.clone(), 4)
            .finish(&task(), &session(), &reporter)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Processing timeout");
        assert_eq!(api.status_calls(), 4);
    }

    #[tokio::test]
    async fn test_complete_failure_skips_polling() {
        let api = Arc::new(MockStorageApi::new());
        api.fail_complete(UploadError::Server {
            status: 400,
            message: "missing chunks".to_string(),
        });
        let (reporter, _rx) = ProgressReporter::channel();

        let err = poller(api.clone(), 4)
            .finish(&task(), &session(), &reporter)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "missing chunks");
        assert_eq!(api.status_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_polling() {
        let api = Arc::new(MockStorageApi::new());
        let task = task();
        let (reporter, _rx) = ProgressReporter::channel();
        let poller = CompletionPoller::new(api.clone(), Duration::from_secs(60), 200);

        let token = task.cancel_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let err = poller.poll(&task, &session(), &reporter).await.unwrap_err();

        assert_eq!(err, UploadError::Cancelled);
        assert_eq!(api.status_calls(), 0);
    }
}
