// 上传引擎
//
// 负责单个文件从开始到终态的完整上传过程：
// 1. 按文件大小选择上传路径（直接上传 / 分片上传）
// 2. 分片路径：初始化会话 -> 分批并发上传分片 -> 通知完成 -> 轮询处理状态
// 3. 各阶段进度经 ProgressReporter 上报
// 4. 取消时尽力中止已创建的会话
//
// 进度区间：
// - 准备: 5% ~ 8%
// - 上传: 10% ~ 85%（直接上传 10% ~ 95%）
// - 处理: 88% ~ 95%
// - 完成: 100%

use crate::api::{ByteProgressFn, DirectUploadRequest, StorageApi, UploadError, UploadedObject};
use crate::config::UploadConfig;
use crate::events::ProgressThrottler;
use crate::uploader::concurrency::ConcurrencyPolicy;
use crate::uploader::session::init_session;
use crate::uploader::task::Phase;
use crate::uploader::{
    route, ChunkPlan, ChunkScheduler, CompletionPoller, ProgressReporter, ProgressUpdate,
    RetryPolicy, UploadResult, UploadRoute, UploadSession, UploadStatus, UploadTask,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// 直接上传占用的百分比跨度
const DIRECT_PERCENT_SPAN: f64 = 85.0;

/// 上传引擎
pub struct UploadEngine {
    /// 存储后端
    api: Arc<dyn StorageApi>,
    /// 上传配置
    config: UploadConfig,
    /// 并发分片数策略
    concurrency: Arc<dyn ConcurrencyPolicy>,
}

impl UploadEngine {
    /// 创建上传引擎
    ///
    /// # 参数
    /// * `api` - 存储后端
    /// * `config` - 上传配置
    /// * `concurrency` - 并发分片数策略
    pub fn new(
        api: Arc<dyn StorageApi>,
        config: UploadConfig,
        concurrency: Arc<dyn ConcurrencyPolicy>,
    ) -> Self {
        Self {
            api,
            config,
            concurrency,
        }
    }

    /// 执行上传，直到终态
    ///
    /// 不返回错误：失败、取消都体现在 `UploadResult` 中
    pub async fn run(&self, task: &UploadTask, reporter: &ProgressReporter) -> UploadResult {
        if task.is_cancelled() {
            info!("[{}] 任务在开始前已取消", task.id);
            reporter.report(ProgressUpdate::new(Phase::Cancelled).message("Upload cancelled"));
            return UploadResult::cancelled(task);
        }

        let started_at = Instant::now();
        let upload_route = route(task.size(), self.config.threshold_bytes);

        info!(
            "[{}] 开始上传: {} ({} bytes) -> {}/{}, 路径: {:?}",
            task.id,
            task.file_name(),
            task.size(),
            task.bucket_id,
            task.path,
            upload_route
        );

        reporter.report(
            ProgressUpdate::new(Phase::Preparing)
                .percent(5)
                .message("Preparing file..."),
        );

        let outcome = match upload_route {
            UploadRoute::Direct => self.upload_direct(task, reporter, started_at).await,
            UploadRoute::Chunked => self.upload_chunked(task, reporter, started_at).await,
        };

        let result = UploadResult::from_outcome(task, outcome);
        let elapsed = started_at.elapsed();

        match result.status {
            UploadStatus::Completed => {
                info!(
                    "[{}] ✓ 上传完成: {} ({} bytes, 耗时 {:.1}s{})",
                    task.id,
                    task.file_name(),
                    task.size(),
                    elapsed.as_secs_f64(),
                    if result.duplicated { ", 后端已存在" } else { "" }
                );
                reporter.report(
                    ProgressUpdate::new(Phase::Completed)
                        .percent(100)
                        .message("Completed"),
                );
            }
            UploadStatus::Failed => {
                let message = result.error.clone().unwrap_or_default();
                error!("[{}] ✗ 上传失败: {}", task.id, message);
                reporter.report(ProgressUpdate::new(Phase::Failed).message(message));
            }
            UploadStatus::Cancelled => {
                info!("[{}] 上传已取消", task.id);
                reporter.report(ProgressUpdate::new(Phase::Cancelled).message("Upload cancelled"));
            }
        }

        result
    }

    /// 小文件直接上传
    async fn upload_direct(
        &self,
        task: &UploadTask,
        reporter: &ProgressReporter,
        started_at: Instant,
    ) -> Result<(UploadedObject, bool), UploadError> {
        let data = task.file.source.read_all().await?;
        if data.len() as u64 != task.size() {
            return Err(UploadError::Validation(format!(
                "文件大小已变化: 期望 {} bytes, 实际 {} bytes",
                task.size(),
                data.len()
            )));
        }

        reporter.report(
            ProgressUpdate::new(Phase::Uploading)
                .percent(10)
                .message("Uploading..."),
        );

        let total = task.size();
        let throttler = Arc::new(ProgressThrottler::default());
        let progress_reporter = reporter.clone();
        let on_progress: ByteProgressFn = Arc::new(move |sent: u64| {
            // 最后一次更新总是发布
            if sent < total && !throttler.should_emit() {
                return;
            }
            let ratio = if total == 0 {
                1.0
            } else {
                (sent.min(total) as f64) / (total as f64)
            };
            let elapsed = started_at.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 { sent as f64 / elapsed } else { 0.0 };

            progress_reporter.report(
                ProgressUpdate::new(Phase::Uploading)
                    .percent(10 + (ratio * DIRECT_PERCENT_SPAN).round() as u8)
                    .message(format!("Uploading... {}%", (ratio * 100.0).round() as u8))
                    .speed(speed),
            );
        });

        let request = DirectUploadRequest {
            bucket_id: task.bucket_id.clone(),
            file_name: task.file_name().to_string(),
            content_type: task
                .content_type_or(&self.config.default_content_type)
                .to_string(),
            path: task.path.clone(),
            data,
        };

        let response = self
            .api
            .upload_direct(request, on_progress, &task.cancel_token)
            .await?;

        match response.object {
            Some(object) => Ok((object, response.duplicated)),
            None => Err(UploadError::Processing(
                response
                    .message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "Upload completed but no file was created".to_string()),
            )),
        }
    }

    /// 大文件分片上传
    async fn upload_chunked(
        &self,
        task: &UploadTask,
        reporter: &ProgressReporter,
        started_at: Instant,
    ) -> Result<(UploadedObject, bool), UploadError> {
        let content_type = task.content_type_or(&self.config.default_content_type);
        let session = init_session(
            self.api.as_ref(),
            task,
            content_type,
            self.config.preferred_chunk_size,
            &task.cancel_token,
        )
        .await?;

        reporter.report(
            ProgressUpdate::new(Phase::Preparing)
                .percent(8)
                .message("Analyzing file...")
                .chunks(0, session.total_chunks),
        );

        let outcome = self
            .upload_session(task, &session, reporter, started_at)
            .await;

        // 取消时会话已存在，按配置尽力通知后端释放
        if self.config.abort_on_cancel && matches!(outcome, Err(UploadError::Cancelled)) {
            match self
                .api
                .abort_session(&task.bucket_id, &session.upload_id)
                .await
            {
                Ok(()) => info!("[{}] 已中止会话: {}", task.id, session.upload_id),
                Err(e) => warn!(
                    "[{}] 中止会话失败（忽略）: {}: {}",
                    task.id, session.upload_id, e
                ),
            }
        }

        outcome
    }

    async fn upload_session(
        &self,
        task: &UploadTask,
        session: &UploadSession,
        reporter: &ProgressReporter,
        started_at: Instant,
    ) -> Result<(UploadedObject, bool), UploadError> {
        let plan = ChunkPlan::for_session(task.size(), session)?;

        // 并发数在任务开始时确定，上传过程中不随时段变化
        let limit = self.concurrency.current_limit();
        let scheduler = ChunkScheduler::new(
            self.api.clone(),
            RetryPolicy::from_config(&self.config),
            limit,
        );
        scheduler
            .upload_all(task, session, &plan, started_at, reporter)
            .await?;

        let poller = CompletionPoller::from_config(self.api.clone(), &self.config);
        let object = poller.finish(task, session, reporter).await?;

        Ok((object, false))
    }
}
