// 分片并发调度
//
// 调度策略：
// - 分片按索引升序切成批次，批次宽度 = 并发分片数
// - 批次内所有分片并发上传（JoinSet），整批结束后再派发下一批
// - 每个分片独立重试；任一分片最终失败，立即中止整个任务，不再派发后续批次
// - 已上传的分片不回滚，由后端会话过期清理
//
// 进度由已完成分片计数推导（10% ~ 85%），与分片完成顺序无关，保证单调

use crate::api::{StorageApi, UploadError};
use crate::uploader::{
    ChunkPlan, ProgressReporter, ProgressUpdate, RetryPolicy, UploadChunk, UploadSession,
    UploadSource, UploadTask,
};
use crate::uploader::task::Phase;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 上传阶段起始百分比
pub const UPLOAD_PERCENT_START: u8 = 10;

/// 上传阶段占用的百分比跨度
pub const UPLOAD_PERCENT_SPAN: u8 = 75;

/// 根据已完成分片数计算总进度
pub fn uploading_percent(uploaded_chunks: usize, total_chunks: usize) -> u8 {
    if total_chunks == 0 {
        return UPLOAD_PERCENT_START + UPLOAD_PERCENT_SPAN;
    }
    let ratio = (uploaded_chunks.min(total_chunks) as f64) / (total_chunks as f64);
    UPLOAD_PERCENT_START + (ratio * UPLOAD_PERCENT_SPAN as f64).round() as u8
}

/// 单个分片的上传结果
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub index: usize,
    pub success: bool,
    /// 实际发送的字节数
    pub transferred: u64,
    pub error: Option<UploadError>,
}

/// 所有分片上传完成后的汇总
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTotals {
    pub uploaded_chunks: usize,
    pub bytes_uploaded: u64,
}

/// 分片调度器
pub struct ChunkScheduler {
    api: Arc<dyn StorageApi>,
    retry: RetryPolicy,
    /// 批次宽度
    concurrency: usize,
}

impl ChunkScheduler {
    pub fn new(api: Arc<dyn StorageApi>, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            api,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// 上传全部分片
    ///
    /// # 参数
    /// * `task` - 上传任务
    /// * `session` - 上传会话
    /// * `plan` - 分片规划
    /// * `started_at` - 任务开始时间（用于计算吞吐量）
    /// * `reporter` - 进度上报
    pub async fn upload_all(
        &self,
        task: &UploadTask,
        session: &UploadSession,
        plan: &ChunkPlan,
        started_at: Instant,
        reporter: &ProgressReporter,
    ) -> Result<ChunkTotals, UploadError> {
        let total_chunks = plan.chunk_count();
        let mut uploaded_chunks = 0usize;
        let mut bytes_uploaded = 0u64;

        info!(
            "[{}] 开始上传 {} 个分片，并发数: {}",
            task.id, total_chunks, self.concurrency
        );

        reporter.report(
            ProgressUpdate::new(Phase::Uploading)
                .percent(UPLOAD_PERCENT_START)
                .message("Uploading... 0%")
                .chunks(0, total_chunks),
        );

        for (batch_no, batch) in plan.batches(self.concurrency).enumerate() {
            if task.is_cancelled() {
                info!("[{}] 任务已取消，停止派发批次 #{}", task.id, batch_no);
                return Err(UploadError::Cancelled);
            }

            debug!(
                "[{}] 派发批次 #{}: 分片 {:?}",
                task.id,
                batch_no,
                batch.iter().map(|c| c.index).collect::<Vec<_>>()
            );

            let mut join_set: JoinSet<ChunkResult> = JoinSet::new();
            for chunk in batch {
                join_set.spawn(transfer_chunk(
                    self.api.clone(),
                    task.file.source.clone(),
                    task.bucket_id.clone(),
                    session.upload_id.clone(),
                    task.id.clone(),
                    chunk.clone(),
                    self.retry,
                    task.cancel_token.clone(),
                ));
            }

            while let Some(joined) = join_set.join_next().await {
                let result = match joined {
                    Ok(result) => result,
                    Err(e) => {
                        error!("[{}] 分片任务异常: {}", task.id, e);
                        join_set.abort_all();
                        return Err(UploadError::Network(format!("Chunk task aborted: {}", e)));
                    }
                };

                if !result.success {
                    let error = result.error.unwrap_or_else(|| {
                        UploadError::Network("Failed to upload file part".to_string())
                    });
                    if !error.is_cancelled() {
                        error!(
                            "[{}] 分片#{} 最终失败，中止任务: {}",
                            task.id, result.index, error
                        );
                    }
                    join_set.abort_all();
                    return Err(error);
                }

                uploaded_chunks += 1;
                bytes_uploaded += result.transferred;

                let elapsed = started_at.elapsed().as_secs_f64();
                let speed = if elapsed > 0.0 {
                    bytes_uploaded as f64 / elapsed
                } else {
                    0.0
                };
                let byte_percent = if task.size() == 0 {
                    100
                } else {
                    ((bytes_uploaded as f64 / task.size() as f64) * 100.0).round() as u64
                };

                info!(
                    "[{}][分片#{}] ✓ 上传成功 ({}/{} 完成, 速度: {} KB/s)",
                    task.id,
                    result.index,
                    uploaded_chunks,
                    total_chunks,
                    (speed / 1024.0) as u64
                );

                reporter.report(
                    ProgressUpdate::new(Phase::Uploading)
                        .percent(uploading_percent(uploaded_chunks, total_chunks))
                        .message(format!("Uploading... {}%", byte_percent))
                        .speed(speed)
                        .chunks(uploaded_chunks, total_chunks),
                );
            }
        }

        info!(
            "[{}] 所有 {} 个分片上传完成, 共 {} bytes",
            task.id, total_chunks, bytes_uploaded
        );

        Ok(ChunkTotals {
            uploaded_chunks,
            bytes_uploaded,
        })
    }
}

/// 上传单个分片（带重试）
///
/// 每次尝试都从数据源重新读取该分片范围
#[allow(clippy::too_many_arguments)]
async fn transfer_chunk(
    api: Arc<dyn StorageApi>,
    source: UploadSource,
    bucket_id: String,
    upload_id: String,
    task_id: String,
    chunk: UploadChunk,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> ChunkResult {
    let label = format!("[{}][分片#{}]", task_id, chunk.index);
    let index = chunk.index;

    let api = api.as_ref();
    let source = &source;
    let bucket_id = bucket_id.as_str();
    let upload_id = upload_id.as_str();
    let chunk = &chunk;
    let token = &cancel;

    let outcome = retry
        .run(&cancel, &label, move |attempt| async move {
            debug!(
                "[分片#{}] 第 {} 次尝试 (范围: {}-{}, 大小: {} bytes)",
                index,
                attempt,
                chunk.range.start,
                chunk.range.end,
                chunk.size()
            );
            let data = source.read_range(chunk.range.clone()).await?;
            let transferred = data.len() as u64;
            api.upload_chunk(bucket_id, upload_id, index, data, token)
                .await?;
            Ok(transferred)
        })
        .await;

    match outcome {
        Ok(transferred) => ChunkResult {
            index,
            success: true,
            transferred,
            error: None,
        },
        Err(error) => ChunkResult {
            index,
            success: false,
            transferred: 0,
            error: Some(error),
        },
    }
}
