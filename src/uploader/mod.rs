// 上传模块
//
// 大文件上传编排：
// - 按大小选择直接上传或分片上传
// - 分片按批次并发上传，并发数随时段变化
// - 分片独立重试（线性退避）
// - 通知完成后轮询后端处理状态
// - 管理器维护进行中/已结束任务并广播事件

pub mod chunk;
pub mod concurrency;
pub mod engine;
pub mod manager;
pub mod naming;
pub mod poller;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use chunk::{ChunkPlan, UploadChunk};
pub use concurrency::{ConcurrencyPolicy, FixedConcurrency, PeakHoursPolicy};
pub use engine::UploadEngine;
pub use manager::{normalize_path, CompletionCallback, UploadManager, UploadTaskInfo};
pub use naming::{resolve_unique_name, ApiExistingNames, ExistingNames};
pub use poller::{evaluate_status, CompletionPoller, StatusVerdict};
pub use retry::RetryPolicy;
pub use router::{route, UploadRoute};
pub use scheduler::{uploading_percent, ChunkResult, ChunkScheduler, ChunkTotals};
pub use session::{init_session, UploadSession};
pub use source::{UploadFile, UploadSource};
pub use task::{
    Phase, ProgressReporter, ProgressUpdate, UploadProgress, UploadResult, UploadStatus,
    UploadTask,
};

/// 格式化字节大小（保留一位小数，整数时省略小数位）
///
/// # 参数
/// * `bytes` - 字节数，`None` 表示未知
///
/// # 返回
/// 如 `0 B`、`1.5 KB`、`10 MB`，未知时为 `—`
pub fn format_bytes(bytes: Option<u64>) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let Some(bytes) = bytes else {
        return "—".to_string();
    };
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = (value * 10.0).round() / 10.0;
    if rounded.fract() == 0.0 {
        format!("{} {}", rounded as u64, UNITS[unit])
    } else {
        format!("{:.1} {}", rounded, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(None), "—");
        assert_eq!(format_bytes(Some(0)), "0 B");
        assert_eq!(format_bytes(Some(512)), "512 B");
        assert_eq!(format_bytes(Some(1024)), "1 KB");
        assert_eq!(format_bytes(Some(1536)), "1.5 KB");
        assert_eq!(format_bytes(Some(30 * 1024 * 1024)), "30 MB");
        assert_eq!(format_bytes(Some(5 * 1024 * 1024 * 1024 * 1024)), "5 TB");
    }
}
