// 上传任务定义
//
// 每个任务一个显式状态机：
// preparing -> uploading -> processing -> completed
// 任意非终态 -> failed / cancelled

use crate::api::{UploadError, UploadedObject};
use crate::uploader::UploadFile;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 上传阶段
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// 准备中（含会话初始化）
    Preparing,
    /// 上传中
    Uploading,
    /// 后端处理中
    Processing,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl Phase {
    /// 是否为终态
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    fn rank(self) -> u8 {
        match self {
            Phase::Preparing => 0,
            Phase::Uploading => 1,
            Phase::Processing => 2,
            Phase::Completed | Phase::Failed | Phase::Cancelled => 3,
        }
    }

    /// 是否允许转换到 `next`
    ///
    /// 非终态可以停留在当前阶段（进度更新）或向前推进；
    /// 失败和取消可从任意非终态进入；终态不再转换
    pub fn can_transition_to(self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Phase::Failed | Phase::Cancelled => true,
            Phase::Completed => matches!(self, Phase::Uploading | Phase::Processing),
            _ => next.rank() >= self.rank(),
        }
    }

    /// 状态转换函数
    pub fn transition(self, next: Phase) -> Result<Phase, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Preparing => "preparing",
            Phase::Uploading => "uploading",
            Phase::Processing => "processing",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 非法状态转换
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("非法状态转换: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: Phase,
    pub to: Phase,
}

/// 任务进度视图
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadProgress {
    /// 当前阶段
    pub phase: Phase,
    /// 总进度 0-100，只增不减
    pub percent: u8,
    /// 展示文案
    pub message: String,
    /// 吞吐量 (bytes/s)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// 已完成分片数
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_chunks: Option<usize>,
    /// 总分片数
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<usize>,
}

impl Default for UploadProgress {
    fn default() -> Self {
        Self {
            phase: Phase::Preparing,
            percent: 0,
            message: "Waiting...".to_string(),
            speed: None,
            uploaded_chunks: None,
            total_chunks: None,
        }
    }
}

impl UploadProgress {
    /// 应用一次进度更新
    ///
    /// # 返回
    /// 阶段是否发生变化；非法转换返回错误且不修改当前状态
    pub fn apply(&mut self, update: &ProgressUpdate) -> Result<bool, InvalidTransition> {
        let next = self.phase.transition(update.phase)?;
        let phase_changed = next != self.phase;
        self.phase = next;

        if let Some(percent) = update.percent {
            self.percent = self.percent.max(percent.min(100));
        }
        if next == Phase::Completed {
            self.percent = 100;
        }
        if let Some(message) = &update.message {
            self.message = message.clone();
        }
        if update.speed.is_some() {
            self.speed = update.speed;
        }
        if let Some((uploaded, total)) = update.chunks {
            self.uploaded_chunks = Some(uploaded);
            self.total_chunks = Some(total);
        }

        Ok(phase_changed)
    }
}

/// 进度更新消息（由引擎发出，经通道送到管理器）
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub phase: Phase,
    pub percent: Option<u8>,
    pub message: Option<String>,
    pub speed: Option<f64>,
    pub chunks: Option<(usize, usize)>,
}

impl ProgressUpdate {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            percent: None,
            message: None,
            speed: None,
            chunks: None,
        }
    }

    pub fn percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn chunks(mut self, uploaded: usize, total: usize) -> Self {
        self.chunks = Some((uploaded, total));
        self
    }
}

/// 进度上报端
///
/// 引擎各阶段通过它把更新发到任务驱动循环，接收端关闭后静默丢弃
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        Self { tx }
    }

    /// 创建上报端和对应的接收端
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn report(&self, update: ProgressUpdate) {
        let _ = self.tx.send(update);
    }
}

/// 生成任务ID: upload-{毫秒时间戳}-{随机串}
fn generate_task_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "upload-{}-{}",
        chrono::Utc::now().timestamp_millis(),
        &random[..9]
    )
}

/// 上传任务
#[derive(Debug, Clone)]
pub struct UploadTask {
    /// 任务ID
    pub id: String,
    /// 目标 bucket
    pub bucket_id: String,
    /// 目标目录（无前导斜杠，空字符串为根目录）
    pub path: String,
    /// 待上传文件（名称已处理重名）
    pub file: UploadFile,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 取消令牌
    pub cancel_token: CancellationToken,
}

impl UploadTask {
    /// 创建新的上传任务
    pub fn new(
        bucket_id: impl Into<String>,
        path: impl Into<String>,
        file: UploadFile,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            id: generate_task_id(),
            bucket_id: bucket_id.into(),
            path: path.into(),
            file,
            created_at: chrono::Utc::now().timestamp(),
            cancel_token,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file.name
    }

    pub fn size(&self) -> u64 {
        self.file.size
    }

    /// MIME 类型，未知时使用给定默认值
    pub fn content_type_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.file
            .content_type
            .as_deref()
            .filter(|ct| !ct.is_empty())
            .unwrap_or(default)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// 终态类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Completed,
    Failed,
    Cancelled,
}

/// 上传结果（终态记录）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadResult {
    pub task_id: String,
    pub bucket_id: String,
    pub path: String,
    pub file_name: String,
    pub size: u64,
    pub status: UploadStatus,
    /// 成功时后端创建的对象
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<UploadedObject>,
    /// 失败原因
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 后端已存在相同内容
    #[serde(default)]
    pub duplicated: bool,
    /// 结束时间 (Unix timestamp)
    pub finished_at: i64,
}

impl UploadResult {
    fn base(task: &UploadTask, status: UploadStatus) -> Self {
        Self {
            task_id: task.id.clone(),
            bucket_id: task.bucket_id.clone(),
            path: task.path.clone(),
            file_name: task.file.name.clone(),
            size: task.file.size,
            status,
            object: None,
            error: None,
            duplicated: false,
            finished_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn completed(task: &UploadTask, object: UploadedObject, duplicated: bool) -> Self {
        let mut result = Self::base(task, UploadStatus::Completed);
        result.object = Some(object);
        result.duplicated = duplicated;
        result
    }

    pub fn failed(task: &UploadTask, error: impl Into<String>) -> Self {
        let mut result = Self::base(task, UploadStatus::Failed);
        result.error = Some(error.into());
        result
    }

    pub fn cancelled(task: &UploadTask) -> Self {
        let mut result = Self::base(task, UploadStatus::Cancelled);
        result.error = Some(UploadError::Cancelled.to_string());
        result
    }

    /// 从执行结果构造：Cancelled 错误单独归类，不算失败
    pub fn from_outcome(
        task: &UploadTask,
        outcome: Result<(UploadedObject, bool), UploadError>,
    ) -> Self {
        match outcome {
            Ok((object, duplicated)) => Self::completed(task, object, duplicated),
            Err(UploadError::Cancelled) => Self::cancelled(task),
            Err(e) => Self::failed(task, e.to_string()),
        }
    }

    pub fn success(&self) -> bool {
        self.status == UploadStatus::Completed
    }

    /// 对应的终态阶段
    pub fn phase(&self) -> Phase {
        match self.status {
            UploadStatus::Completed => Phase::Completed,
            UploadStatus::Failed => Phase::Failed,
            UploadStatus::Cancelled => Phase::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn task() -> UploadTask {
        UploadTask::new(
            "bucket-1",
            "docs",
            UploadFile::from_bytes("a.txt", vec![0u8; 10]),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_task_creation() {
        let task = task();
        assert!(task.id.starts_with("upload-"));
        assert_eq!(task.size(), 10);
        assert_eq!(task.file_name(), "a.txt");
        assert_eq!(
            task.content_type_or("application/octet-stream"),
            "application/octet-stream"
        );
        assert!(!task.is_cancelled());
    }

    #[test]
    fn test_phase_transitions() {
        assert!(Phase::Preparing.can_transition_to(Phase::Preparing));
        assert!(Phase::Preparing.can_transition_to(Phase::Uploading));
        assert!(Phase::Uploading.can_transition_to(Phase::Processing));
        assert!(Phase::Uploading.can_transition_to(Phase::Completed));
        assert!(Phase::Processing.can_transition_to(Phase::Completed));
        assert!(Phase::Preparing.can_transition_to(Phase::Failed));
        assert!(Phase::Processing.can_transition_to(Phase::Cancelled));

        // 不能回退，不能跳过上传直接完成
        assert!(!Phase::Processing.can_transition_to(Phase::Uploading));
        assert!(!Phase::Preparing.can_transition_to(Phase::Completed));

        // 终态不再转换
        assert!(!Phase::Completed.can_transition_to(Phase::Failed));
        assert!(!Phase::Failed.can_transition_to(Phase::Failed));
        assert_eq!(
            Phase::Cancelled.transition(Phase::Uploading),
            Err(InvalidTransition {
                from: Phase::Cancelled,
                to: Phase::Uploading
            })
        );
    }

    #[test]
    fn test_progress_apply() {
        let mut progress = UploadProgress::default();

        let changed = progress
            .apply(&ProgressUpdate::new(Phase::Preparing).percent(5).message("Preparing file..."))
            .unwrap();
        assert!(!changed);
        assert_eq!(progress.percent, 5);

        let changed = progress
            .apply(&ProgressUpdate::new(Phase::Uploading).percent(40).chunks(2, 5))
            .unwrap();
        assert!(changed);
        assert_eq!(progress.uploaded_chunks, Some(2));

        // 更小的百分比不会让进度回退
        progress
            .apply(&ProgressUpdate::new(Phase::Uploading).percent(30))
            .unwrap();
        assert_eq!(progress.percent, 40);

        // 失败保留最后的进度，文案换成错误信息
        progress
            .apply(&ProgressUpdate::new(Phase::Failed).message("boom"))
            .unwrap();
        assert_eq!(progress.phase, Phase::Failed);
        assert_eq!(progress.percent, 40);
        assert_eq!(progress.message, "boom");

        // 终态之后的更新被拒绝
        assert!(progress
            .apply(&ProgressUpdate::new(Phase::Uploading).percent(90))
            .is_err());
        assert_eq!(progress.percent, 40);
    }

    #[test]
    fn test_completed_forces_full_progress() {
        let mut progress = UploadProgress::default();
        progress
            .apply(&ProgressUpdate::new(Phase::Uploading).percent(60))
            .unwrap();
        progress
            .apply(&ProgressUpdate::new(Phase::Completed).message("Completed"))
            .unwrap();
        assert_eq!(progress.percent, 100);
    }

    #[test]
    fn test_result_from_outcome() {
        let task = task();

        let ok = UploadResult::from_outcome(&task, Ok((UploadedObject::default(), true)));
        assert!(ok.success());
        assert!(ok.duplicated);
        assert_eq!(ok.phase(), Phase::Completed);

        let cancelled = UploadResult::from_outcome(&task, Err(UploadError::Cancelled));
        assert_eq!(cancelled.status, UploadStatus::Cancelled);
        assert!(!cancelled.success());

        let failed = UploadResult::from_outcome(
            &task,
            Err(UploadError::Timeout("Processing timeout".to_string())),
        );
        assert_eq!(failed.status, UploadStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("Processing timeout"));
    }

    fn phase_strategy() -> impl Strategy<Value = Phase> {
        prop_oneof![
            Just(Phase::Preparing),
            Just(Phase::Uploading),
            Just(Phase::Processing),
            Just(Phase::Completed),
            Just(Phase::Failed),
            Just(Phase::Cancelled),
        ]
    }

    proptest! {
        /// 任意更新序列下进度都不回退
        #[test]
        fn prop_percent_never_decreases(
            updates in prop::collection::vec((phase_strategy(), 0u8..=120), 0..64)
        ) {
            let mut progress = UploadProgress::default();
            let mut last = progress.percent;
            for (phase, percent) in updates {
                let _ = progress.apply(&ProgressUpdate::new(phase).percent(percent));
                prop_assert!(progress.percent >= last);
                prop_assert!(progress.percent <= 100);
                last = progress.percent;
            }
        }
    }
}
