//! 上传事件类型定义
//!
//! 上传管理器通过 broadcast 通道推送给订阅方（界面、日志等）

use crate::api::UploadedObject;
use crate::uploader::{Phase, UploadRoute};
use serde::{Deserialize, Serialize};

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 低优先级：进度更新
    Low = 0,
    /// 中优先级：阶段变更
    Medium = 1,
    /// 高优先级：创建、完成、失败、取消等关键事件
    High = 2,
}

/// 上传任务事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 任务创建
    Created {
        task_id: String,
        bucket_id: String,
        path: String,
        file_name: String,
        total_size: u64,
        route: UploadRoute,
    },
    /// 进度更新
    Progress {
        task_id: String,
        phase: Phase,
        /// 总进度 0-100
        progress: u8,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uploaded_chunks: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_chunks: Option<usize>,
    },
    /// 阶段变更
    PhaseChanged {
        task_id: String,
        old_phase: Phase,
        new_phase: Phase,
    },
    /// 任务完成
    Completed {
        task_id: String,
        object: UploadedObject,
        /// 后端已有相同内容
        #[serde(default)]
        duplicated: bool,
    },
    /// 任务失败
    Failed { task_id: String, error: String },
    /// 任务取消
    Cancelled { task_id: String },
    /// 清空已完成列表
    Cleared { count: usize },
}

impl UploadEvent {
    /// 获取任务 ID（批量事件没有任务 ID）
    pub fn task_id(&self) -> Option<&str> {
        match self {
            UploadEvent::Created { task_id, .. }
            | UploadEvent::Progress { task_id, .. }
            | UploadEvent::PhaseChanged { task_id, .. }
            | UploadEvent::Completed { task_id, .. }
            | UploadEvent::Failed { task_id, .. }
            | UploadEvent::Cancelled { task_id } => Some(task_id),
            UploadEvent::Cleared { .. } => None,
        }
    }

    /// 获取事件优先级
    pub fn priority(&self) -> EventPriority {
        match self {
            UploadEvent::Progress { .. } => EventPriority::Low,
            UploadEvent::PhaseChanged { .. } | UploadEvent::Cleared { .. } => {
                EventPriority::Medium
            }
            UploadEvent::Created { .. }
            | UploadEvent::Completed { .. }
            | UploadEvent::Failed { .. }
            | UploadEvent::Cancelled { .. } => EventPriority::High,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::Created { .. } => "created",
            UploadEvent::Progress { .. } => "progress",
            UploadEvent::PhaseChanged { .. } => "phase_changed",
            UploadEvent::Completed { .. } => "completed",
            UploadEvent::Failed { .. } => "failed",
            UploadEvent::Cancelled { .. } => "cancelled",
            UploadEvent::Cleared { .. } => "cleared",
        }
    }

    /// 是否为任务终态事件
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadEvent::Completed { .. } | UploadEvent::Failed { .. } | UploadEvent::Cancelled { .. }
        )
    }
}
