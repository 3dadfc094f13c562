// Cloud Upload Orchestrator
// 云存储大文件上传编排核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 事件模块
pub mod events;

// 存储后端API模块
pub mod api;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use api::{CredentialProvider, StaticCredentials, StorageApi, StorageClient, UploadError};
pub use config::AppConfig;
pub use events::UploadEvent;
pub use uploader::{
    format_bytes, Phase, UploadFile, UploadManager, UploadProgress, UploadResult, UploadStatus,
    UploadTaskInfo,
};
