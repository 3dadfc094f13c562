// 上传错误分类
//
// 传输层、重试层、会话层、轮询层共用同一套错误类型，
// 最终在调度器/轮询器边界转换为 Failed 结果，不会抛到调用方

use thiserror::Error;

/// 上传错误
///
/// Display 输出即为展示给用户的错误信息
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    /// 网络错误（连接失败、超时、连接被重置等，可重试）
    #[error("{0}")]
    Network(String),

    /// 服务端返回非 2xx 状态码
    #[error("{message}")]
    Server { status: u16, message: String },

    /// 401，凭证失效
    #[error("Unauthorized")]
    Unauthorized,

    /// 用户取消
    #[error("Upload cancelled")]
    Cancelled,

    /// 轮询超过上限
    #[error("{0}")]
    Timeout(String),

    /// 后端处理失败（状态轮询返回 FAILED 等）
    #[error("{0}")]
    Processing(String),

    /// 参数/输入校验失败
    #[error("{0}")]
    Validation(String),

    /// 响应解析失败
    #[error("Invalid server response: {0}")]
    Decode(String),

    /// 读取本地文件失败
    #[error("Failed to read file: {0}")]
    Io(String),
}

impl UploadError {
    /// 是否可重试
    ///
    /// 只有网络错误和临时性服务端错误（5xx / 408 / 429）会重试，
    /// 4xx 参数错误重发同样的请求也不会成功
    pub fn is_retriable(&self) -> bool {
        match self {
            UploadError::Network(_) => true,
            UploadError::Server { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }

    /// 是否为用户取消
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }

    /// 错误类型名称（用于日志）
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::Network(_) => "network",
            UploadError::Server { .. } => "server",
            UploadError::Unauthorized => "unauthorized",
            UploadError::Cancelled => "cancelled",
            UploadError::Timeout(_) => "timeout",
            UploadError::Processing(_) => "processing",
            UploadError::Validation(_) => "validation",
            UploadError::Decode(_) => "decode",
            UploadError::Io(_) => "io",
        }
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return UploadError::Server {
                status: status.as_u16(),
                message: format!("HTTP error! status: {}", status.as_u16()),
            };
        }
        UploadError::Network(e.to_string())
    }
}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        UploadError::Io(e.to_string())
    }
}
