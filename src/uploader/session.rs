// 分片上传会话初始化
//
// 分片大小和数量由后端决定，客户端只提供期望值。
// 这一步不重试：失败时还没有会话，整个上传直接失败。

use crate::api::{ChunkedInitRequest, ChunkedInitResponse, StorageApi, UploadError};
use crate::uploader::UploadTask;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 后端分配的上传会话（创建后不再修改）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    /// 会话ID
    pub upload_id: String,
    /// 协商后的分片大小
    pub chunk_size: u64,
    /// 分片总数
    pub total_chunks: usize,
    /// 后端临时存储前缀
    pub temp_prefix: Option<String>,
    /// 过期时间
    pub expires_at: Option<String>,
}

impl UploadSession {
    /// 从初始化响应构造并校验
    pub fn from_response(response: ChunkedInitResponse) -> Result<Self, UploadError> {
        if response.upload_id.is_empty() {
            return Err(UploadError::Decode("初始化响应缺少 upload_id".to_string()));
        }
        if response.chunk_size == 0 || response.total_chunks == 0 {
            return Err(UploadError::Decode(format!(
                "初始化响应无效: chunk_size={}, total_chunks={}",
                response.chunk_size, response.total_chunks
            )));
        }

        Ok(Self {
            upload_id: response.upload_id,
            chunk_size: response.chunk_size,
            total_chunks: response.total_chunks,
            temp_prefix: response.temp_prefix,
            expires_at: response.expires_at,
        })
    }
}

/// 初始化上传会话
///
/// # 参数
/// * `api` - 存储后端
/// * `task` - 上传任务
/// * `content_type` - MIME 类型
/// * `preferred_chunk_size` - 期望分片大小
/// * `cancel` - 取消令牌
pub async fn init_session(
    api: &dyn StorageApi,
    task: &UploadTask,
    content_type: &str,
    preferred_chunk_size: u64,
    cancel: &CancellationToken,
) -> Result<UploadSession, UploadError> {
    if cancel.is_cancelled() {
        return Err(UploadError::Cancelled);
    }

    let request = ChunkedInitRequest {
        file_name: task.file_name().to_string(),
        file_size: task.size(),
        content_type: content_type.to_string(),
        path: task.path.clone(),
        preferred_chunk_size,
    };

    let response = api.init_session(&task.bucket_id, &request, cancel).await?;
    let session = UploadSession::from_response(response)?;

    info!(
        "[{}] 会话已创建: upload_id={}, 分片大小={}, 分片数={}, 过期时间={:?}",
        task.id, session.upload_id, session.chunk_size, session.total_chunks, session.expires_at
    );

    Ok(session)
}
