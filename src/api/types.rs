// 存储后端 API 数据类型

use serde::{Deserialize, Deserializer, Serialize};

/// 后端创建的对象描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UploadedObject {
    /// 对象ID
    #[serde(default)]
    pub id: String,
    /// 所属 bucket
    #[serde(default)]
    pub bucket_id: String,
    /// MIME 类型
    #[serde(default)]
    pub content_type: String,
    /// 原始文件名
    #[serde(default)]
    pub origin_name: String,
    /// 父目录路径
    #[serde(default)]
    pub parent_path: String,
    /// 创建时间
    #[serde(default)]
    pub created_at: String,
    /// 最后修改时间
    #[serde(default)]
    pub last_modified: String,
    /// 文件大小（字节）
    #[serde(default)]
    pub size: u64,
    /// 访问地址
    #[serde(default)]
    pub url: String,
    /// 内容哈希
    #[serde(default)]
    pub file_hash: String,
}

/// 直接上传响应（POST /objects）
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DirectUploadResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub object: Option<UploadedObject>,
    #[serde(default)]
    pub cdn_url: Option<String>,
    /// 后端检测到相同内容已存在
    #[serde(default)]
    pub duplicated: bool,
}

/// 分片上传会话初始化请求（POST /chunked/init）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkedInitRequest {
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    pub path: String,
    /// 客户端期望的分片大小，仅作参考，以后端返回为准
    pub preferred_chunk_size: u64,
}

/// 分片上传会话初始化响应
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChunkedInitResponse {
    pub upload_id: String,
    pub chunk_size: u64,
    pub total_chunks: usize,
    #[serde(default)]
    pub temp_prefix: Option<String>,
    #[serde(default)]
    pub expires_at: Option<String>,
}

/// 单个分片上传响应（POST /chunked/chunk）
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChunkUploadResponse {
    #[serde(default)]
    pub chunk_index: usize,
    #[serde(default)]
    pub uploaded_chunks: usize,
    #[serde(default)]
    pub total_chunks: usize,
    #[serde(default, deserialize_with = "deserialize_status")]
    pub status: String,
}

/// 完成上传请求（POST /chunked/complete）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkedCompleteRequest {
    pub upload_id: String,
}

/// 完成上传响应
///
/// 后端收到后立即返回，合并与校验异步进行
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChunkedCompleteResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub upload_id: String,
    #[serde(default, deserialize_with = "deserialize_status")]
    pub status: String,
    #[serde(default)]
    pub total_chunks: usize,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub status_url: Option<String>,
}

/// 上传状态查询响应（GET /chunked/{upload_id}/status）
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChunkedStatusResponse {
    /// 已规范化为大写字符串（后端可能返回数字）
    #[serde(default, deserialize_with = "deserialize_status")]
    pub status: String,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub object: Option<UploadedObject>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub uploaded_chunks: usize,
    #[serde(default)]
    pub total_chunks: usize,
    #[serde(default)]
    pub upload_progress: f64,
    #[serde(default)]
    pub expires_at: Option<String>,
}

/// 后端处理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Init,
    Uploading,
    Processing,
    Completed,
    Failed,
    Expired,
    Unknown,
}

impl SessionStatus {
    /// 从规范化后的状态字符串解析
    ///
    /// 数字状态 "500" 视为失败
    pub fn parse(status: &str) -> Self {
        match status {
            "INIT" => SessionStatus::Init,
            "UPLOADING" => SessionStatus::Uploading,
            "PROCESSING" => SessionStatus::Processing,
            "COMPLETED" => SessionStatus::Completed,
            "FAILED" | "500" => SessionStatus::Failed,
            "EXPIRED" => SessionStatus::Expired,
            _ => SessionStatus::Unknown,
        }
    }
}

impl ChunkedStatusResponse {
    pub fn session_status(&self) -> SessionStatus {
        SessionStatus::parse(&self.status)
    }
}

/// 对象列表响应（GET /objects?path=），只关心文件名
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObjectListResponse {
    #[serde(default)]
    pub objects: Option<Vec<ObjectName>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectName {
    pub origin_name: String,
}

/// 错误响应体
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// 状态字段可能是字符串也可能是数字，统一转成大写字符串
fn deserialize_status<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => s.to_uppercase(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::Bool(b)) => b.to_string().to_uppercase(),
        _ => String::new(),
    })
}
