// 上传路径选择
//
// 小文件一次请求直接上传；大文件走分片会话（可并发、可重试）。
// 文件大小等于阈值时走直接上传。

use serde::{Deserialize, Serialize};

/// 上传路径
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadRoute {
    /// 单次请求整体上传
    Direct,
    /// 分片上传
    Chunked,
}

/// 根据文件大小选择上传路径
///
/// # 参数
/// * `file_size` - 文件大小（字节）
/// * `threshold` - 分界阈值（字节）
pub fn route(file_size: u64, threshold: u64) -> UploadRoute {
    if file_size <= threshold {
        UploadRoute::Direct
    } else {
        UploadRoute::Chunked
    }
}
