// 上传数据源
//
// 本地文件或内存数据。重试时按分片范围重新读取，分片内容可重复发送

use crate::api::UploadError;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 上传数据源
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// 本地文件
    File(PathBuf),
    /// 内存数据
    Memory(Arc<Vec<u8>>),
}

impl UploadSource {
    /// 读取指定字节范围
    pub async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>, UploadError> {
        if range.end < range.start {
            return Err(UploadError::Validation(format!(
                "无效的读取范围: {}..{}",
                range.start, range.end
            )));
        }

        match self {
            UploadSource::File(path) => read_file_range(path, range).await,
            UploadSource::Memory(data) => {
                let end = range.end as usize;
                if end > data.len() {
                    return Err(UploadError::Io(format!(
                        "读取范围越界: {}..{} (总长度 {})",
                        range.start,
                        range.end,
                        data.len()
                    )));
                }
                Ok(data[range.start as usize..end].to_vec())
            }
        }
    }

    /// 读取全部数据
    pub async fn read_all(&self) -> Result<Vec<u8>, UploadError> {
        match self {
            UploadSource::File(path) => Ok(tokio::fs::read(path).await?),
            UploadSource::Memory(data) => Ok(data.as_ref().clone()),
        }
    }
}

async fn read_file_range(path: &Path, range: Range<u64>) -> Result<Vec<u8>, UploadError> {
    let mut file = File::open(path).await?;

    // 定位到分片起始位置
    file.seek(std::io::SeekFrom::Start(range.start)).await?;

    let mut buffer = vec![0u8; (range.end - range.start) as usize];
    file.read_exact(&mut buffer).await?;

    debug!(
        "读取文件范围: {:?}, bytes={}..{}, 大小={} bytes",
        path,
        range.start,
        range.end,
        buffer.len()
    );

    Ok(buffer)
}

/// 待上传文件
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// 文件名（可能因重名被改写）
    pub name: String,
    /// 文件大小
    pub size: u64,
    /// MIME 类型（未知时为 None）
    pub content_type: Option<String>,
    /// 数据源
    pub source: UploadSource,
}

impl UploadFile {
    /// 从本地文件创建
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;

        if metadata.is_dir() {
            return Err(UploadError::Validation(format!(
                "不支持直接上传目录: {:?}",
                path
            )));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_string())
            .ok_or_else(|| UploadError::Validation(format!("无法获取文件名: {:?}", path)))?;

        Ok(Self {
            name,
            size: metadata.len(),
            content_type: None,
            source: UploadSource::File(path.to_path_buf()),
        })
    }

    /// 从内存数据创建
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            size: data.len() as u64,
            content_type: None,
            source: UploadSource::Memory(Arc::new(data)),
        }
    }

    /// 设置 MIME 类型
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_read_file_range() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"0123456789abcdef").unwrap();
        file.flush().unwrap();

        let source = UploadSource::File(file.path().to_path_buf());
        assert_eq!(source.read_range(4..8).await.unwrap(), b"4567");
        assert_eq!(source.read_range(12..16).await.unwrap(), b"cdef");
        assert!(source.read_range(12..20).await.is_err());
    }

    #[tokio::test]
    async fn test_read_memory_range() {
        let source = UploadSource::Memory(Arc::new(b"hello world".to_vec()));
        assert_eq!(source.read_range(6..11).await.unwrap(), b"world");
        assert_eq!(source.read_range(0..0).await.unwrap(), b"");
        assert!(source.read_range(6..12).await.is_err());
    }

    #[tokio::test]
    async fn test_upload_file_from_path() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 1000]).unwrap();
        file.flush().unwrap();

        let upload = UploadFile::from_path(file.path()).await.unwrap();
        assert_eq!(upload.size, 1000);
        assert!(upload.content_type.is_none());
        assert_eq!(upload.source.read_all().await.unwrap().len(), 1000);

        let dir = tempfile::tempdir().unwrap();
        let err = UploadFile::from_path(dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
