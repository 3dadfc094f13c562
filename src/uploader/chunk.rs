// 上传分片规划
//
// 分片大小和数量以后端会话为准：
// - 分片数 = ceil(文件大小 / 分片大小)
// - 最后一个分片长度 = 文件大小 - (分片数 - 1) × 分片大小
// - 空文件仍然有一个长度为 0 的分片

use crate::api::UploadError;
use crate::uploader::UploadSession;
use std::ops::Range;
use tracing::{debug, warn};

/// 上传分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
}

impl UploadChunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self { index, range }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 分片规划
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    /// 所有分片（按索引升序）
    chunks: Vec<UploadChunk>,
    /// 文件总大小
    file_size: u64,
    /// 分片大小
    chunk_size: u64,
}

impl ChunkPlan {
    /// 按分片大小切分文件
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self, UploadError> {
        if chunk_size == 0 {
            return Err(UploadError::Validation("分片大小必须大于 0".to_string()));
        }

        let count = Self::expected_count(file_size, chunk_size);
        let chunks = (0..count)
            .map(|index| {
                let start = index as u64 * chunk_size;
                let end = (start + chunk_size).min(file_size);
                UploadChunk::new(index, start..end)
            })
            .collect();

        Ok(Self {
            chunks,
            file_size,
            chunk_size,
        })
    }

    /// 根据后端会话生成规划，并校验分片数与会话一致
    pub fn for_session(file_size: u64, session: &UploadSession) -> Result<Self, UploadError> {
        let plan = Self::new(file_size, session.chunk_size)?;

        if plan.chunk_count() != session.total_chunks {
            warn!(
                "分片数不一致: 本地计算={}, 会话={}, 文件大小={}, 分片大小={}",
                plan.chunk_count(),
                session.total_chunks,
                file_size,
                session.chunk_size
            );
            return Err(UploadError::Validation(format!(
                "Chunk count mismatch: expected {}, server reported {}",
                plan.chunk_count(),
                session.total_chunks
            )));
        }

        debug!(
            "分片规划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            file_size,
            session.chunk_size,
            plan.chunk_count()
        );
        Ok(plan)
    }

    /// 分片数量，空文件为 1
    pub fn expected_count(file_size: u64, chunk_size: u64) -> usize {
        if file_size == 0 {
            1
        } else {
            file_size.div_ceil(chunk_size) as usize
        }
    }

    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 按并发宽度切分批次，批次按索引升序
    pub fn batches(&self, width: usize) -> std::slice::Chunks<'_, UploadChunk> {
        self.chunks.chunks(width.max(1))
    }
}
