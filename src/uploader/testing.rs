// 测试用存储后端
//
// 按脚本返回响应，并记录每类请求的调用次数

use crate::api::{
    ByteProgressFn, ChunkUploadResponse, ChunkedCompleteResponse, ChunkedInitRequest,
    ChunkedInitResponse, ChunkedStatusResponse, DirectUploadRequest, DirectUploadResponse,
    StorageApi, UploadError, UploadedObject,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MockState {
    init_response: Option<ChunkedInitResponse>,
    init_error: Option<UploadError>,
    last_init_request: Option<ChunkedInitRequest>,
    /// 分片索引 -> (剩余失败次数, 错误)
    chunk_failures: HashMap<usize, (u32, UploadError)>,
    chunk_calls: HashMap<usize, u32>,
    /// 分片索引 -> 响应前的延迟
    chunk_delays: HashMap<usize, Duration>,
    /// 分片成功返回的先后顺序
    completion_order: Vec<usize>,
    statuses: VecDeque<ChunkedStatusResponse>,
    complete_error: Option<UploadError>,
    direct_response: Option<DirectUploadResponse>,
    direct_error: Option<UploadError>,
    object_names: Vec<String>,
    list_error: Option<UploadError>,
    aborted_sessions: Vec<String>,
}

/// 脚本化的存储后端
#[derive(Default)]
pub struct MockStorageApi {
    state: Mutex<MockState>,
    /// 分片请求挂起直到取消
    hang_chunks: std::sync::atomic::AtomicBool,
    in_flight_chunks: AtomicUsize,
    max_in_flight_chunks: AtomicUsize,
    init_calls: AtomicUsize,
    complete_calls: AtomicUsize,
    status_calls: AtomicUsize,
    direct_calls: AtomicUsize,
    list_calls: AtomicUsize,
}

impl MockStorageApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_init_response(&self, response: ChunkedInitResponse) {
        self.state.lock().init_response = Some(response);
    }

    pub fn fail_init(&self, error: UploadError) {
        self.state.lock().init_error = Some(error);
    }

    pub fn last_init_request(&self) -> Option<ChunkedInitRequest> {
        self.state.lock().last_init_request.clone()
    }

    /// 指定分片先失败 `times` 次
    pub fn fail_chunk(&self, index: usize, times: u32, error: UploadError) {
        self.state.lock().chunk_failures.insert(index, (times, error));
    }

    /// 按分片索引设置响应延迟（毫秒），打乱同批次分片的完成顺序
    pub fn set_chunk_delays(&self, delays_ms: &[u64]) {
        self.state.lock().chunk_delays = delays_ms
            .iter()
            .enumerate()
            .map(|(index, ms)| (index, Duration::from_millis(*ms)))
            .collect();
    }

    pub fn completion_order(&self) -> Vec<usize> {
        self.state.lock().completion_order.clone()
    }

    pub fn hang_chunks(&self) {
        self.hang_chunks.store(true, Ordering::SeqCst);
    }

    pub fn push_status(&self, status: ChunkedStatusResponse) {
        self.state.lock().statuses.push_back(status);
    }

    pub fn fail_complete(&self, error: UploadError) {
        self.state.lock().complete_error = Some(error);
    }

    pub fn set_direct_response(&self, response: DirectUploadResponse) {
        self.state.lock().direct_response = Some(response);
    }

    pub fn fail_direct(&self, error: UploadError) {
        self.state.lock().direct_error = Some(error);
    }

    pub fn set_object_names(&self, names: &[&str]) {
        self.state.lock().object_names = names.iter().map(|n| n.to_string()).collect();
    }

    pub fn fail_list(&self, error: UploadError) {
        self.state.lock().list_error = Some(error);
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn chunk_calls_for(&self, index: usize) -> u32 {
        self.state.lock().chunk_calls.get(&index).copied().unwrap_or(0)
    }

    pub fn chunk_calls(&self) -> u32 {
        self.state.lock().chunk_calls.values().sum()
    }

    pub fn max_in_flight_chunks(&self) -> usize {
        self.max_in_flight_chunks.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn direct_calls(&self) -> usize {
        self.direct_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn aborted_sessions(&self) -> Vec<String> {
        self.state.lock().aborted_sessions.clone()
    }

    /// 所有上传相关请求总数（不含列表查询）
    pub fn upload_calls(&self) -> usize {
        self.init_calls()
            + self.chunk_calls() as usize
            + self.complete_calls()
            + self.status_calls()
            + self.direct_calls()
    }
}

/// 构造状态响应
pub fn status(status: &str, is_complete: bool) -> ChunkedStatusResponse {
    ChunkedStatusResponse {
        status: status.to_string(),
        is_complete,
        ..Default::default()
    }
}

/// 构造已完成且带对象的状态响应
pub fn completed_status(name: &str, size: u64) -> ChunkedStatusResponse {
    ChunkedStatusResponse {
        object: Some(object(name, size)),
        ..status("COMPLETED", true)
    }
}

pub fn object(name: &str, size: u64) -> UploadedObject {
    UploadedObject {
        id: format!("obj-{}", name),
        origin_name: name.to_string(),
        size,
        ..Default::default()
    }
}

#[async_trait]
impl StorageApi for MockStorageApi {
    async fn upload_direct(
        &self,
        request: DirectUploadRequest,
        on_progress: ByteProgressFn,
        cancel: &CancellationToken,
    ) -> Result<DirectUploadResponse, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        self.direct_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(e) = self.state.lock().direct_error.clone() {
            return Err(e);
        }

        let total = request.data.len() as u64;
        let step = (total / 4).max(1);
        let mut sent = 0;
        while sent < total {
            sent = (sent + step).min(total);
            on_progress(sent);
        }

        let response = self.state.lock().direct_response.clone();
        Ok(response.unwrap_or_else(|| DirectUploadResponse {
            message: Some("File uploaded".to_string()),
            object: Some(object(&request.file_name, total)),
            cdn_url: None,
            duplicated: false,
        }))
    }

    async fn init_session(
        &self,
        _bucket_id: &str,
        request: &ChunkedInitRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkedInitResponse, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        self.init_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        state.last_init_request = Some(request.clone());
        if let Some(e) = state.init_error.clone() {
            return Err(e);
        }

        Ok(state.init_response.clone().unwrap_or_else(|| {
            let chunk_size = request.preferred_chunk_size;
            let total_chunks = if request.file_size == 0 {
                1
            } else {
                request.file_size.div_ceil(chunk_size) as usize
            };
            ChunkedInitResponse {
                upload_id: "session-1".to_string(),
                chunk_size,
                total_chunks,
                temp_prefix: None,
                expires_at: None,
            }
        }))
    }

    async fn upload_chunk(
        &self,
        _bucket_id: &str,
        _upload_id: &str,
        chunk_index: usize,
        _data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<ChunkUploadResponse, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let failure = {
            let mut state = self.state.lock();
            *state.chunk_calls.entry(chunk_index).or_insert(0) += 1;
            match state.chunk_failures.get_mut(&chunk_index) {
                Some((remaining, error)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(error.clone())
                }
                _ => None,
            }
        };

        let now = self.in_flight_chunks.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight_chunks.fetch_max(now, Ordering::SeqCst);

        if self.hang_chunks.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            self.in_flight_chunks.fetch_sub(1, Ordering::SeqCst);
            return Err(UploadError::Cancelled);
        }

        // 让同一批次的其他分片有机会并发进入
        tokio::task::yield_now().await;
        let delay = self.state.lock().chunk_delays.get(&chunk_index).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight_chunks.fetch_sub(1, Ordering::SeqCst);

        if let Some(e) = failure {
            return Err(e);
        }
        self.state.lock().completion_order.push(chunk_index);

        Ok(ChunkUploadResponse {
            chunk_index,
            status: "UPLOADING".to_string(),
            ..Default::default()
        })
    }

    async fn complete_session(
        &self,
        _bucket_id: &str,
        upload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ChunkedCompleteResponse, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        self.complete_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(e) = self.state.lock().complete_error.clone() {
            return Err(e);
        }

        Ok(ChunkedCompleteResponse {
            upload_id: upload_id.to_string(),
            status: "PROCESSING".to_string(),
            ..Default::default()
        })
    }

    async fn session_status(
        &self,
        _bucket_id: &str,
        _upload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ChunkedStatusResponse, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        self.status_calls.fetch_add(1, Ordering::SeqCst);

        Ok(self
            .state
            .lock()
            .statuses
            .pop_front()
            .unwrap_or_else(|| status("UPLOADING", false)))
    }

    async fn abort_session(&self, _bucket_id: &str, upload_id: &str) -> Result<(), UploadError> {
        self.state.lock().aborted_sessions.push(upload_id.to_string());
        Ok(())
    }

    async fn list_object_names(
        &self,
        _bucket_id: &str,
        _path: &str,
    ) -> Result<Vec<String>, UploadError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        match &state.list_error {
            Some(e) => Err(e.clone()),
            None => Ok(state.object_names.clone()),
        }
    }
}
