// 存储后端客户端实现
//
// 所有接口都挂在 {base_url}/api/v1/cloud/buckets/{bucket_id} 下，
// 每个请求携带 Bearer 令牌和 X-Device-ID 请求头。
// 请求与取消令牌竞争，取消时直接丢弃请求 future，底层连接随之断开。

use crate::api::{
    ChunkUploadResponse, ChunkedCompleteRequest, ChunkedCompleteResponse, ChunkedInitRequest,
    ChunkedInitResponse, ChunkedStatusResponse, CredentialProvider, DirectUploadResponse,
    ErrorBody, ObjectListResponse, UploadError,
};
use crate::config::ApiConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 直接上传时流式请求体的分块大小
const STREAM_PIECE_SIZE: usize = 64 * 1024;

/// 字节级进度回调（参数为已发送字节数）
pub type ByteProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// 直接上传请求
#[derive(Debug, Clone)]
pub struct DirectUploadRequest {
    pub bucket_id: String,
    pub file_name: String,
    pub content_type: String,
    /// 目标目录，空字符串表示根目录
    pub path: String,
    pub data: Vec<u8>,
}

/// 存储后端接口
///
/// 每次调用恰好发出一个网络请求，不做重试
#[async_trait]
pub trait StorageApi: Send + Sync {
    /// 小文件整体上传（multipart `file` + 可选 `path`）
    async fn upload_direct(
        &self,
        request: DirectUploadRequest,
        on_progress: ByteProgressFn,
        cancel: &CancellationToken,
    ) -> Result<DirectUploadResponse, UploadError>;

    /// 初始化分片上传会话
    async fn init_session(
        &self,
        bucket_id: &str,
        request: &ChunkedInitRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkedInitResponse, UploadError>;

    /// 上传单个分片
    async fn upload_chunk(
        &self,
        bucket_id: &str,
        upload_id: &str,
        chunk_index: usize,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<ChunkUploadResponse, UploadError>;

    /// 通知后端所有分片已上传，开始合并处理
    async fn complete_session(
        &self,
        bucket_id: &str,
        upload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ChunkedCompleteResponse, UploadError>;

    /// 查询会话处理状态
    async fn session_status(
        &self,
        bucket_id: &str,
        upload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ChunkedStatusResponse, UploadError>;

    /// 放弃上传会话
    async fn abort_session(&self, bucket_id: &str, upload_id: &str) -> Result<(), UploadError>;

    /// 列出目录下已有对象的文件名
    async fn list_object_names(
        &self,
        bucket_id: &str,
        path: &str,
    ) -> Result<Vec<String>, UploadError>;
}

/// 基于 reqwest 的存储后端客户端
#[derive(Clone)]
pub struct StorageClient {
    /// HTTP客户端
    client: Client,
    /// API 根地址（不含末尾斜杠）
    base_url: String,
    /// 凭证
    credentials: Arc<dyn CredentialProvider>,
}

impl std::fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl StorageClient {
    /// 创建客户端
    ///
    /// # 参数
    /// * `config` - API 配置
    /// * `credentials` - 凭证提供者
    pub fn new(config: &ApiConfig, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        info!("初始化存储客户端: base_url={}", base_url);

        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    /// 拼接 bucket 下的接口地址
    fn bucket_url(&self, bucket_id: &str, suffix: &str) -> String {
        format!(
            "{}/api/v1/cloud/buckets/{}{}",
            self.base_url,
            urlencoding::encode(bucket_id),
            suffix
        )
    }

    /// 添加设备标识和 Bearer 令牌
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("X-Device-ID", self.credentials.device_id());
        match self.credentials.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// 发送请求并读取响应文本
    ///
    /// 401 会通知凭证提供者；非 2xx 转为 Server 错误
    async fn execute(
        &self,
        request: RequestBuilder,
        cancel: &CancellationToken,
        what: &str,
    ) -> Result<String, UploadError> {
        let request = self.authorize(request);

        let exchange = async {
            let response = request
                .send()
                .await
                .map_err(|e| UploadError::Network(format!("Network error: {}", e)))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| UploadError::Network(format!("Network error: {}", e)))?;
            Ok::<_, UploadError>((status, text))
        };

        let (status, text) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("{}: 请求已取消", what);
                return Err(UploadError::Cancelled);
            }
            result = exchange => result?,
        };

        if status == StatusCode::UNAUTHORIZED {
            warn!("{}: 401 未授权", what);
            self.credentials.on_unauthorized();
            return Err(UploadError::Unauthorized);
        }

        if !status.is_success() {
            let message = extract_error_message(&text, status.as_u16());
            error!("{} 失败: status={}, message={}", what, status, message);
            return Err(UploadError::Server {
                status: status.as_u16(),
                message,
            });
        }

        debug!("{} 响应: status={}, body={}", what, status, text);
        Ok(text)
    }
}

/// 从错误响应体提取错误信息：message > error > 状态码
fn extract_error_message(body: &str, status: u16) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| {
            b.message
                .filter(|m| !m.is_empty())
                .or(b.error.filter(|e| !e.is_empty()))
        })
        .unwrap_or_else(|| format!("HTTP error! status: {}", status))
}

/// 解析 JSON 响应，空响应体按 `{}` 处理
fn decode<T: DeserializeOwned>(text: &str, what: &str) -> Result<T, UploadError> {
    let body = if text.trim().is_empty() { "{}" } else { text };
    serde_json::from_str(body).map_err(|e| UploadError::Decode(format!("{}: {}", what, e)))
}

/// 分片响应体仅供参考：2xx 即表示后端已收到分片，响应体解析失败不影响结果
fn decode_chunk_ack(text: &str, chunk_index: usize) -> ChunkUploadResponse {
    match decode::<ChunkUploadResponse>(text, "chunk upload response") {
        Ok(ack) => ack,
        Err(e) => {
            debug!("[分片#{}] 响应体无法解析，按成功处理: {}", chunk_index, e);
            ChunkUploadResponse {
                chunk_index,
                ..Default::default()
            }
        }
    }
}

#[async_trait]
impl StorageApi for StorageClient {
    async fn upload_direct(
        &self,
        request: DirectUploadRequest,
        on_progress: ByteProgressFn,
        cancel: &CancellationToken,
    ) -> Result<DirectUploadResponse, UploadError> {
        let total = request.data.len() as u64;
        info!(
            "直接上传: bucket={}, name={}, size={}, path={:?}",
            request.bucket_id, request.file_name, total, request.path
        );

        // 请求体按块流式发送，每发出一块回调一次进度
        let pieces: Vec<Vec<u8>> = request
            .data
            .chunks(STREAM_PIECE_SIZE)
            .map(|piece| piece.to_vec())
            .collect();
        let mut sent = 0u64;
        let stream = futures::stream::iter(pieces.into_iter().map(move |piece| {
            sent += piece.len() as u64;
            on_progress(sent);
            Ok::<Vec<u8>, std::io::Error>(piece)
        }));

        let part = multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), total)
            .file_name(request.file_name.clone())
            .mime_str(&request.content_type)
            .map_err(|e| {
                UploadError::Validation(format!(
                    "Invalid content type {}: {}",
                    request.content_type, e
                ))
            })?;

        let mut form = multipart::Form::new().part("file", part);
        if !request.path.is_empty() {
            form = form.text("path", request.path.clone());
        }

        let url = self.bucket_url(&request.bucket_id, "/objects");
        let text = self
            .execute(self.client.post(&url).multipart(form), cancel, "直接上传")
            .await?;
        decode(&text, "direct upload response")
    }

    async fn init_session(
        &self,
        bucket_id: &str,
        request: &ChunkedInitRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkedInitResponse, UploadError> {
        info!(
            "初始化分片上传: bucket={}, name={}, size={}, preferred_chunk={}",
            bucket_id, request.file_name, request.file_size, request.preferred_chunk_size
        );

        let url = self.bucket_url(bucket_id, "/chunked/init");
        let text = self
            .execute(self.client.post(&url).json(request), cancel, "初始化分片上传")
            .await?;
        decode(&text, "chunked init response")
    }

    async fn upload_chunk(
        &self,
        bucket_id: &str,
        upload_id: &str,
        chunk_index: usize,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<ChunkUploadResponse, UploadError> {
        debug!(
            "[分片#{}] 发送请求: upload_id={}..., size={}",
            chunk_index,
            &upload_id[..8.min(upload_id.len())],
            data.len()
        );

        let part = multipart::Part::bytes(data)
            .file_name(format!("chunk_{:05}.part", chunk_index))
            .mime_str("application/octet-stream")
            .map_err(|e| UploadError::Validation(e.to_string()))?;
        let form = multipart::Form::new().part("chunk", part);

        let url = self.bucket_url(
            bucket_id,
            &format!(
                "/chunked/chunk?upload_id={}&chunk_index={}",
                urlencoding::encode(upload_id),
                chunk_index
            ),
        );
        let text = self
            .execute(self.client.post(&url).multipart(form), cancel, "上传分片")
            .await?;
        Ok(decode_chunk_ack(&text, chunk_index))
    }

    async fn complete_session(
        &self,
        bucket_id: &str,
        upload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ChunkedCompleteResponse, UploadError> {
        info!("完成分片上传: upload_id={}", upload_id);

        let url = self.bucket_url(bucket_id, "/chunked/complete");
        let body = ChunkedCompleteRequest {
            upload_id: upload_id.to_string(),
        };
        let text = self
            .execute(self.client.post(&url).json(&body), cancel, "完成分片上传")
            .await?;
        decode(&text, "chunked complete response")
    }

    async fn session_status(
        &self,
        bucket_id: &str,
        upload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ChunkedStatusResponse, UploadError> {
        let url = self.bucket_url(
            bucket_id,
            &format!("/chunked/{}/status", urlencoding::encode(upload_id)),
        );
        let text = self
            .execute(self.client.get(&url), cancel, "查询上传状态")
            .await?;
        decode(&text, "chunked status response")
    }

    async fn abort_session(&self, bucket_id: &str, upload_id: &str) -> Result<(), UploadError> {
        info!("放弃分片上传会话: upload_id={}", upload_id);

        let url = self.bucket_url(
            bucket_id,
            &format!("/chunked/{}", urlencoding::encode(upload_id)),
        );
        self.execute(self.client.delete(&url), &CancellationToken::new(), "放弃上传会话")
            .await?;
        Ok(())
    }

    async fn list_object_names(
        &self,
        bucket_id: &str,
        path: &str,
    ) -> Result<Vec<String>, UploadError> {
        let suffix = if path.is_empty() {
            "/objects".to_string()
        } else {
            format!("/objects?path={}", urlencoding::encode(path))
        };
        let url = self.bucket_url(bucket_id, &suffix);
        let text = self
            .execute(self.client.get(&url), &CancellationToken::new(), "列出对象")
            .await?;
        let listing: ObjectListResponse = decode(&text, "object list response")?;

        Ok(listing
            .objects
            .unwrap_or_default()
            .into_iter()
            .map(|o| o.origin_name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StaticCredentials;

    fn client(base_url: &str) -> StorageClient {
        let config = ApiConfig {
            base_url: base_url.to_string(),
            ..Default::default()
        };
        let creds = Arc::new(StaticCredentials::new(Some("tok".to_string()), "device_x"));
        StorageClient::new(&config, creds).unwrap()
    }

    #[test]
    fn test_bucket_url() {
        let c = client("https://api.example.com/");
        assert_eq!(
            c.bucket_url("b-1", "/chunked/init"),
            "https://api.example.com/api/v1/cloud/buckets/b-1/chunked/init"
        );
    }

    #[test]
    fn test_extract_error_message() {
        assert_eq!(
            extract_error_message(r#"{"message":"quota exceeded"}"#, 403),
            "quota exceeded"
        );
        assert_eq!(
            extract_error_message(r#"{"error":"bad index"}"#, 400),
            "bad index"
        );
        assert_eq!(
            extract_error_message(r#"{"message":"","error":"fallback"}"#, 400),
            "fallback"
        );
        assert_eq!(
            extract_error_message("<html>gateway</html>", 502),
            "HTTP error! status: 502"
        );
    }

    #[test]
    fn test_decode_empty_body() {
        let resp: ObjectListResponse = decode("", "list").unwrap();
        assert!(resp.objects.is_none());

        let err = decode::<ChunkedInitResponse>("", "init").unwrap_err();
        assert_eq!(err.kind(), "decode");
    }

    #[test]
    fn test_chunk_ack_tolerates_any_body() {
        assert_eq!(decode_chunk_ack("OK", 3).chunk_index, 3);
        assert_eq!(decode_chunk_ack(r#"{"chunk_index":"x"}"#, 4).chunk_index, 4);

        let ack = decode_chunk_ack(r#"{"chunk_index":2,"status":"uploading"}"#, 2);
        assert_eq!(ack.chunk_index, 2);
        assert_eq!(ack.status, "UPLOADING");
    }

    /// 本地单次响应的 HTTP 服务，读完请求后返回固定响应
    async fn serve_once(response: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            // multipart 请求体以 "--\r\n" 结尾
            while !received.ends_with(b"--\r\n") {
                match tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf)).await {
                    Ok(Ok(n)) if n > 0 => received.extend_from_slice(&buf[..n]),
                    _ => break,
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_upload_chunk_plain_ok_body_is_success() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK",
        )
        .await;
        let c = client(&base);

        let ack = c
            .upload_chunk("b", "session-1", 7, vec![1u8; 32], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ack.chunk_index, 7);
    }

    #[tokio::test]
    async fn test_upload_chunk_server_error_still_fails() {
        let base = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let c = client(&base);

        let err = c
            .upload_chunk("b", "session-1", 0, vec![1u8; 8], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_cancelled_before_request() {
        // 取消令牌优先于请求，不会真正发出连接
        let c = client("http://127.0.0.1:9");
        let token = CancellationToken::new();
        token.cancel();

        let result = c.session_status("b", "u", &token).await;
        assert_eq!(result.unwrap_err(), UploadError::Cancelled);
    }
}
