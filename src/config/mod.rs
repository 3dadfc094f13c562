// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

const MIB: u64 = 1024 * 1024;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 后端 API 配置
    #[serde(default)]
    pub api: ApiConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 后端 API 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API 根地址
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 设备标识（首次加载时自动生成并写回配置文件）
    #[serde(default)]
    pub device_id: Option<String>,
    /// 单个请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.gauas.online".to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            device_id: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ApiConfig {
    /// 获取设备标识，未设置时生成一个新的
    ///
    /// # 返回
    /// (设备标识, 是否为新生成)
    pub fn ensure_device_id(&mut self) -> (String, bool) {
        match &self.device_id {
            Some(id) if !id.is_empty() => (id.clone(), false),
            _ => {
                let id = generate_device_id();
                self.device_id = Some(id.clone());
                (id, true)
            }
        }
    }
}

/// 生成设备标识
pub fn generate_device_id() -> String {
    format!("device_{}", uuid::Uuid::new_v4().simple())
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 直接上传/分片上传分界（字节），小于等于该值走直接上传
    #[serde(default = "default_threshold_bytes")]
    pub threshold_bytes: u64,
    /// 期望分片大小（字节），仅作为初始化会话时的建议值
    #[serde(default = "default_preferred_chunk_size")]
    pub preferred_chunk_size: u64,
    /// 单个分片最大尝试次数（含首次）
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// 线性退避步长（毫秒），第 n 次失败后等待 n × 步长
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// 状态轮询间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 最大轮询次数
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    /// 高峰时段开始（一天中的分钟数，含）
    #[serde(default = "default_peak_start_minute")]
    pub peak_start_minute: u32,
    /// 高峰时段结束（一天中的分钟数，含）
    #[serde(default = "default_peak_end_minute")]
    pub peak_end_minute: u32,
    /// 高峰时段并发分片数
    #[serde(default = "default_peak_concurrency")]
    pub peak_concurrency: usize,
    /// 非高峰时段并发分片数
    #[serde(default = "default_off_peak_concurrency")]
    pub off_peak_concurrency: usize,
    /// 未知类型文件使用的 Content-Type
    #[serde(default = "default_content_type")]
    pub default_content_type: String,
    /// 取消分片任务时是否通知后端中止会话（默认关闭，会话由后端过期清理）
    #[serde(default)]
    pub abort_on_cancel: bool,
}

fn default_threshold_bytes() -> u64 {
    30 * MIB
}

fn default_preferred_chunk_size() -> u64 {
    10 * MIB
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_max_poll_attempts() -> u32 {
    200
}

fn default_peak_start_minute() -> u32 {
    7 * 60 // 07:00
}

fn default_peak_end_minute() -> u32 {
    19 * 60 + 30 // 19:30
}

fn default_peak_concurrency() -> usize {
    5
}

fn default_off_peak_concurrency() -> usize {
    2
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: default_threshold_bytes(),
            preferred_chunk_size: default_preferred_chunk_size(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_attempts: default_max_poll_attempts(),
            peak_start_minute: default_peak_start_minute(),
            peak_end_minute: default_peak_end_minute(),
            peak_concurrency: default_peak_concurrency(),
            off_peak_concurrency: default_off_peak_concurrency(),
            default_content_type: default_content_type(),
            abort_on_cancel: false,
        }
    }
}

impl UploadConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.preferred_chunk_size == 0 {
            anyhow::bail!("preferred_chunk_size 必须大于 0");
        }
        if self.max_retry_attempts == 0 {
            anyhow::bail!("max_retry_attempts 必须大于 0");
        }
        if self.max_poll_attempts == 0 {
            anyhow::bail!("max_poll_attempts 必须大于 0");
        }
        if self.peak_concurrency == 0 || self.off_peak_concurrency == 0 {
            anyhow::bail!("并发分片数必须大于 0");
        }
        if self.peak_start_minute > self.peak_end_minute || self.peak_end_minute >= 24 * 60 {
            anyhow::bail!(
                "高峰时段配置无效: {}-{}",
                self.peak_start_minute,
                self.peak_end_minute
            );
        }
        Ok(())
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * MIB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传参数验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload.validate().context("保存配置失败：上传参数无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    ///
    /// 设备标识缺失时会生成并写回文件，保证同一台设备标识稳定。
    /// 文件存在但无法解析时使用默认配置，不覆盖原文件
    pub async fn load_or_default(path: &str) -> Self {
        let (mut config, loaded) = match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                (config, true)
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                (Self::default(), false)
            }
        };
        let missing = !loaded && fs::metadata(path).await.is_err();

        let (device_id, generated) = config.api.ensure_device_id();
        if generated {
            tracing::info!("已生成设备标识: {}", device_id);
        }

        if !loaded && !missing {
            tracing::warn!("保留无法解析的配置文件，不写回: {}", path);
        } else if generated || missing {
            if let Err(e) = config.save_to_file(path).await {
                tracing::error!("保存配置失败: {}", e);
            }
        }

        config
    }
}
