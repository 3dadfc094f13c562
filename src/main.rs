// 命令行入口
//
// 用法: cloud-upload <bucket_id> [--path <目录>] <文件>...
// 令牌从环境变量 CLOUD_UPLOAD_TOKEN 读取，配置文件路径可用 CLOUD_UPLOAD_CONFIG 指定

use anyhow::{bail, Context, Result};
use cloud_upload::{
    format_bytes, logging, AppConfig, StaticCredentials, StorageClient, UploadEvent, UploadFile,
    UploadManager, UploadStatus,
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 命令行参数
struct CliArgs {
    bucket_id: String,
    path: String,
    files: Vec<String>,
}

fn parse_args() -> Result<CliArgs> {
    let mut args = std::env::args().skip(1);
    let bucket_id = match args.next() {
        Some(bucket_id) if !bucket_id.starts_with('-') => bucket_id,
        _ => bail!("用法: cloud-upload <bucket_id> [--path <目录>] <文件>..."),
    };

    let mut path = String::new();
    let mut files = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--path" | "-p" => {
                path = args.next().context("--path 缺少参数")?;
            }
            _ => files.push(arg),
        }
    }

    if files.is_empty() {
        bail!("至少需要一个待上传文件");
    }

    Ok(CliArgs {
        bucket_id,
        path,
        files,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    let config_path =
        std::env::var("CLOUD_UPLOAD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = AppConfig::load_or_default(&config_path).await;

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    info!("Cloud Upload v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let device_id = config
        .api
        .device_id
        .clone()
        .unwrap_or_else(cloud_upload::config::generate_device_id);
    let token = std::env::var("CLOUD_UPLOAD_TOKEN").ok();
    if token.is_none() {
        warn!("未设置 CLOUD_UPLOAD_TOKEN，请求将不携带凭证");
    }

    let credentials = Arc::new(StaticCredentials::new(token, device_id));
    let client = StorageClient::new(&config.api, credentials).context("创建存储客户端失败")?;
    let manager = UploadManager::new(Arc::new(client), config.upload.clone());
    let mut events = manager.subscribe();

    let mut files = Vec::with_capacity(args.files.len());
    for path in &args.files {
        match UploadFile::from_path(path).await {
            Ok(file) => files.push(file),
            Err(e) => error!("跳过文件 {}: {}", path, e),
        }
    }
    if files.is_empty() {
        bail!("没有可上传的文件");
    }

    let task_ids = manager
        .add_files(&args.bucket_id, files, &args.path)
        .await
        .context("添加上传任务失败")?;

    // 以登记表判断结束，事件滞后丢失终态事件时不会一直等待
    let wait = manager.wait_for(&task_ids, &mut events, |event| {
        if let UploadEvent::Progress {
            task_id,
            progress,
            message,
            ..
        } = event
        {
            info!("[{}] {}% {}", task_id, progress, message);
        }
    });
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("收到中断信号，取消全部上传");
            manager.cancel_all_uploads();
        }
        _ = wait => {}
    }

    manager.shutdown().await;

    let results = manager.completed_uploads();
    let mut failed = 0;
    for result in &results {
        match result.status {
            UploadStatus::Completed => info!(
                "✓ {} ({}){}",
                result.file_name,
                format_bytes(Some(result.size)),
                if result.duplicated { " [已存在]" } else { "" }
            ),
            UploadStatus::Failed => {
                failed += 1;
                error!(
                    "✗ {}: {}",
                    result.file_name,
                    result.error.as_deref().unwrap_or("未知错误")
                );
            }
            UploadStatus::Cancelled => warn!("- {}: 已取消", result.file_name),
        }
    }

    info!(
        "上传结束: 共 {} 个, 成功 {} 个, 失败 {} 个",
        results.len(),
        results.iter().filter(|r| r.success()).count(),
        failed
    );

    if failed > 0 {
        bail!("{} 个文件上传失败", failed);
    }
    Ok(())
}
