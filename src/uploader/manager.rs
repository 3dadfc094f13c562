// 上传管理器
//
// 应用其他部分唯一需要交互的组件：
// - 添加文件（处理重名、创建任务、异步派发）
// - 取消单个/全部任务
// - 查询进行中和已结束的任务
// - 终态回调与事件广播
//
// 任务 ID 在任意时刻只出现在 进行中/已结束 两个列表之一，
// 两个列表由同一把锁保护，移动在同一临界区内完成

use crate::api::{StorageApi, UploadError};
use crate::config::UploadConfig;
use crate::events::UploadEvent;
use crate::uploader::concurrency::{ConcurrencyPolicy, PeakHoursPolicy};
use crate::uploader::naming::{resolve_unique_name, ApiExistingNames, ExistingNames};
use crate::uploader::{
    format_bytes, route, ProgressReporter, ProgressUpdate, UploadEngine, UploadFile,
    UploadProgress, UploadResult, UploadRoute, UploadStatus, UploadTask,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 事件通道容量
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 终态回调
pub type CompletionCallback = Arc<dyn Fn(&UploadResult) + Send + Sync>;

/// 规范化目标目录：去掉首尾斜杠，根目录为空字符串
pub fn normalize_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

/// 进行中任务的只读快照
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UploadTaskInfo {
    pub task_id: String,
    pub bucket_id: String,
    pub path: String,
    pub file_name: String,
    pub size: u64,
    pub route: UploadRoute,
    pub progress: UploadProgress,
    pub created_at: i64,
}

/// 进行中的任务
struct InFlightUpload {
    task: UploadTask,
    route: UploadRoute,
    progress: UploadProgress,
}

impl InFlightUpload {
    fn info(&self) -> UploadTaskInfo {
        UploadTaskInfo {
            task_id: self.task.id.clone(),
            bucket_id: self.task.bucket_id.clone(),
            path: self.task.path.clone(),
            file_name: self.task.file.name.clone(),
            size: self.task.size(),
            route: self.route,
            progress: self.progress.clone(),
            created_at: self.task.created_at,
        }
    }
}

/// 任务登记表（进行中 + 已结束）
#[derive(Default)]
struct UploadRegistry {
    /// 进行中任务，按添加顺序
    in_flight: Vec<InFlightUpload>,
    /// 已结束任务，按结束顺序
    completed: Vec<UploadResult>,
}

impl UploadRegistry {
    fn position(&self, task_id: &str) -> Option<usize> {
        self.in_flight.iter().position(|u| u.task.id == task_id)
    }

    /// 同一目录下已占用的名称（进行中 + 成功结束）
    fn taken_names(&self, bucket_id: &str, path: &str) -> HashSet<String> {
        let in_flight = self
            .in_flight
            .iter()
            .filter(|u| u.task.bucket_id == bucket_id && u.task.path == path)
            .map(|u| u.task.file.name.clone());
        let completed = self
            .completed
            .iter()
            .filter(|r| r.success() && r.bucket_id == bucket_id && r.path == path)
            .map(|r| r.file_name.clone());
        in_flight.chain(completed).collect()
    }

    /// 把任务从进行中移到已结束
    ///
    /// # 返回
    /// 任务不在进行中（已被取消移走）时返回 false，结果被丢弃
    fn finish(&mut self, result: UploadResult) -> bool {
        match self.position(&result.task_id) {
            Some(index) => {
                self.in_flight.remove(index);
                self.completed.push(result);
                true
            }
            None => false,
        }
    }
}

/// 任务驱动循环共享的状态
#[derive(Clone)]
struct DriverContext {
    engine: Arc<UploadEngine>,
    registry: Arc<Mutex<UploadRegistry>>,
    events: broadcast::Sender<UploadEvent>,
    on_complete: Option<CompletionCallback>,
}

impl DriverContext {
    fn publish(&self, event: UploadEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(event);
    }

    /// 把一次进度更新应用到进行中任务并广播
    fn apply_update(&self, task_id: &str, update: &ProgressUpdate) {
        let mut events = Vec::with_capacity(2);
        {
            let mut registry = self.registry.lock();
            let Some(index) = registry.position(task_id) else {
                return;
            };
            let upload = &mut registry.in_flight[index];
            let old_phase = upload.progress.phase;

            match upload.progress.apply(update) {
                Ok(changed) => {
                    if changed {
                        events.push(UploadEvent::PhaseChanged {
                            task_id: task_id.to_string(),
                            old_phase,
                            new_phase: upload.progress.phase,
                        });
                    }
                    if !upload.progress.phase.is_terminal() {
                        let progress = &upload.progress;
                        events.push(UploadEvent::Progress {
                            task_id: task_id.to_string(),
                            phase: progress.phase,
                            progress: progress.percent,
                            message: progress.message.clone(),
                            speed: progress.speed,
                            uploaded_chunks: progress.uploaded_chunks,
                            total_chunks: progress.total_chunks,
                        });
                    }
                }
                Err(e) => {
                    debug!("[{}] 忽略进度更新: {}", task_id, e);
                }
            }
        }

        for event in events {
            self.publish(event);
        }
    }

    /// 任务到达终态后的处理（锁外调用回调）
    fn settle(&self, result: &UploadResult) {
        let event = match result.status {
            UploadStatus::Completed => UploadEvent::Completed {
                task_id: result.task_id.clone(),
                object: result.object.clone().unwrap_or_default(),
                duplicated: result.duplicated,
            },
            UploadStatus::Failed => UploadEvent::Failed {
                task_id: result.task_id.clone(),
                error: result.error.clone().unwrap_or_default(),
            },
            UploadStatus::Cancelled => UploadEvent::Cancelled {
                task_id: result.task_id.clone(),
            },
        };
        self.publish(event);

        if let Some(callback) = &self.on_complete {
            callback(result);
        }
    }

    /// 单个任务的驱动循环：运行引擎，同时消费进度更新
    async fn drive(self, task: UploadTask) {
        let (reporter, mut updates) = ProgressReporter::channel();

        let run = async {
            let reporter = reporter;
            self.engine.run(&task, &reporter).await
        };
        let pump = async {
            while let Some(update) = updates.recv().await {
                self.apply_update(&task.id, &update);
            }
        };
        let (result, ()) = tokio::join!(run, pump);

        let finished = self.registry.lock().finish(result.clone());
        if finished {
            self.settle(&result);
        } else {
            debug!("[{}] 任务已被移出进行中列表，丢弃结果", task.id);
        }
    }
}

/// 上传管理器
///
/// 进程启动时创建一次，`shutdown` 时销毁
pub struct UploadManager {
    /// 存储后端
    api: Arc<dyn StorageApi>,
    /// 上传配置
    config: UploadConfig,
    /// 并发分片数策略
    concurrency: Arc<dyn ConcurrencyPolicy>,
    /// 目录已有文件名查询
    existing_names: Arc<dyn ExistingNames>,
    /// 进行中/已结束任务
    registry: Arc<Mutex<UploadRegistry>>,
    /// 事件广播
    events: broadcast::Sender<UploadEvent>,
    /// 终态回调
    on_complete: Option<CompletionCallback>,
    /// 任务驱动循环
    drivers: Mutex<JoinSet<()>>,
    /// 根取消令牌，每个任务持有子令牌
    root_token: CancellationToken,
    /// 是否已关闭
    shut_down: AtomicBool,
}

impl UploadManager {
    /// 创建上传管理器
    ///
    /// 默认使用按时段的并发策略，并通过后端对象列表查询重名
    pub fn new(api: Arc<dyn StorageApi>, config: UploadConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            concurrency: Arc::new(PeakHoursPolicy::from_config(&config)),
            existing_names: Arc::new(ApiExistingNames::new(api.clone())),
            api,
            config,
            registry: Arc::new(Mutex::new(UploadRegistry::default())),
            events,
            on_complete: None,
            drivers: Mutex::new(JoinSet::new()),
            root_token: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// 替换并发分片数策略
    pub fn with_concurrency_policy(mut self, policy: Arc<dyn ConcurrencyPolicy>) -> Self {
        self.concurrency = policy;
        self
    }

    /// 替换已有文件名查询
    pub fn with_existing_names(mut self, existing_names: Arc<dyn ExistingNames>) -> Self {
        self.existing_names = existing_names;
        self
    }

    /// 注册终态回调（完成、失败、取消都会调用）
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&UploadResult) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    /// 订阅任务事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    fn context(&self) -> DriverContext {
        DriverContext {
            engine: Arc::new(UploadEngine::new(
                self.api.clone(),
                self.config.clone(),
                self.concurrency.clone(),
            )),
            registry: self.registry.clone(),
            events: self.events.clone(),
            on_complete: self.on_complete.clone(),
        }
    }

    /// 添加上传文件
    ///
    /// 每个文件一个独立任务，立即返回，不等待上传结束
    ///
    /// # 参数
    /// * `bucket_id` - 目标 bucket
    /// * `files` - 待上传文件
    /// * `path` - 目标目录（斜杠分隔，首尾斜杠会被去掉）
    ///
    /// # 返回
    /// 新建任务的 ID 列表，与 `files` 顺序一致
    pub async fn add_files(
        &self,
        bucket_id: &str,
        files: Vec<UploadFile>,
        path: &str,
    ) -> Result<Vec<String>, UploadError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(UploadError::Validation(
                "Upload manager is shut down".to_string(),
            ));
        }
        if bucket_id.is_empty() {
            return Err(UploadError::Validation("Bucket id is required".to_string()));
        }
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let path = normalize_path(path);

        let existing = match self.existing_names.existing_names(bucket_id, &path).await {
            Ok(names) => names,
            Err(e) => {
                warn!(
                    "查询目录已有文件失败，按无重名处理: {}/{}: {}",
                    bucket_id, path, e
                );
                HashSet::new()
            }
        };

        let context = self.context();
        let mut created = Vec::with_capacity(files.len());

        {
            let mut registry = self.registry.lock();
            let mut taken = registry.taken_names(bucket_id, &path);
            taken.extend(existing);

            for mut file in files {
                let unique = resolve_unique_name(&file.name, &taken);
                if unique != file.name {
                    info!("文件重名，自动改名: {} -> {}", file.name, unique);
                }
                taken.insert(unique.clone());
                file.name = unique;

                let task = UploadTask::new(
                    bucket_id,
                    path.clone(),
                    file,
                    self.root_token.child_token(),
                );
                let upload_route = route(task.size(), self.config.threshold_bytes);

                info!(
                    "添加上传任务: id={}, 文件={}, 大小={}, 目标={}/{}",
                    task.id,
                    task.file_name(),
                    format_bytes(Some(task.size())),
                    bucket_id,
                    path
                );

                registry.in_flight.push(InFlightUpload {
                    task: task.clone(),
                    route: upload_route,
                    progress: UploadProgress::default(),
                });
                created.push((task, upload_route));
            }
        }

        let mut ids = Vec::with_capacity(created.len());
        let mut drivers = self.drivers.lock();
        // 回收已结束的驱动循环
        while drivers.try_join_next().is_some() {}

        for (task, upload_route) in created {
            context.publish(UploadEvent::Created {
                task_id: task.id.clone(),
                bucket_id: task.bucket_id.clone(),
                path: task.path.clone(),
                file_name: task.file.name.clone(),
                total_size: task.size(),
                route: upload_route,
            });
            ids.push(task.id.clone());
            drivers.spawn(context.clone().drive(task));
        }

        Ok(ids)
    }

    /// 取消任务
    ///
    /// 触发取消令牌，并在同一临界区内把任务移到已结束列表
    ///
    /// # 返回
    /// 任务不在进行中时返回 false
    pub fn cancel_upload(&self, task_id: &str) -> bool {
        let result = {
            let mut registry = self.registry.lock();
            let Some(index) = registry.position(task_id) else {
                return false;
            };
            let upload = registry.in_flight.remove(index);
            upload.task.cancel_token.cancel();
            let result = UploadResult::cancelled(&upload.task);
            registry.completed.push(result.clone());
            result
        };

        info!("[{}] 任务已取消", task_id);
        self.context().settle(&result);
        true
    }

    /// 取消全部进行中任务
    ///
    /// # 返回
    /// 被取消的任务数
    pub fn cancel_all_uploads(&self) -> usize {
        let results: Vec<UploadResult> = {
            let mut registry = self.registry.lock();
            let uploads = std::mem::take(&mut registry.in_flight);
            let results: Vec<UploadResult> = uploads
                .iter()
                .map(|upload| {
                    upload.task.cancel_token.cancel();
                    UploadResult::cancelled(&upload.task)
                })
                .collect();
            registry.completed.extend(results.iter().cloned());
            results
        };

        if !results.is_empty() {
            info!("已取消全部 {} 个上传任务", results.len());
            let context = self.context();
            for result in &results {
                context.settle(result);
            }
        }
        results.len()
    }

    /// 清空已结束列表
    ///
    /// # 返回
    /// 清除的记录数
    pub fn clear_completed(&self) -> usize {
        let count = {
            let mut registry = self.registry.lock();
            let count = registry.completed.len();
            registry.completed.clear();
            count
        };
        if count > 0 {
            info!("已清除 {} 条已结束记录", count);
            let _ = self.events.send(UploadEvent::Cleared { count });
        }
        count
    }

    /// 某个 bucket（可选目录）下的进行中任务
    pub fn get_uploading_files_for_bucket(
        &self,
        bucket_id: &str,
        path: Option<&str>,
    ) -> Vec<UploadTaskInfo> {
        let path = path.map(normalize_path);
        self.registry
            .lock()
            .in_flight
            .iter()
            .filter(|u| u.task.bucket_id == bucket_id)
            .filter(|u| path.as_deref().map_or(true, |p| u.task.path == p))
            .map(InFlightUpload::info)
            .collect()
    }

    /// 全部进行中任务
    pub fn uploading_files(&self) -> Vec<UploadTaskInfo> {
        self.registry
            .lock()
            .in_flight
            .iter()
            .map(InFlightUpload::info)
            .collect()
    }

    /// 全部已结束任务
    pub fn completed_uploads(&self) -> Vec<UploadResult> {
        self.registry.lock().completed.clone()
    }

    /// 查询进行中任务
    pub fn get_task(&self, task_id: &str) -> Option<UploadTaskInfo> {
        let registry = self.registry.lock();
        registry
            .position(task_id)
            .map(|index| registry.in_flight[index].info())
    }

    /// 查询已结束任务的结果
    pub fn get_result(&self, task_id: &str) -> Option<UploadResult> {
        self.registry
            .lock()
            .completed
            .iter()
            .find(|r| r.task_id == task_id)
            .cloned()
    }

    /// 进行中任务数
    pub fn active_count(&self) -> usize {
        self.registry.lock().in_flight.len()
    }

    /// 指定任务中是否还有未结束的
    pub fn any_in_flight(&self, task_ids: &[String]) -> bool {
        self.registry
            .lock()
            .in_flight
            .iter()
            .any(|u| task_ids.contains(&u.task.id))
    }

    /// 等待指定任务全部结束，期间把收到的事件交给 `on_event`
    ///
    /// 结束条件以登记表为准，接收滞后丢掉终态事件时也能返回
    pub async fn wait_for<F>(
        &self,
        task_ids: &[String],
        events: &mut broadcast::Receiver<UploadEvent>,
        mut on_event: F,
    ) where
        F: FnMut(&UploadEvent),
    {
        while self.any_in_flight(task_ids) {
            match events.recv().await {
                Ok(event) => on_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("事件接收滞后，跳过 {} 条", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// 是否已关闭
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// 关闭管理器：取消全部任务并等待驱动循环退出
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("正在关闭上传管理器...");
        self.cancel_all_uploads();
        self.root_token.cancel();

        let mut drivers = std::mem::take(&mut *self.drivers.lock());
        while let Some(joined) = drivers.join_next().await {
            if let Err(e) = joined {
                warn!("任务驱动循环异常退出: {}", e);
            }
        }
        info!("上传管理器已关闭");
    }
}
