//! 并发文件夹上传
//!
//! 广度优先逐层创建远程文件夹：
//! - 父目录创建成功后才把子目录入队（子目录的 remote_parent_id 在此时填入）
//! - 工作协程数受 `AdaptiveConcurrency` 限制
//! - 每个文件夹的文件作为一批交给网盘客户端上传
//! - 取消时级联取消子任务，并删除已创建的根目录

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pool::AdaptiveConcurrency;
use super::tree::{FolderNode, FolderTreeWalker};
use crate::common::MemoryPressureSampler;
use crate::config::UploadConfig;
use crate::error::{Result, TransferError};
use crate::remote::{
    ErrorReporter, LocalCache, RemoteStorageClient, UploadBatchOptions, UploadFile,
};
use crate::task::{
    NewTask, StopAction, TaskFilter, TaskKind, TaskPatch, TaskPayload, TaskRegistry, TaskStatus,
};

/// 上传成功回调，参数为远程根目录ID
pub type OnUploadSuccess = Arc<dyn Fn(&str) + Send + Sync>;

/// 上传选项
#[derive(Clone, Default)]
pub struct UploadOptions {
    /// 重试时复用的任务ID
    pub existing_task_id: Option<String>,
    /// 是否显示系统通知
    pub show_notification: bool,
    pub on_success: Option<OnUploadSuccess>,
}

/// 单次上传的共享状态
struct UploadRun {
    task_id: String,
    total_items: u64,
    /// 已完成条目数（锁内发布进度，保证进度按完成顺序递增）
    items_done: Mutex<u64>,
    /// 已创建的远程根目录（取消时删除）
    root_remote_id: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl UploadRun {
    fn advance(&self, registry: &TaskRegistry, count: u64) {
        let mut done = self.items_done.lock();
        *done = (*done + count).min(self.total_items);
        let progress = if self.total_items == 0 {
            1.0
        } else {
            *done as f64 / self.total_items as f64
        };
        registry.update(
            &self.task_id,
            TaskPatch {
                items_done: Some(*done),
                progress: Some(progress),
                ..Default::default()
            },
        );
    }
}

/// 单个目录节点的处理结果
struct NodeOutcome {
    folder_id: String,
    children: Vec<FolderNode>,
}

/// 并发文件夹上传器
#[derive(Clone)]
pub struct ConcurrentFolderUploader {
    registry: TaskRegistry,
    storage: Arc<dyn RemoteStorageClient>,
    cache: Arc<dyn LocalCache>,
    reporter: Arc<dyn ErrorReporter>,
    sampler: Option<Arc<dyn MemoryPressureSampler>>,
    config: UploadConfig,
}

impl ConcurrentFolderUploader {
    pub fn new(
        registry: TaskRegistry,
        storage: Arc<dyn RemoteStorageClient>,
        cache: Arc<dyn LocalCache>,
        reporter: Arc<dyn ErrorReporter>,
        config: UploadConfig,
    ) -> Self {
        Self {
            registry,
            storage,
            cache,
            reporter,
            sampler: None,
            config,
        }
    }

    /// 设置内存压力采样器（不设置时并发固定）
    pub fn with_sampler(mut self, sampler: Arc<dyn MemoryPressureSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// 上传目录树到 `destination_parent_id`，返回任务ID
    ///
    /// 上传失败只记录在任务上（并上报），不会作为 `Err` 返回；
    /// `Err` 仅表示 `existing_task_id` 无法复用。
    pub async fn upload(
        &self,
        root: FolderNode,
        destination_parent_id: &str,
        options: UploadOptions,
    ) -> Result<String> {
        let total_items = FolderTreeWalker::count_items(&root);
        let task_id = self.prepare_task(&root, destination_parent_id, &options, total_items)?;

        info!(
            "开始上传文件夹: task_id={}, name={}, parent={}, total_items={}",
            task_id, root.name, destination_parent_id, total_items
        );

        let run = Arc::new(UploadRun {
            task_id: task_id.clone(),
            total_items,
            items_done: Mutex::new(0),
            root_remote_id: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        self.registry
            .set_stop_or_cancel(&task_id, self.stop_action(&run), &run.cancel);

        let mut root = root;
        root.remote_parent_id = Some(destination_parent_id.to_string());
        let result = self.run_tree(root, &run).await;

        self.finish(&run, result, &options).await;
        Ok(task_id)
    }

    /// 创建任务，或重置要重试的任务
    fn prepare_task(
        &self,
        root: &FolderNode,
        destination_parent_id: &str,
        options: &UploadOptions,
        total_items: u64,
    ) -> Result<String> {
        let patch = TaskPatch {
            status: Some(TaskStatus::InProcess),
            items_total: Some(total_items),
            ..Default::default()
        };

        if let Some(existing) = &options.existing_task_id {
            self.registry.restart(existing)?;
            self.registry.update(existing, patch);
            return Ok(existing.clone());
        }

        let payload = TaskPayload {
            name: root.name.clone(),
            destination_id: Some(destination_parent_id.to_string()),
            show_notification: options.show_notification,
            ..Default::default()
        };
        let task_id = self
            .registry
            .create(NewTask::new(TaskKind::UploadFolder, payload));
        self.registry.update(&task_id, patch);
        Ok(task_id)
    }

    /// 停止动作：放弃整个目录树
    fn stop_action(&self, run: &Arc<UploadRun>) -> StopAction {
        let registry = self.registry.clone();
        let storage = self.storage.clone();
        let cache = self.cache.clone();
        let run = run.clone();

        Arc::new(move || {
            let registry = registry.clone();
            let storage = storage.clone();
            let cache = cache.clone();
            let run = run.clone();
            async move { abandon_tree(&registry, storage.as_ref(), cache.as_ref(), &run).await }
                .boxed()
        })
    }

    /// 调度循环：出队前重新采样并发上限，队列和工作协程都清空后结束
    async fn run_tree(&self, root: FolderNode, run: &Arc<UploadRun>) -> Result<String> {
        let pool = AdaptiveConcurrency::new(&self.config, self.sampler.clone());
        let abort = run.cancel.child_token();

        let mut queue = VecDeque::from([root]);
        let mut workers: JoinSet<Result<NodeOutcome>> = JoinSet::new();
        let mut root_folder_id: Option<String> = None;
        let mut failure: Option<TransferError> = None;

        loop {
            if failure.is_none() && !abort.is_cancelled() && !queue.is_empty() {
                self.wait_while_paused(&run.task_id, &abort).await;

                let limit = pool.retune();
                while workers.len() < limit && !abort.is_cancelled() {
                    let Some(node) = queue.pop_front() else {
                        break;
                    };
                    let worker = FolderWorker {
                        registry: self.registry.clone(),
                        storage: self.storage.clone(),
                        cache: self.cache.clone(),
                        reporter: self.reporter.clone(),
                        run: run.clone(),
                        cancel: abort.clone(),
                        settle_delay: self.config.settle_delay(),
                        // 只有根节点在入队时没有兄弟节点，第一个出队的就是根
                        is_root: root_folder_id.is_none() && workers.is_empty(),
                    };
                    workers.spawn(worker.process(node));
                }
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };

            match joined {
                Ok(Ok(outcome)) => {
                    root_folder_id.get_or_insert(outcome.folder_id);
                    queue.extend(outcome.children);
                }
                Ok(Err(e)) => {
                    if failure.is_none() && !run.cancel.is_cancelled() {
                        debug!("目录树中止: task_id={}, error={}", run.task_id, e);
                        failure = Some(e);
                        abort.cancel();
                    }
                }
                Err(join_err) => {
                    error!("上传工作协程异常: task_id={}, error={}", run.task_id, join_err);
                    if failure.is_none() {
                        failure = Some(TransferError::Remote(format!(
                            "上传工作协程异常: {}",
                            join_err
                        )));
                    }
                    abort.cancel();
                }
            }
        }

        if run.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if let Some(e) = failure {
            return Err(e);
        }
        root_folder_id.ok_or_else(|| TransferError::Remote("根目录未创建".to_string()))
    }

    /// 任务处于暂停状态时等待恢复（或取消）
    async fn wait_while_paused(&self, task_id: &str, cancel: &CancellationToken) {
        let mut rx = self.registry.subscribe_task(task_id);
        loop {
            match self.registry.find(task_id) {
                Some(task) if task.status == TaskStatus::Paused => {}
                _ => return,
            }
            debug!("上传已暂停，等待恢复: task_id={}", task_id);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                received = rx.recv() => {
                    if let Err(RecvError::Closed) = received {
                        return;
                    }
                }
            }
        }
    }

    async fn finish(&self, run: &UploadRun, result: Result<String>, options: &UploadOptions) {
        let task_id = &run.task_id;

        match result {
            Ok(root_id) => {
                self.wait_while_paused(task_id, &run.cancel).await;
                if run.cancel.is_cancelled() {
                    self.registry
                        .update(task_id, TaskPatch::status(TaskStatus::Cancelled));
                    return;
                }
                info!("文件夹上传完成: task_id={}, root_id={}", task_id, root_id);
                self.registry.update(
                    task_id,
                    TaskPatch {
                        status: Some(TaskStatus::Success),
                        progress: Some(1.0),
                        result_id: Some(root_id.clone()),
                        ..Default::default()
                    },
                );
                if let Some(on_success) = &options.on_success {
                    on_success(&root_id);
                }
            }
            Err(e) if run.cancel.is_cancelled() || e.is_cancelled() => {
                if !run.cancel.is_cancelled() {
                    // 子任务被单独取消，上传任务的停止动作没有执行过
                    info!("子任务已取消，放弃整个目录树: task_id={}", task_id);
                    abandon_tree(
                        &self.registry,
                        self.storage.as_ref(),
                        self.cache.as_ref(),
                        run,
                    )
                    .await;
                }
                info!("文件夹上传已取消: task_id={}", task_id);
                self.registry
                    .update(task_id, TaskPatch::status(TaskStatus::Cancelled));
            }
            Err(e) => {
                warn!("文件夹上传失败: task_id={}, error={}", task_id, e);
                self.reporter.report(task_id, &e);
                self.registry
                    .update(task_id, TaskPatch::failed(e.user_message()));
            }
        }
    }
}

/// 取消所有未结束的子任务
async fn cancel_related(registry: &TaskRegistry, task_id: &str) {
    let filter = TaskFilter {
        related_task_id: Some(task_id.to_string()),
        ..Default::default()
    };
    let pending: Vec<String> = registry
        .list(&filter)
        .into_iter()
        .filter(|t| !t.status.is_terminal())
        .map(|t| t.id)
        .collect();
    if pending.is_empty() {
        return;
    }
    debug!("级联取消子任务: task_id={}, count={}", task_id, pending.len());
    join_all(pending.iter().map(|id| registry.cancel(id))).await;
}

/// 放弃目录树：触发取消令牌，然后并发地级联取消子任务、删除已创建的根目录
async fn abandon_tree(
    registry: &TaskRegistry,
    storage: &dyn RemoteStorageClient,
    cache: &dyn LocalCache,
    run: &UploadRun,
) {
    run.cancel.cancel();
    tokio::join!(
        cancel_related(registry, &run.task_id),
        delete_root(storage, cache, run),
    );
}

/// 删除已创建的根目录（远程和本地）
async fn delete_root(storage: &dyn RemoteStorageClient, cache: &dyn LocalCache, run: &UploadRun) {
    let root_id = run.root_remote_id.lock().take();
    if let Some(root_id) = root_id {
        remove_root_folder(storage, cache, &run.task_id, &root_id).await;
    }
}

async fn remove_root_folder(
    storage: &dyn RemoteStorageClient,
    cache: &dyn LocalCache,
    task_id: &str,
    root_id: &str,
) {
    info!("删除未完成的根目录: task_id={}, root_id={}", task_id, root_id);
    if let Err(e) = storage.delete_folder(root_id).await {
        warn!("删除根目录失败: root_id={}, error={}", root_id, e);
    }
    cache.forget_folder(root_id).await;
}

/// 处理单个目录节点的工作协程
struct FolderWorker {
    registry: TaskRegistry,
    storage: Arc<dyn RemoteStorageClient>,
    cache: Arc<dyn LocalCache>,
    reporter: Arc<dyn ErrorReporter>,
    run: Arc<UploadRun>,
    cancel: CancellationToken,
    settle_delay: Duration,
    is_root: bool,
}

impl FolderWorker {
    async fn process(self, node: FolderNode) -> Result<NodeOutcome> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let FolderNode {
            name,
            remote_parent_id,
            files,
            children,
        } = node;
        let parent_id = remote_parent_id.ok_or_else(|| {
            TransferError::Remote(format!("文件夹缺少远程父目录: {}", name))
        })?;
        let node_cancel = self.cancel.child_token();

        let folder_id = self.create_folder(&parent_id, &name, &node_cancel).await?;
        self.run.advance(&self.registry, 1);

        if !self.settle_delay.is_zero() {
            tokio::select! {
                biased;
                _ = node_cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(self.settle_delay) => {}
            }
        }

        if !files.is_empty() {
            if node_cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let count = files.len() as u64;
            self.upload_files(&name, &folder_id, files, &node_cancel)
                .await?;
            self.run.advance(&self.registry, count);
        }

        let children = children
            .into_iter()
            .map(|mut child| {
                child.remote_parent_id = Some(folder_id.clone());
                child
            })
            .collect();

        Ok(NodeOutcome {
            folder_id,
            children,
        })
    }

    /// 创建远程文件夹（作为子任务记录）
    async fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let payload = TaskPayload {
            name: name.to_string(),
            destination_id: Some(parent_id.to_string()),
            ..Default::default()
        };
        let sub_id = self
            .registry
            .create(NewTask::new(TaskKind::CreateFolder, payload).related_to(&self.run.task_id));
        self.registry
            .update(&sub_id, TaskPatch::status(TaskStatus::InProcess));
        self.registry
            .set_stop_or_cancel(&sub_id, cancel_stop(cancel), cancel);

        let folder = match self.storage.create_folder(parent_id, name, cancel).await {
            Ok(folder) => folder,
            Err(e) => {
                let patch = if e.is_cancelled() {
                    TaskPatch::status(TaskStatus::Cancelled)
                } else {
                    TaskPatch::failed(e.user_message())
                };
                self.registry.update(&sub_id, patch);
                return Err(e);
            }
        };

        debug!(
            "创建文件夹成功: task_id={}, name={}, parent={}, id={}",
            self.run.task_id, name, parent_id, folder.id
        );
        self.registry.update(
            &sub_id,
            TaskPatch {
                status: Some(TaskStatus::Success),
                progress: Some(1.0),
                result_id: Some(folder.id.clone()),
                ..Default::default()
            },
        );

        if self.is_root {
            // 根目录创建返回时任务可能已被取消，此时停止动作看不到根目录，由这里删除
            let cancelled = {
                let mut slot = self.run.root_remote_id.lock();
                if self.run.cancel.is_cancelled() {
                    true
                } else {
                    *slot = Some(folder.id.clone());
                    false
                }
            };
            if cancelled {
                debug!(
                    "根目录创建完成时任务已取消: task_id={}, root_id={}",
                    self.run.task_id, folder.id
                );
                remove_root_folder(
                    self.storage.as_ref(),
                    self.cache.as_ref(),
                    &self.run.task_id,
                    &folder.id,
                )
                .await;
                return Err(TransferError::Cancelled);
            }
        }

        Ok(folder.id)
    }

    /// 批量上传本层文件（单个文件失败只上报，不中止目录树）
    async fn upload_files(
        &self,
        folder_name: &str,
        folder_id: &str,
        files: Vec<UploadFile>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let count = files.len() as u64;
        let payload = TaskPayload {
            name: folder_name.to_string(),
            destination_id: Some(folder_id.to_string()),
            items_total: count,
            bytes_total: files.iter().map(|f| f.size()).sum(),
            ..Default::default()
        };
        let sub_id = self
            .registry
            .create(NewTask::new(TaskKind::UploadFile, payload).related_to(&self.run.task_id));
        self.registry
            .update(&sub_id, TaskPatch::status(TaskStatus::InProcess));
        self.registry
            .set_stop_or_cancel(&sub_id, cancel_stop(cancel), cancel);

        let options = UploadBatchOptions {
            related_task_id: self.run.task_id.clone(),
            cancel: cancel.clone(),
        };
        let results = self
            .storage
            .upload_file_batch(files, folder_id, options)
            .await;

        if cancel.is_cancelled() {
            self.registry
                .update(&sub_id, TaskPatch::status(TaskStatus::Cancelled));
            return Err(TransferError::Cancelled);
        }

        let mut failed = 0u64;
        for file in &results {
            if let Err(e) = &file.result {
                if e.is_cancelled() {
                    continue;
                }
                failed += 1;
                warn!(
                    "文件上传失败: task_id={}, folder={}, file={}, error={}",
                    self.run.task_id, folder_name, file.name, e
                );
                self.reporter.report(&self.run.task_id, e);
            }
        }

        let patch = if failed == 0 {
            TaskPatch {
                status: Some(TaskStatus::Success),
                progress: Some(1.0),
                items_done: Some(count),
                ..Default::default()
            }
        } else {
            TaskPatch {
                items_done: Some(count - failed),
                ..TaskPatch::failed(format!("{} 个文件上传失败", failed))
            }
        };
        self.registry.update(&sub_id, patch);
        Ok(())
    }
}

/// 子任务的停止动作：取消该节点的令牌
fn cancel_stop(cancel: &CancellationToken) -> StopAction {
    let cancel = cancel.clone();
    Arc::new(move || {
        let cancel = cancel.clone();
        async move { cancel.cancel() }.boxed()
    })
}
