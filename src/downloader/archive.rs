//! 流式打包下载
//!
//! 广度优先列举远程目录，逐个文件拉取解密流并写入同一个归档：
//! - 文件内容不在内存中整体缓存（写回本地缓存的小文件除外）
//! - 本地缓存不比远程旧时直接使用缓存
//! - 列举完成前不发布进度比例
//! - 任一文件失败则放弃整个归档

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{stream, FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::item::{DownloadSource, TransferItem};
use super::progress::{ArchiveProgress, ProgressSnapshot};
use crate::archive::{ArchiveWriter, ZipArchiveWriter};
use crate::common::{format_bytes, ProgressThrottler, SpeedCalculator};
use crate::config::DownloadConfig;
use crate::error::{FileTracking, Result, TransferError};
use crate::remote::{ByteStream, ErrorReporter, LocalCache, RemoteStorageClient};
use crate::task::{NewTask, StopAction, TaskKind, TaskPatch, TaskPayload, TaskRegistry, TaskStatus};

/// 进度回调（总大小确定后每次进度变化都会调用）
pub type OnArchiveProgress = Arc<dyn Fn(ProgressSnapshot) + Send + Sync>;

/// 归档输出
#[derive(Clone)]
pub enum ArchiveTarget {
    /// 写入本地 zip 文件
    Path(PathBuf),
    /// 写入调用方提供的归档（可跨多次下载追加）
    Writer(Arc<dyn ArchiveWriter>),
}

/// 打包下载选项
#[derive(Clone)]
pub struct ArchiveOptions {
    pub target: ArchiveTarget,
    /// 完成后不关闭归档，供后续继续追加
    pub keep_open: bool,
    pub on_progress: Option<OnArchiveProgress>,
    /// 重试时复用的任务ID
    pub existing_task_id: Option<String>,
    pub show_notification: bool,
}

impl ArchiveOptions {
    pub fn new(target: ArchiveTarget) -> Self {
        Self {
            target,
            keep_open: false,
            on_progress: None,
            existing_task_id: None,
            show_notification: false,
        }
    }
}

/// 待列举的文件夹
struct PendingFolder {
    id: String,
    /// 归档内路径前缀（空或以 `/` 结尾）
    prefix: String,
}

/// 待写入的文件
struct PendingFile {
    item: TransferItem,
    path: String,
    index: usize,
}

/// 单次打包下载的共享状态
struct ArchiveRun {
    task_id: String,
    registry: TaskRegistry,
    progress: Mutex<ArchiveProgress>,
    speed: Mutex<SpeedCalculator>,
    throttler: ProgressThrottler,
    on_progress: Option<OnArchiveProgress>,
    cancel: CancellationToken,
    /// 最后处理的文件（失败上报用）
    tracking: Mutex<FileTracking>,
}

impl ArchiveRun {
    fn register_file(&self, size: Option<u64>) -> usize {
        self.progress.lock().register_file(size)
    }

    fn on_bytes(&self, index: usize, bytes: u64) {
        let snapshot = {
            let mut progress = self.progress.lock();
            progress.add_bytes(index, bytes);
            progress.snapshot()
        };
        self.speed.lock().record(bytes);
        self.publish(snapshot, false);
    }

    fn complete_file(&self, index: usize) {
        let snapshot = {
            let mut progress = self.progress.lock();
            progress.complete_file(index);
            progress.snapshot()
        };
        self.publish(snapshot, false);
    }

    fn finalize_size(&self) {
        let snapshot = {
            let mut progress = self.progress.lock();
            if progress.size_is_final() {
                return;
            }
            progress.finalize_size();
            debug!(
                "打包下载总大小确定: task_id={}, total={}",
                self.task_id,
                format_bytes(progress.total_size())
            );
            progress.snapshot()
        };
        self.publish(snapshot, true);
    }

    /// 回调每次都调用；写入注册表按间隔节流
    fn publish(&self, snapshot: Option<ProgressSnapshot>, force: bool) {
        let Some(snapshot) = snapshot else {
            return;
        };
        if let Some(on_progress) = &self.on_progress {
            on_progress(snapshot);
        }
        if !self.throttler.should_emit(force) {
            return;
        }
        let speed = self.speed.lock().speed();
        self.registry.update(
            &self.task_id,
            TaskPatch {
                progress: Some(snapshot.fraction),
                bytes_done: Some(snapshot.downloaded),
                bytes_total: Some(snapshot.total),
                speed: Some(speed),
                ..Default::default()
            },
        );
    }

    fn track(&self, item: &TransferItem) {
        *self.tracking.lock() =
            FileTracking::new(item.content_id(), &item.name, item.size.unwrap_or(0));
    }
}

/// 流式打包下载器
#[derive(Clone)]
pub struct StreamingArchiveDownloader {
    registry: TaskRegistry,
    storage: Arc<dyn RemoteStorageClient>,
    cache: Arc<dyn LocalCache>,
    reporter: Arc<dyn ErrorReporter>,
    config: DownloadConfig,
}

impl StreamingArchiveDownloader {
    pub fn new(
        registry: TaskRegistry,
        storage: Arc<dyn RemoteStorageClient>,
        cache: Arc<dyn LocalCache>,
        reporter: Arc<dyn ErrorReporter>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            registry,
            storage,
            cache,
            reporter,
            config,
        }
    }

    /// 下载为归档，返回任务ID
    ///
    /// 取消时返回 `Ok`（任务状态为 Cancelled）；失败时归档被放弃，
    /// 返回携带最后处理文件信息的 `TransferError::Download`。
    pub async fn download_as_archive(
        &self,
        source: DownloadSource,
        options: ArchiveOptions,
    ) -> Result<String> {
        let (task_id, result) = self.run(&source, &options).await?;
        result.map(|()| task_id)
    }

    /// 执行打包下载，失败时仍返回任务ID（供重试记录输入）
    ///
    /// 外层 `Err` 表示任务无法创建或复用。
    pub(crate) async fn run(
        &self,
        source: &DownloadSource,
        options: &ArchiveOptions,
    ) -> Result<(String, Result<()>)> {
        let task_id = self.prepare_task(source, options)?;

        let writer: Arc<dyn ArchiveWriter> = match &options.target {
            ArchiveTarget::Writer(writer) => writer.clone(),
            ArchiveTarget::Path(path) => match ZipArchiveWriter::create(path) {
                Ok(writer) => Arc::new(writer),
                Err(e) => {
                    self.fail(&task_id, &e);
                    return Ok((task_id, Err(e)));
                }
            },
        };

        let run = Arc::new(ArchiveRun {
            task_id: task_id.clone(),
            registry: self.registry.clone(),
            progress: Mutex::new(ArchiveProgress::new()),
            speed: Mutex::new(SpeedCalculator::new(self.config.speed_window_secs)),
            throttler: ProgressThrottler::with_millis(self.config.progress_interval_ms),
            on_progress: options.on_progress.clone(),
            cancel: CancellationToken::new(),
            tracking: Mutex::new(FileTracking::default()),
        });
        self.registry
            .set_stop_or_cancel(&task_id, abort_stop(&run.cancel, &writer), &run.cancel);

        info!(
            "开始打包下载: task_id={}, name={}",
            task_id,
            source.display_name()
        );

        let mut result = self.write_archive(source, writer.as_ref(), &run).await;
        if result.is_ok() && !options.keep_open {
            result = writer.close().await;
        }

        match result {
            Ok(()) if !run.cancel.is_cancelled() => {
                let (downloaded, total) = {
                    let progress = run.progress.lock();
                    (progress.downloaded(), progress.total_size())
                };
                info!(
                    "打包下载完成: task_id={}, size={}",
                    task_id,
                    format_bytes(total)
                );
                self.registry.update(
                    &task_id,
                    TaskPatch {
                        status: Some(TaskStatus::Success),
                        progress: Some(1.0),
                        bytes_done: Some(downloaded),
                        bytes_total: Some(total),
                        speed: Some(0),
                        ..Default::default()
                    },
                );
                Ok((task_id, Ok(())))
            }
            Err(e) if !run.cancel.is_cancelled() && !e.is_cancelled() => {
                writer.abort().await;
                let tracking = run.tracking.lock().clone();
                let err = e.with_tracking(tracking);
                self.fail(&task_id, &err);
                Ok((task_id, Err(err)))
            }
            _ => {
                writer.abort().await;
                info!("打包下载已取消: task_id={}", task_id);
                self.registry
                    .update(&task_id, TaskPatch::status(TaskStatus::Cancelled));
                Ok((task_id, Ok(())))
            }
        }
    }

    fn prepare_task(&self, source: &DownloadSource, options: &ArchiveOptions) -> Result<String> {
        if let Some(existing) = &options.existing_task_id {
            self.registry.restart(existing)?;
            return Ok(existing.clone());
        }

        let kind = if source.is_single_file() {
            TaskKind::DownloadFile
        } else {
            TaskKind::DownloadFolder
        };
        let payload = TaskPayload {
            name: source.display_name(),
            source_ids: source.source_ids(),
            show_notification: options.show_notification,
            ..Default::default()
        };
        let task_id = self.registry.create(NewTask::new(kind, payload));
        self.registry
            .update(&task_id, TaskPatch::status(TaskStatus::InProcess));
        Ok(task_id)
    }

    fn fail(&self, task_id: &str, err: &TransferError) {
        warn!("打包下载失败: task_id={}, error={}", task_id, err);
        self.reporter.report(task_id, err);
        self.registry
            .update(task_id, TaskPatch::failed(err.user_message()));
    }

    /// 广度优先列举并写入所有文件
    async fn write_archive(
        &self,
        source: &DownloadSource,
        writer: &dyn ArchiveWriter,
        run: &Arc<ArchiveRun>,
    ) -> Result<()> {
        let mut pending: VecDeque<PendingFolder> = VecDeque::new();
        let mut top_files = Vec::new();

        match source {
            DownloadSource::Folder(folder) => pending.push_back(PendingFolder {
                id: folder.id.clone(),
                prefix: String::new(),
            }),
            DownloadSource::Items(items) => {
                let mut taken = HashSet::new();
                for item in items {
                    let name = unique_entry_name(&item.name, item.is_folder, &mut taken);
                    if item.is_folder {
                        pending.push_back(PendingFolder {
                            id: item.id.clone(),
                            prefix: format!("{}/", name),
                        });
                    } else {
                        let index = run.register_file(item.size);
                        top_files.push(PendingFile {
                            item: item.clone(),
                            path: name,
                            index,
                        });
                    }
                }
            }
        }

        if pending.is_empty() {
            run.finalize_size();
        }
        for file in top_files {
            self.write_file(writer, run, file).await?;
        }

        while let Some(folder) = pending.pop_front() {
            check_cancelled(&run.cancel)?;

            let files = self.list_files(&folder, run).await?;
            self.list_subfolders(&folder, &mut pending).await?;
            if pending.is_empty() {
                run.finalize_size();
            }

            for file in files {
                self.write_file(writer, run, file).await?;
            }
        }

        run.finalize_size();
        Ok(())
    }

    /// 列举文件夹下所有文件（翻页直到没有更多）
    async fn list_files(
        &self,
        folder: &PendingFolder,
        run: &ArchiveRun,
    ) -> Result<Vec<PendingFile>> {
        let mut files = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            check_cancelled(&run.cancel)?;
            let page = self
                .storage
                .list_child_files(&folder.id, cursor.as_deref())
                .await?;
            for remote in page.items {
                let index = run.register_file(Some(remote.size));
                let path = format!("{}{}", folder.prefix, remote.name);
                files.push(PendingFile {
                    item: TransferItem::from(remote),
                    path,
                    index,
                });
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(files)
    }

    async fn list_subfolders(
        &self,
        folder: &PendingFolder,
        pending: &mut VecDeque<PendingFolder>,
    ) -> Result<()> {
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .storage
                .list_child_folders(&folder.id, cursor.as_deref())
                .await?;
            pending.extend(page.items.into_iter().map(|child| PendingFolder {
                prefix: format!("{}{}/", folder.prefix, child.name),
                id: child.id,
            }));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(())
    }

    /// 写入单个文件：缓存新鲜时直接使用缓存，否则拉取解密流
    async fn write_file(
        &self,
        writer: &dyn ArchiveWriter,
        run: &Arc<ArchiveRun>,
        file: PendingFile,
    ) -> Result<()> {
        check_cancelled(&run.cancel)?;
        run.track(&file.item);

        let content_id = file.item.content_id().to_string();
        let size = file.item.size.unwrap_or(0);

        if let Some(bytes) = self.fresh_cached(&file.item).await {
            debug!("缓存命中: file_id={}, path={}", content_id, file.path);
            run.complete_file(file.index);
            let cached: ByteStream = stream::once(async move { Ok(bytes) }).boxed();
            return writer.add_file(&file.path, cached).await;
        }

        debug!("拉取文件: file_id={}, path={}, size={}", content_id, file.path, size);
        let remote = self
            .storage
            .fetch_file_stream(&content_id, &file.item.bucket_id, &run.cancel)
            .await?;

        let limit = self.config.cache_write_limit;
        let collector = Arc::new(Mutex::new(
            (size <= limit).then(|| BytesMut::with_capacity(size as usize)),
        ));
        let counted: ByteStream = {
            let run = run.clone();
            let collector = collector.clone();
            let index = file.index;
            remote
                .take_until(run.cancel.clone().cancelled_owned())
                .inspect(move |chunk| {
                    if let Ok(chunk) = chunk {
                        run.on_bytes(index, chunk.len() as u64);
                        let mut collected = collector.lock();
                        let overflow = collected
                            .as_ref()
                            .map_or(false, |buf| (buf.len() + chunk.len()) as u64 > limit);
                        if overflow {
                            *collected = None;
                        } else if let Some(buf) = collected.as_mut() {
                            buf.extend_from_slice(chunk);
                        }
                    }
                })
                .boxed()
        };

        writer.add_file(&file.path, counted).await?;
        check_cancelled(&run.cancel)?;
        if file.item.size.is_none() {
            // 大小未知的文件以实际读到的字节数定下大小
            run.complete_file(file.index);
        }

        let collected = collector.lock().take();
        if let (Some(buf), Some(updated_at)) = (collected, file.item.updated_at) {
            if file.item.size.map_or(true, |size| size == buf.len() as u64) {
                self.cache.put(&content_id, buf.freeze(), updated_at).await;
            }
        }
        Ok(())
    }

    /// 缓存存在、不比远程旧且长度一致时返回缓存内容
    async fn fresh_cached(&self, item: &TransferItem) -> Option<Bytes> {
        let remote_updated: DateTime<Utc> = item.updated_at?;
        let cached = self.cache.get(item.content_id()).await?;

        if cached.updated_at < remote_updated {
            debug!(
                "缓存已过期: file_id={}, cached={}, remote={}",
                item.content_id(),
                cached.updated_at,
                remote_updated
            );
            return None;
        }
        if Some(cached.bytes.len() as u64) != item.size {
            debug!("缓存长度不一致，视为未命中: file_id={}", item.content_id());
            return None;
        }
        Some(cached.bytes)
    }
}

/// 顶层条目重名时追加序号：`a.txt`、`a (1).txt`、`a (2).txt`
fn unique_entry_name(name: &str, is_folder: bool, taken: &mut HashSet<String>) -> String {
    if taken.insert(name.to_string()) {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if !is_folder && pos > 0 => name.split_at(pos),
        _ => (name, ""),
    };
    let mut n = 1;
    loop {
        let candidate = format!("{} ({}){}", stem, n, ext);
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(TransferError::Cancelled)
    } else {
        Ok(())
    }
}

/// 停止动作：触发取消令牌并放弃归档
fn abort_stop(cancel: &CancellationToken, writer: &Arc<dyn ArchiveWriter>) -> StopAction {
    let cancel = cancel.clone();
    let writer = writer.clone();
    Arc::new(move || {
        let cancel = cancel.clone();
        let writer = writer.clone();
        async move {
            cancel.cancel();
            writer.abort().await;
        }
        .boxed()
    })
}
