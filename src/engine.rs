//! 传输引擎
//!
//! 组装任务注册表、上传器和下载器，记录每个任务的输入以支持重试。

use std::sync::Arc;

use dashmap::DashMap;
use futures::{stream, StreamExt};
use tracing::{info, warn};

use crate::common::{MemoryPressureSampler, SystemMemorySampler};
use crate::config::EngineConfig;
use crate::downloader::{ArchiveOptions, DownloadSource, StreamingArchiveDownloader};
use crate::error::{Result, TransferError};
use crate::remote::{ErrorReporter, LocalCache, RemoteStorageClient, TracingErrorReporter};
use crate::task::{TaskRegistry, TaskStatus};
use crate::uploader::{ConcurrentFolderUploader, FolderNode, UploadOptions};

/// 重试所需的原始输入
#[derive(Clone)]
enum RetryInput {
    Upload {
        root: FolderNode,
        destination_parent_id: String,
        options: UploadOptions,
    },
    Download {
        source: DownloadSource,
        options: ArchiveOptions,
    },
}

/// 传输引擎
#[derive(Clone)]
pub struct TransferEngine {
    config: EngineConfig,
    registry: TaskRegistry,
    uploader: ConcurrentFolderUploader,
    downloader: StreamingArchiveDownloader,
    retry_inputs: Arc<DashMap<String, RetryInput>>,
}

impl TransferEngine {
    pub fn new(
        config: EngineConfig,
        storage: Arc<dyn RemoteStorageClient>,
        cache: Arc<dyn LocalCache>,
        reporter: Arc<dyn ErrorReporter>,
        sampler: Option<Arc<dyn MemoryPressureSampler>>,
    ) -> Self {
        let registry = TaskRegistry::new();

        let mut uploader = ConcurrentFolderUploader::new(
            registry.clone(),
            storage.clone(),
            cache.clone(),
            reporter.clone(),
            config.upload.clone(),
        );
        if let Some(sampler) = sampler {
            uploader = uploader.with_sampler(sampler);
        }
        let downloader = StreamingArchiveDownloader::new(
            registry.clone(),
            storage,
            cache,
            reporter,
            config.download.clone(),
        );

        info!(
            "传输引擎初始化: upload_concurrency={}, adaptive={}",
            config.upload.effective_concurrency(),
            config.upload.adaptive_concurrency
        );

        Self {
            config,
            registry,
            uploader,
            downloader,
            retry_inputs: Arc::new(DashMap::new()),
        }
    }

    /// 使用系统内存采样器和日志错误上报
    pub fn with_defaults(
        config: EngineConfig,
        storage: Arc<dyn RemoteStorageClient>,
        cache: Arc<dyn LocalCache>,
    ) -> Self {
        let sampler: Arc<dyn MemoryPressureSampler> = Arc::new(SystemMemorySampler::new());
        Self::new(
            config,
            storage,
            cache,
            Arc::new(TracingErrorReporter),
            Some(sampler),
        )
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 上传单个目录树
    pub async fn upload_folder(
        &self,
        root: FolderNode,
        destination_parent_id: &str,
        options: UploadOptions,
    ) -> Result<String> {
        let input = RetryInput::Upload {
            root: root.clone(),
            destination_parent_id: destination_parent_id.to_string(),
            options: UploadOptions {
                existing_task_id: None,
                ..options.clone()
            },
        };
        let task_id = self
            .uploader
            .upload(root, destination_parent_id, options)
            .await?;
        self.remember(&task_id, input);
        Ok(task_id)
    }

    /// 批量上传多个目录树
    ///
    /// 各目录树并发执行（同时进行的目录树数量不超过上传并发上限），
    /// 某个目录树失败不影响其他目录树。结果按输入顺序返回。
    pub async fn upload_folders(
        &self,
        roots: Vec<FolderNode>,
        destination_parent_id: &str,
        options: UploadOptions,
    ) -> Vec<Result<String>> {
        let limit = self.config.upload.effective_concurrency();
        info!(
            "批量上传文件夹: count={}, parent={}",
            roots.len(),
            destination_parent_id
        );

        stream::iter(roots)
            .map(|root| {
                let options = UploadOptions {
                    existing_task_id: None,
                    ..options.clone()
                };
                self.upload_folder(root, destination_parent_id, options)
            })
            .buffered(limit)
            .collect()
            .await
    }

    /// 打包下载
    pub async fn download_as_archive(
        &self,
        source: DownloadSource,
        options: ArchiveOptions,
    ) -> Result<String> {
        let (task_id, result) = self.downloader.run(&source, &options).await?;
        self.remember(
            &task_id,
            RetryInput::Download {
                source,
                options: ArchiveOptions {
                    existing_task_id: None,
                    ..options
                },
            },
        );
        result.map(|()| task_id)
    }

    /// 使用原始输入重试失败或已取消的任务（复用同一任务ID）
    pub async fn retry(&self, task_id: &str) -> Result<String> {
        let input = self
            .retry_inputs
            .get(task_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransferError::TaskNotFound(task_id.to_string()))?;

        info!("重试任务: task_id={}", task_id);

        match input {
            RetryInput::Upload {
                root,
                destination_parent_id,
                options,
            } => {
                let options = UploadOptions {
                    existing_task_id: Some(task_id.to_string()),
                    ..options
                };
                self.upload_folder(root, &destination_parent_id, options)
                    .await
            }
            RetryInput::Download { source, options } => {
                let options = ArchiveOptions {
                    existing_task_id: Some(task_id.to_string()),
                    ..options
                };
                self.download_as_archive(source, options).await
            }
        }
    }

    /// 取消任务
    pub async fn cancel(&self, task_id: &str) -> bool {
        self.registry.cancel(task_id).await
    }

    /// 清除已结束的任务及其重试输入
    pub fn clear_finished(&self) {
        self.registry.clear_finished();
        self.retry_inputs
            .retain(|task_id, _| self.registry.find(task_id).is_some());
    }

    /// 只为失败或取消的任务保留输入
    fn remember(&self, task_id: &str, input: RetryInput) {
        match self.registry.find(task_id).map(|t| t.status) {
            Some(TaskStatus::Error) | Some(TaskStatus::Cancelled) => {
                self.retry_inputs.insert(task_id.to_string(), input);
            }
            Some(_) => {
                self.retry_inputs.remove(task_id);
            }
            None => warn!("任务已被清除，不记录重试输入: task_id={}", task_id),
        }
    }

    /// 是否可以重试
    pub fn can_retry(&self, task_id: &str) -> bool {
        self.retry_inputs.contains_key(task_id)
    }
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("retry_inputs", &self.retry_inputs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveWriter;
    use crate::config::UploadConfig;
    use crate::downloader::{ArchiveTarget, TransferItem};
    use crate::remote::{InMemoryCache, UploadFile};
    use crate::task::{TaskFilter, TaskKind};
    use crate::testing::{MockArchive, MockReporter, MockStorage};
    use chrono::Utc;

    fn engine(storage: Arc<MockStorage>) -> (TransferEngine, Arc<MockReporter>) {
        let config = EngineConfig {
            upload: UploadConfig {
                settle_delay_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let reporter = Arc::new(MockReporter::default());
        let engine = TransferEngine::new(
            config,
            storage,
            Arc::new(InMemoryCache::new()),
            reporter.clone(),
            None,
        );
        (engine, reporter)
    }

    fn tree(name: &str) -> FolderNode {
        FolderNode::new(name).with_files(vec![UploadFile::new("a.txt", "a")])
    }

    #[tokio::test]
    async fn test_batch_upload_isolates_failures() {
        let storage = Arc::new(MockStorage::new());
        storage.fail_create_of("Bad");
        let (engine, reporter) = engine(storage.clone());

        let results = engine
            .upload_folders(
                vec![tree("One"), tree("Bad"), tree("Two")],
                "dest",
                UploadOptions::default(),
            )
            .await;

        assert_eq!(results.len(), 3);
        let statuses: Vec<TaskStatus> = results
            .iter()
            .map(|r| {
                let id = r.as_ref().unwrap();
                engine.registry().find(id).unwrap().status
            })
            .collect();
        assert_eq!(
            statuses,
            vec![TaskStatus::Success, TaskStatus::Error, TaskStatus::Success]
        );
        assert_eq!(reporter.reports().len(), 1);
        assert_eq!(storage.batches().len(), 2);

        let bad_id = results[1].as_ref().unwrap();
        assert!(engine.can_retry(bad_id));
        assert!(!engine.can_retry(results[0].as_ref().unwrap()));
    }

    #[tokio::test]
    async fn test_retry_failed_upload_reuses_task() {
        let storage = Arc::new(MockStorage::new());
        storage.fail_create_of("Docs");
        let (engine, _) = engine(storage.clone());

        let task_id = engine
            .upload_folder(tree("Docs"), "dest", UploadOptions::default())
            .await
            .unwrap();
        assert_eq!(
            engine.registry().find(&task_id).unwrap().status,
            TaskStatus::Error
        );

        storage.clear_failures();
        let retried = engine.retry(&task_id).await.unwrap();
        assert_eq!(retried, task_id);

        let task = engine.registry().find(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.progress, 1.0);
        assert!(!engine.can_retry(&task_id));

        let uploads = engine
            .registry()
            .list(&TaskFilter::default())
            .into_iter()
            .filter(|t| t.kind == TaskKind::UploadFolder)
            .count();
        assert_eq!(uploads, 1);
    }

    #[tokio::test]
    async fn test_retry_failed_download() {
        let storage = Arc::new(MockStorage::new());
        storage.add_remote_file("dir", "f1", "a.txt", b"abc", Utc::now());
        storage.fail_fetch_of("f1");
        let (engine, _) = engine(storage.clone());

        let archive = Arc::new(MockArchive::default());
        let writer: Arc<dyn ArchiveWriter> = archive.clone();
        let err = engine
            .download_as_archive(
                DownloadSource::Folder(TransferItem::folder("dir", "Dir")),
                ArchiveOptions::new(ArchiveTarget::Writer(writer)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Download { .. }));

        let task_id = engine
            .registry()
            .list(&TaskFilter {
                status: Some(TaskStatus::Error),
                ..Default::default()
            })
            .pop()
            .unwrap()
            .id;

        storage.clear_failures();
        assert_eq!(engine.retry(&task_id).await.unwrap(), task_id);
        assert_eq!(
            engine.registry().find(&task_id).unwrap().status,
            TaskStatus::Success
        );
        assert_eq!(archive.paths(), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_retry_unknown_task() {
        let (engine, _) = engine(Arc::new(MockStorage::new()));
        assert!(matches!(
            engine.retry("missing").await,
            Err(TransferError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_clear_finished_drops_retry_inputs() {
        let storage = Arc::new(MockStorage::new());
        storage.fail_create_of("Docs");
        let (engine, _) = engine(storage);

        let task_id = engine
            .upload_folder(tree("Docs"), "dest", UploadOptions::default())
            .await
            .unwrap();
        assert!(engine.can_retry(&task_id));

        engine.clear_finished();
        assert!(engine.registry().is_empty());
        assert!(!engine.can_retry(&task_id));
    }
}
