//! 测试用的内存协作方实现

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::archive::ArchiveWriter;
use crate::common::MemoryPressureSampler;
use crate::error::{Result, TransferError};
use crate::remote::{
    ByteStream, CachedBlob, ErrorReporter, FileUploadResult, InMemoryCache, LocalCache, Page,
    RemoteFile, RemoteFolder, RemoteStorageClient, UploadBatchOptions, UploadFile,
};

/// 可调的内存压力
pub struct FixedMemorySampler {
    value: Mutex<f64>,
}

impl FixedMemorySampler {
    pub fn new(value: f64) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    pub fn set(&self, value: f64) {
        *self.value.lock() = value;
    }
}

impl MemoryPressureSampler for FixedMemorySampler {
    fn sample(&self) -> f64 {
        *self.value.lock()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateCall {
    pub parent_id: String,
    pub name: String,
    pub folder_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchCall {
    pub parent_id: String,
    pub names: Vec<String>,
    pub related_task_id: String,
}

#[derive(Default)]
struct RemoteTree {
    folders: HashMap<String, Vec<RemoteFolder>>,
    files: HashMap<String, Vec<RemoteFile>>,
    contents: HashMap<String, Bytes>,
}

/// 记录调用的内存网盘
#[derive(Default)]
pub struct MockStorage {
    next_id: AtomicUsize,
    created: Mutex<Vec<CreateCall>>,
    deleted: Mutex<Vec<String>>,
    batches: Mutex<Vec<BatchCall>>,
    fetched: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    create_delay: Mutex<Duration>,
    /// 创建文件夹不响应取消（服务端已受理）
    create_ignores_cancel: AtomicBool,
    fail_create: Mutex<HashSet<String>>,
    fail_upload: Mutex<HashSet<String>>,
    fail_fetch: Mutex<HashSet<String>>,
    page_size: Mutex<Option<usize>>,
    tree: Mutex<RemoteTree>,
}

struct InFlight<'a>(&'a MockStorage);

impl<'a> InFlight<'a> {
    fn enter(storage: &'a MockStorage) -> Self {
        let now = storage.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        storage.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(storage)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_create_delay(self, delay: Duration) -> Self {
        *self.create_delay.lock() = delay;
        self
    }

    pub fn with_uncancellable_create(self) -> Self {
        self.create_ignores_cancel.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_page_size(self, size: usize) -> Self {
        *self.page_size.lock() = Some(size);
        self
    }

    /// 创建同名文件夹时返回 AlreadyExists
    pub fn fail_create_of(&self, name: &str) {
        self.fail_create.lock().insert(name.to_string());
    }

    pub fn fail_upload_of(&self, name: &str) {
        self.fail_upload.lock().insert(name.to_string());
    }

    pub fn fail_fetch_of(&self, file_id: &str) {
        self.fail_fetch.lock().insert(file_id.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_create.lock().clear();
        self.fail_upload.lock().clear();
        self.fail_fetch.lock().clear();
    }

    pub fn add_remote_folder(&self, parent_id: &str, id: &str, name: &str) {
        self.tree
            .lock()
            .folders
            .entry(parent_id.to_string())
            .or_default()
            .push(RemoteFolder {
                id: id.to_string(),
                name: name.to_string(),
                parent_id: Some(parent_id.to_string()),
                updated_at: Utc::now(),
            });
    }

    pub fn add_remote_file(
        &self,
        folder_id: &str,
        id: &str,
        name: &str,
        content: &'static [u8],
        updated_at: DateTime<Utc>,
    ) -> RemoteFile {
        let file = RemoteFile {
            id: id.to_string(),
            name: name.to_string(),
            size: content.len() as u64,
            bucket_id: "bucket".to_string(),
            updated_at,
        };
        let mut tree = self.tree.lock();
        tree.files
            .entry(folder_id.to_string())
            .or_default()
            .push(file.clone());
        tree.contents
            .insert(id.to_string(), Bytes::from_static(content));
        file
    }

    pub fn created(&self) -> Vec<CreateCall> {
        self.created.lock().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    pub fn batches(&self) -> Vec<BatchCall> {
        self.batches.lock().clone()
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn paginate<T: Clone>(&self, items: Vec<T>, cursor: Option<&str>) -> Page<T> {
        let Some(size) = *self.page_size.lock() else {
            return Page::last(items);
        };
        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let end = (offset + size).min(items.len());
        let page = items[offset.min(end)..end].to_vec();
        Page {
            items: page,
            next_cursor: (end < items.len()).then(|| end.to_string()),
        }
    }
}

#[async_trait]
impl RemoteStorageClient for MockStorage {
    async fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteFolder> {
        let _guard = InFlight::enter(self);
        let delay = *self.create_delay.lock();
        if self.create_ignores_cancel.load(Ordering::SeqCst) {
            tokio::time::sleep(delay).await;
        } else if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if self.fail_create.lock().contains(name) {
            return Err(TransferError::AlreadyExists(name.to_string()));
        }

        let folder_id = format!("folder-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.created.lock().push(CreateCall {
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            folder_id: folder_id.clone(),
        });
        Ok(RemoteFolder {
            id: folder_id,
            name: name.to_string(),
            parent_id: Some(parent_id.to_string()),
            updated_at: Utc::now(),
        })
    }

    async fn delete_folder(&self, folder_id: &str) -> Result<()> {
        self.deleted.lock().push(folder_id.to_string());
        Ok(())
    }

    async fn list_child_folders(
        &self,
        folder_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<RemoteFolder>> {
        let items = self
            .tree
            .lock()
            .folders
            .get(folder_id)
            .cloned()
            .unwrap_or_default();
        Ok(self.paginate(items, cursor))
    }

    async fn list_child_files(
        &self,
        folder_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<RemoteFile>> {
        let items = self
            .tree
            .lock()
            .files
            .get(folder_id)
            .cloned()
            .unwrap_or_default();
        Ok(self.paginate(items, cursor))
    }

    async fn fetch_file_stream(
        &self,
        file_id: &str,
        _bucket_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        self.fetched.lock().push(file_id.to_string());
        if self.fail_fetch.lock().contains(file_id) {
            return Err(TransferError::Network(format!("fetch {} failed", file_id)));
        }
        let content = self
            .tree
            .lock()
            .contents
            .get(file_id)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(file_id.to_string()))?;

        // 拆成两块，模拟分块解密
        let mid = content.len() / 2;
        let chunks: Vec<Result<Bytes>> = vec![Ok(content.slice(..mid)), Ok(content.slice(mid..))];
        Ok(stream::iter(chunks).boxed())
    }

    async fn upload_file_batch(
        &self,
        files: Vec<UploadFile>,
        parent_id: &str,
        options: UploadBatchOptions,
    ) -> Vec<FileUploadResult> {
        let _guard = InFlight::enter(self);
        self.batches.lock().push(BatchCall {
            parent_id: parent_id.to_string(),
            names: files.iter().map(|f| f.name.clone()).collect(),
            related_task_id: options.related_task_id.clone(),
        });

        let failing = self.fail_upload.lock().clone();
        files
            .into_iter()
            .map(|file| {
                let result = if failing.contains(&file.name) {
                    Err(TransferError::Remote(format!("upload {} rejected", file.name)))
                } else {
                    Ok(RemoteFile {
                        id: format!("{}/{}", parent_id, file.name),
                        name: file.name.clone(),
                        size: file.size(),
                        bucket_id: "bucket".to_string(),
                        updated_at: Utc::now(),
                    })
                };
                FileUploadResult {
                    name: file.name,
                    result,
                }
            })
            .collect()
    }
}

/// 记录条目的归档写入器
#[derive(Default)]
pub struct MockArchive {
    entries: Mutex<Vec<(String, Bytes)>>,
    write_delay: Mutex<Duration>,
    closed: AtomicBool,
    aborted: AtomicBool,
}

impl MockArchive {
    pub fn with_write_delay(self, delay: Duration) -> Self {
        *self.write_delay.lock() = delay;
        self
    }

    pub fn entries(&self) -> Vec<(String, Bytes)> {
        self.entries.lock().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArchiveWriter for MockArchive {
    async fn add_file(&self, path: &str, mut stream: ByteStream) -> Result<()> {
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        self.entries.lock().push((path.to_string(), buf.freeze()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// 记录上报的错误
#[derive(Default)]
pub struct MockReporter {
    reports: Mutex<Vec<(String, String)>>,
}

impl MockReporter {
    pub fn reports(&self) -> Vec<(String, String)> {
        self.reports.lock().clone()
    }
}

impl ErrorReporter for MockReporter {
    fn report(&self, task_id: &str, error: &TransferError) {
        self.reports
            .lock()
            .push((task_id.to_string(), error.to_string()));
    }
}

/// 记录文件夹清理的缓存
#[derive(Default)]
pub struct MockCache {
    inner: InMemoryCache,
    forgotten: Mutex<Vec<String>>,
}

impl MockCache {
    pub fn forgotten(&self) -> Vec<String> {
        self.forgotten.lock().clone()
    }
}

#[async_trait]
impl LocalCache for MockCache {
    async fn get(&self, file_id: &str) -> Option<CachedBlob> {
        self.inner.get(file_id).await
    }

    async fn put(&self, file_id: &str, bytes: Bytes, updated_at: DateTime<Utc>) {
        self.inner.put(file_id, bytes, updated_at).await
    }

    async fn forget_folder(&self, folder_id: &str) {
        self.forgotten.lock().push(folder_id.to_string());
    }
}
