//! 远程存储协作方接口
//!
//! 引擎只通过这里的 trait 访问网盘、本地缓存和错误上报，
//! 具体实现（加密、网络协议、缓存持久化）由宿主应用注入。

mod cache;
mod reporter;
mod types;

pub use cache::{CachedBlob, InMemoryCache, LocalCache};
pub use reporter::{ErrorReporter, TracingErrorReporter};
pub use types::{
    ByteStream, FileUploadResult, Page, RemoteFile, RemoteFolder, UploadBatchOptions, UploadFile,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// 远程存储客户端
///
/// 所有方法都可能被多个工作协程并发调用。
#[async_trait]
pub trait RemoteStorageClient: Send + Sync {
    /// 在 `parent_id` 下创建文件夹
    ///
    /// `cancel` 被触发时实现应尽力中止请求并返回 `TransferError::Cancelled`。
    async fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteFolder>;

    /// 删除文件夹（连同其内容）
    async fn delete_folder(&self, folder_id: &str) -> Result<()>;

    /// 列出子文件夹（分页）
    async fn list_child_folders(
        &self,
        folder_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<RemoteFolder>>;

    /// 列出子文件（分页）
    async fn list_child_files(&self, folder_id: &str, cursor: Option<&str>)
        -> Result<Page<RemoteFile>>;

    /// 获取文件解密后的字节流
    async fn fetch_file_stream(
        &self,
        file_id: &str,
        bucket_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ByteStream>;

    /// 批量上传文件到 `parent_id`
    ///
    /// 单个文件失败不影响同批其他文件，结果按输入顺序返回。
    async fn upload_file_batch(
        &self,
        files: Vec<UploadFile>,
        parent_id: &str,
        options: UploadBatchOptions,
    ) -> Vec<FileUploadResult>;
}
