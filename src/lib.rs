// Netdisk Transfer Library
// 网盘传输编排核心库

// 配置管理模块
pub mod config;

// 错误处理模块
pub mod error;

// 任务注册表模块
pub mod task;

// 公共组件模块
pub mod common;

// 远程存储协作方接口
pub mod remote;

// 归档写入模块
pub mod archive;

// 文件夹上传模块
pub mod uploader;

// 打包下载模块
pub mod downloader;

// 传输引擎
pub mod engine;

#[cfg(test)]
pub(crate) mod testing;

// 导出常用类型
pub use archive::{ArchiveWriter, ZipArchiveWriter};
pub use common::{MemoryPressureSampler, SystemMemorySampler};
pub use config::EngineConfig;
pub use downloader::{
    ArchiveOptions, ArchiveTarget, DownloadSource, StreamingArchiveDownloader, TransferItem,
};
pub use engine::TransferEngine;
pub use error::{ErrorCategory, FileTracking, TransferError};
pub use remote::{
    ErrorReporter, InMemoryCache, LocalCache, RemoteStorageClient, TracingErrorReporter,
};
pub use task::{Task, TaskEvent, TaskKind, TaskPatch, TaskRegistry, TaskStatus};
pub use uploader::{ConcurrentFolderUploader, FolderNode, FolderTreeWalker, UploadOptions};
