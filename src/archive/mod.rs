//! 流式归档写入
//!
//! 打包下载时逐个文件写入归档，不在内存中缓存整棵目录树。

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{Result, TransferError};
use crate::remote::ByteStream;

/// 归档写入器
///
/// `add_file` 按调用顺序串行写入；`close` 和 `abort` 是两种终结方式，
/// 终结之后的写入返回错误。
#[async_trait]
pub trait ArchiveWriter: Send + Sync {
    /// 写入一个文件条目（路径以 `/` 分隔）
    async fn add_file(&self, path: &str, stream: ByteStream) -> Result<()>;

    /// 完成归档
    async fn close(&self) -> Result<()>;

    /// 放弃归档并释放已写出的部分内容（可重复调用）
    async fn abort(&self);
}

enum ZipState {
    Open(ZipWriter<BufWriter<File>>),
    Closed,
    Aborted,
}

/// 写入本地 zip 文件的归档写入器
pub struct ZipArchiveWriter {
    /// 输出文件路径
    path: PathBuf,
    state: Mutex<ZipState>,
    options: SimpleFileOptions,
}

impl ZipArchiveWriter {
    /// 创建输出文件（父目录不存在时自动创建）
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;

        info!("创建归档文件: {:?}", path);

        Ok(Self {
            path,
            state: Mutex::new(ZipState::Open(ZipWriter::new(BufWriter::new(file)))),
            options: SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ArchiveWriter for ZipArchiveWriter {
    async fn add_file(&self, path: &str, mut stream: ByteStream) -> Result<()> {
        let mut state = self.state.lock().await;
        let ZipState::Open(writer) = &mut *state else {
            return Err(TransferError::Archive(format!("归档已结束，无法写入: {}", path)));
        };

        writer.start_file(path, self.options)?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk)?;
            written += chunk.len() as u64;
        }

        debug!("归档写入条目: path={}, bytes={}", path, written);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, ZipState::Closed) {
            ZipState::Open(writer) => {
                let mut inner = writer.finish()?;
                inner.flush()?;
                info!("归档完成: {:?}", self.path);
                Ok(())
            }
            ZipState::Closed => Ok(()),
            ZipState::Aborted => {
                *state = ZipState::Aborted;
                Err(TransferError::Archive("归档已放弃".to_string()))
            }
        }
    }

    async fn abort(&self) {
        let mut state = self.state.lock().await;
        if !matches!(*state, ZipState::Open(_)) {
            return;
        }
        // 先关闭文件句柄再删除
        *state = ZipState::Aborted;

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => info!("已删除未完成的归档: {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除未完成的归档失败: {:?}, error={}", self.path, e),
        }
    }
}

impl std::fmt::Debug for ZipArchiveWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipArchiveWriter")
            .field("path", &self.path)
            .finish()
    }
}
