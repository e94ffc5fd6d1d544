//! 上传目录树
//!
//! - `FolderNode`：客户端提交的目录树（文件内容已在内存中）
//! - `FolderTreeWalker`：广度优先遍历与计数
//! - `FolderNode::scan_local`：从本地文件夹构建目录树

use std::collections::VecDeque;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::common::format_bytes;
use crate::error::{Result, TransferError};
use crate::remote::UploadFile;

/// 目录树节点
#[derive(Debug, Clone, PartialEq)]
pub struct FolderNode {
    /// 文件夹名
    pub name: String,
    /// 远程父目录ID（根节点由上传目标决定，子节点在父目录创建后填入）
    pub remote_parent_id: Option<String>,
    /// 本层文件
    pub files: Vec<UploadFile>,
    /// 子文件夹
    pub children: Vec<FolderNode>,
}

impl FolderNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote_parent_id: None,
            files: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_files(mut self, files: Vec<UploadFile>) -> Self {
        self.files = files;
        self
    }

    pub fn with_children(mut self, children: Vec<FolderNode>) -> Self {
        self.children = children;
        self
    }

    /// 从本地文件夹构建目录树
    ///
    /// 同一层的文件和子文件夹按名称排序，保证遍历顺序稳定。
    pub fn scan_local(root: impl AsRef<Path>, options: &ScanOptions) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(TransferError::NotFound(format!(
                "本地文件夹不存在: {}",
                root.display()
            )));
        }

        info!("开始扫描文件夹: {}", root.display());
        let node = scan_dir(root, options)?;

        let stats = FolderTreeWalker::stats(&node);
        info!(
            "文件夹扫描完成: {} 个文件夹, {} 个文件, 总大小 {}",
            stats.folders,
            stats.files,
            format_bytes(stats.bytes)
        );
        Ok(node)
    }
}

/// 本地扫描选项
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// 跳过隐藏文件（以 . 开头）
    pub skip_hidden: bool,
    /// 超过此大小的文件将被跳过
    pub max_file_size: Option<u64>,
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn scan_dir(dir: &Path, options: &ScanOptions) -> Result<FolderNode> {
    let mut node = FolderNode::new(file_name_of(dir));

    let mut entries = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();

        if options.skip_hidden && name.starts_with('.') {
            debug!("跳过隐藏文件: {}", path.display());
            continue;
        }

        let metadata = std::fs::symlink_metadata(&path)?;
        if metadata.is_dir() {
            node.children.push(scan_dir(&path, options)?);
        } else if metadata.is_file() {
            if let Some(max) = options.max_file_size {
                if metadata.len() > max {
                    warn!(
                        "跳过超大文件: {} ({} > {})",
                        path.display(),
                        format_bytes(metadata.len()),
                        format_bytes(max)
                    );
                    continue;
                }
            }
            let content = std::fs::read(&path)?;
            node.files.push(UploadFile::new(name, content));
        } else {
            debug!("跳过符号链接: {}", path.display());
        }
    }

    Ok(node)
}

/// 目录树统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    /// 文件夹数（含根）
    pub folders: u64,
    /// 文件数
    pub files: u64,
    /// 文件总字节数
    pub bytes: u64,
}

impl TreeStats {
    /// 进度分母：文件夹数 + 文件数
    pub fn total_items(&self) -> u64 {
        self.folders + self.files
    }
}

/// 目录树广度优先遍历
pub struct FolderTreeWalker;

impl FolderTreeWalker {
    /// 按层级顺序遍历所有节点（根在最前）
    pub fn breadth_first(root: &FolderNode) -> BreadthFirst<'_> {
        BreadthFirst {
            queue: VecDeque::from([root]),
        }
    }

    pub fn stats(root: &FolderNode) -> TreeStats {
        Self::breadth_first(root).fold(TreeStats::default(), |mut acc, node| {
            acc.folders += 1;
            acc.files += node.files.len() as u64;
            acc.bytes += node.files.iter().map(UploadFile::size).sum::<u64>();
            acc
        })
    }

    /// 总条目数（根文件夹计为 1）
    pub fn count_items(root: &FolderNode) -> u64 {
        Self::stats(root).total_items()
    }
}

/// 广度优先迭代器
pub struct BreadthFirst<'a> {
    queue: VecDeque<&'a FolderNode>,
}

impl<'a> Iterator for BreadthFirst<'a> {
    type Item = &'a FolderNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.queue.pop_front()?;
        self.queue.extend(node.children.iter());
        Some(node)
    }
}
