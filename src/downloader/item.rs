// 下载输入

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::remote::{RemoteFile, RemoteFolder};

/// 要下载的远程文件或文件夹
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferItem {
    pub id: String,
    pub name: String,
    pub is_folder: bool,
    /// 文件大小（文件夹为 None）
    #[serde(default)]
    pub size: Option<u64>,
    /// 文件内容ID（与条目ID不同时使用）
    #[serde(default)]
    pub remote_file_id: Option<String>,
    pub bucket_id: String,
    /// 远程修改时间，缺失时不使用缓存
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TransferItem {
    pub fn folder(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_folder: true,
            size: None,
            remote_file_id: None,
            bucket_id: String::new(),
            updated_at: None,
        }
    }

    /// 拉取内容时使用的文件ID
    pub fn content_id(&self) -> &str {
        self.remote_file_id.as_deref().unwrap_or(&self.id)
    }
}

impl From<RemoteFile> for TransferItem {
    fn from(file: RemoteFile) -> Self {
        Self {
            id: file.id,
            name: file.name,
            is_folder: false,
            size: Some(file.size),
            remote_file_id: None,
            bucket_id: file.bucket_id,
            updated_at: Some(file.updated_at),
        }
    }
}

impl From<RemoteFolder> for TransferItem {
    fn from(folder: RemoteFolder) -> Self {
        Self::folder(folder.id, folder.name)
    }
}

/// 下载来源
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadSource {
    /// 单个文件夹，归档内路径相对于该文件夹
    Folder(TransferItem),
    /// 多选条目，文件夹以自身名称为路径前缀
    Items(Vec<TransferItem>),
}

impl DownloadSource {
    /// 任务标题
    pub fn display_name(&self) -> String {
        match self {
            DownloadSource::Folder(item) => item.name.clone(),
            DownloadSource::Items(items) => match items.as_slice() {
                [single] => single.name.clone(),
                _ => format!("{} 个项目", items.len()),
            },
        }
    }

    pub fn source_ids(&self) -> Vec<String> {
        match self {
            DownloadSource::Folder(item) => vec![item.id.clone()],
            DownloadSource::Items(items) => items.iter().map(|i| i.id.clone()).collect(),
        }
    }

    /// 是否只包含单个文件
    pub fn is_single_file(&self) -> bool {
        matches!(self, DownloadSource::Items(items) if items.len() == 1 && !items[0].is_folder)
    }
}
