// 远程存储数据类型

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;

/// 解密后的文件字节流
pub type ByteStream = BoxStream<'static, Result<Bytes, TransferError>>;

/// 远程文件夹
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteFolder {
    /// 文件夹ID
    pub id: String,
    /// 文件夹名
    pub name: String,
    /// 父目录ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// 服务器修改时间
    pub updated_at: DateTime<Utc>,
}

/// 远程文件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteFile {
    /// 文件ID
    pub id: String,
    /// 文件名
    pub name: String,
    /// 文件大小（字节）
    pub size: u64,
    /// 存储桶ID
    pub bucket_id: String,
    /// 服务器修改时间（缓存新鲜度判断依据）
    pub updated_at: DateTime<Utc>,
}

/// 分页列表结果
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// 下一页游标，None 表示没有更多
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    /// 单页结果
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }

    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }
}

/// 待上传文件
#[derive(Debug, Clone, PartialEq)]
pub struct UploadFile {
    /// 文件名
    pub name: String,
    /// 文件内容
    pub content: Bytes,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// 批量上传选项
#[derive(Debug, Clone)]
pub struct UploadBatchOptions {
    /// 所属的文件夹上传任务ID（子任务的 related_task_id）
    pub related_task_id: String,
    /// 取消令牌（与父任务共享）
    pub cancel: CancellationToken,
}

/// 单文件上传结果
#[derive(Debug)]
pub struct FileUploadResult {
    /// 文件名
    pub name: String,
    /// 上传成功返回远程文件，失败返回错误
    pub result: Result<RemoteFile, TransferError>,
}
