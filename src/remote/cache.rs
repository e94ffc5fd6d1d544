// 本地文件缓存

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// 缓存中的文件内容
#[derive(Debug, Clone, PartialEq)]
pub struct CachedBlob {
    /// 解密后的文件内容
    pub bytes: Bytes,
    /// 写入缓存时远程文件的修改时间
    pub updated_at: DateTime<Utc>,
}

/// 本地缓存
///
/// 缓存读写失败不应影响传输，实现内部自行吞掉错误。
#[async_trait]
pub trait LocalCache: Send + Sync {
    async fn get(&self, file_id: &str) -> Option<CachedBlob>;

    async fn put(&self, file_id: &str, bytes: Bytes, updated_at: DateTime<Utc>);

    /// 从本地元数据中移除文件夹（上传取消后清理根目录）
    async fn forget_folder(&self, _folder_id: &str) {}
}

/// 进程内缓存
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<String, CachedBlob>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl LocalCache for InMemoryCache {
    async fn get(&self, file_id: &str) -> Option<CachedBlob> {
        self.entries.get(file_id).map(|entry| entry.value().clone())
    }

    async fn put(&self, file_id: &str, bytes: Bytes, updated_at: DateTime<Utc>) {
        self.entries
            .insert(file_id.to_string(), CachedBlob { bytes, updated_at });
    }
}
