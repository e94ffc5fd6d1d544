//! 传输错误处理模块
//!
//! 提供统一的错误分类和用户友好的错误消息

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 下载失败时携带的文件追踪信息（用于错误上报）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTracking {
    /// 远程文件ID
    pub file_id: Option<String>,
    /// 文件大小（字节）
    pub size: Option<u64>,
    /// 文件扩展名
    pub extension: Option<String>,
}

impl FileTracking {
    /// 从文件名和大小构造追踪信息
    pub fn new(file_id: &str, name: &str, size: u64) -> Self {
        let extension = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty());
        Self {
            file_id: Some(file_id.to_string()),
            size: Some(size),
            extension,
        }
    }
}

/// 传输错误
#[derive(Debug, Error)]
pub enum TransferError {
    /// 同名资源已存在
    #[error("资源已存在: {0}")]
    AlreadyExists(String),

    /// 空间配额不足
    #[error("空间配额不足")]
    QuotaExceeded,

    /// 网络错误（可重试）
    #[error("网络错误: {0}")]
    Network(String),

    /// 远程服务拒绝
    #[error("远程操作失败: {0}")]
    Remote(String),

    /// 远程资源不存在
    #[error("远程资源不存在: {0}")]
    NotFound(String),

    /// 任务已取消
    #[error("任务已取消")]
    Cancelled,

    /// 归档写入错误
    #[error("归档写入错误: {0}")]
    Archive(String),

    /// 本地 I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 本地缓存错误
    #[error("缓存错误: {0}")]
    Cache(String),

    /// 任务不存在
    #[error("任务不存在: {0}")]
    TaskNotFound(String),

    /// 非法的状态迁移
    #[error("非法的状态迁移: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::task::TaskStatus,
        to: crate::task::TaskStatus,
    },

    /// 打包下载失败（携带最后处理的文件信息）
    #[error("打包下载失败: {source}")]
    Download {
        tracking: FileTracking,
        #[source]
        source: Box<TransferError>,
    },
}

impl From<zip::result::ZipError> for TransferError {
    fn from(err: zip::result::ZipError) -> Self {
        TransferError::Archive(err.to_string())
    }
}

impl TransferError {
    /// 获取错误分类
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransferError::Network(_) => ErrorCategory::Transient,
            TransferError::QuotaExceeded => ErrorCategory::Resource,
            TransferError::Cancelled => ErrorCategory::UserCancelled,
            TransferError::Download { source, .. } => source.category(),
            _ => ErrorCategory::Permanent,
        }
    }

    /// 是否为取消（取消不是错误，不上报、不提示）
    pub fn is_cancelled(&self) -> bool {
        self.category() == ErrorCategory::UserCancelled
    }

    /// 是否可重试
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// 获取用户友好的错误消息（任务副标题）
    pub fn user_message(&self) -> String {
        match self {
            TransferError::AlreadyExists(name) => format!("“{}” 已存在，请重命名后重试", name),
            TransferError::QuotaExceeded => "网盘空间不足".to_string(),
            TransferError::Download { source, .. } => source.user_message(),
            _ => "传输失败，请稍后重试".to_string(),
        }
    }

    /// 包装为带追踪信息的下载错误
    pub fn with_tracking(self, tracking: FileTracking) -> Self {
        match self {
            TransferError::Cancelled => TransferError::Cancelled,
            err @ TransferError::Download { .. } => err,
            err => TransferError::Download {
                tracking,
                source: Box::new(err),
            },
        }
    }
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 临时错误（可重试）
    Transient,
    /// 永久错误（不可重试）
    Permanent,
    /// 资源错误（需要用户干预）
    Resource,
    /// 用户取消
    UserCancelled,
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        assert_eq!(
            TransferError::Network("timeout".into()).category(),
            ErrorCategory::Transient
        );
        assert_eq!(TransferError::QuotaExceeded.category(), ErrorCategory::Resource);
        assert!(TransferError::Cancelled.is_cancelled());
        assert!(!TransferError::AlreadyExists("a".into()).is_retryable());
    }

    #[test]
    fn test_user_message() {
        let msg = TransferError::AlreadyExists("照片".into()).user_message();
        assert!(msg.contains("照片"));
        assert!(msg.contains("已存在"));

        let generic = TransferError::Remote("500".into()).user_message();
        assert_eq!(generic, "传输失败，请稍后重试");
    }

    #[test]
    fn test_with_tracking() {
        let tracking = FileTracking::new("f1", "movie.MKV", 42);
        assert_eq!(tracking.extension.as_deref(), Some("mkv"));

        let err = TransferError::Network("reset".into()).with_tracking(tracking.clone());
        match &err {
            TransferError::Download { tracking: t, source } => {
                assert_eq!(t, &tracking);
                assert!(matches!(**source, TransferError::Network(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_retryable());

        // 取消不会被包装
        assert!(TransferError::Cancelled
            .with_tracking(FileTracking::default())
            .is_cancelled());
    }

    #[test]
    fn test_tracking_without_extension() {
        let tracking = FileTracking::new("f2", "README", 1);
        assert!(tracking.extension.is_none());
    }
}
