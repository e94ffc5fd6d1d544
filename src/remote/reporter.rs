use tracing::error;

use crate::error::TransferError;

/// 错误上报（只管发出，不会失败）
pub trait ErrorReporter: Send + Sync {
    fn report(&self, task_id: &str, error: &TransferError);
}

/// 写入 tracing 日志的上报器
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, task_id: &str, err: &TransferError) {
        match err {
            TransferError::Download { tracking, source } => error!(
                "传输失败: task_id={}, category={:?}, file_id={:?}, size={:?}, ext={:?}, error={}",
                task_id,
                err.category(),
                tracking.file_id,
                tracking.size,
                tracking.extension,
                source
            ),
            _ => error!(
                "传输失败: task_id={}, category={:?}, error={}",
                task_id,
                err.category(),
                err
            ),
        }
    }
}
