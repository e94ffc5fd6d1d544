//! 公共模块
//!
//! 提供跨模块使用的通用组件

mod memory_monitor;
mod speed;
mod throttle;

pub use memory_monitor::{MemoryPressureSampler, SystemMemorySampler};
pub use speed::SpeedCalculator;
pub use throttle::ProgressThrottler;

/// 格式化字节大小为人类可读格式
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
