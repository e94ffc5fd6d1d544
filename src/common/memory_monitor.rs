//! 内存压力采样模块
//!
//! 为上传并发自适应提供内存占用比例，并记录峰值

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sysinfo::System;

/// 内存压力采样器
///
/// 返回当前内存占用比例 [0.0, 1.0]。平台不提供该信号时不设置采样器，
/// 上传并发退化为固定值。
pub trait MemoryPressureSampler: Send + Sync {
    fn sample(&self) -> f64;
}

/// 基于 sysinfo 的系统内存采样器
pub struct SystemMemorySampler {
    /// 系统信息实例
    system: Mutex<System>,
    /// 峰值已用内存（字节）
    peak_usage: AtomicU64,
}

impl SystemMemorySampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            peak_usage: AtomicU64::new(0),
        }
    }

    /// 获取峰值内存使用量（字节）
    pub fn peak_usage(&self) -> u64 {
        self.peak_usage.load(Ordering::Relaxed)
    }

    /// 更新峰值记录
    fn update_peak(&self, current: u64) {
        let mut peak = self.peak_usage.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_usage.compare_exchange_weak(
                peak,
                current,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    tracing::debug!(
                        "内存峰值更新: {} -> {}",
                        super::format_bytes(peak),
                        super::format_bytes(current)
                    );
                    break;
                }
                Err(p) => peak = p,
            }
        }
    }
}

impl MemoryPressureSampler for SystemMemorySampler {
    fn sample(&self) -> f64 {
        let (used, total) = {
            let mut system = self.system.lock();
            system.refresh_memory();
            (system.used_memory(), system.total_memory())
        };

        self.update_peak(used);

        if total == 0 {
            return 0.0;
        }
        (used as f64 / total as f64).clamp(0.0, 1.0)
    }
}

impl Default for SystemMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}
