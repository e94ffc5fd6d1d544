//! 进度发布节流器
//!
//! 字节级进度更新非常频繁，写入注册表前按时间间隔节流，
//! 最后一次更新（完成时）总是放行。

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// 进度节流器（线程安全）
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 上次放行的时间
    last_emit: Mutex<Option<Instant>>,
    /// 最小放行间隔
    interval: Duration,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit: Mutex::new(None),
            interval,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查是否应该发布
    ///
    /// `finished` 为 true 时无条件放行；否则距离上次放行超过间隔才放行
    pub fn should_emit(&self, finished: bool) -> bool {
        let now = Instant::now();
        let mut last = self.last_emit.lock();

        if !finished {
            if let Some(last_time) = *last {
                if now.duration_since(last_time) < self.interval {
                    return false;
                }
            }
        }
        *last = Some(now);
        true
    }

    /// 重置节流器状态
    pub fn reset(&self) {
        *self.last_emit.lock() = None;
    }
}
