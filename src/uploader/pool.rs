// 上传并发自适应控制

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::common::MemoryPressureSampler;
use crate::config::UploadConfig;

/// 自适应并发上限
///
/// 每次出队前调用 `retune()`：内存占用低于低水位时 +1（不超过上限），
/// 达到高水位时降为 1。没有采样器时并发固定为上限。
/// 并发值允许短暂过期，只要求原子读写。
pub struct AdaptiveConcurrency {
    current: AtomicUsize,
    max: usize,
    low_watermark: f64,
    high_watermark: f64,
    sampler: Option<Arc<dyn MemoryPressureSampler>>,
}

impl AdaptiveConcurrency {
    pub fn new(config: &UploadConfig, sampler: Option<Arc<dyn MemoryPressureSampler>>) -> Self {
        let max = config.effective_concurrency();
        let sampler = if config.adaptive_concurrency {
            sampler
        } else {
            None
        };
        Self {
            current: AtomicUsize::new(max),
            max,
            low_watermark: config.memory_low_watermark,
            high_watermark: config.memory_high_watermark,
            sampler,
        }
    }

    /// 固定并发
    pub fn fixed(limit: usize) -> Self {
        let max = limit.max(1);
        Self {
            current: AtomicUsize::new(max),
            max,
            low_watermark: 0.0,
            high_watermark: 1.0,
            sampler: None,
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn is_adaptive(&self) -> bool {
        self.sampler.is_some()
    }

    /// 采样内存压力并调整并发，返回调整后的值
    pub fn retune(&self) -> usize {
        let Some(sampler) = &self.sampler else {
            return self.current();
        };

        let usage = sampler.sample();
        let previous = self.current();
        let next = if usage >= self.high_watermark {
            1
        } else if usage < self.low_watermark {
            (previous + 1).min(self.max)
        } else {
            previous
        };

        if next != previous {
            self.current.store(next, Ordering::Release);
            if next < previous {
                info!(
                    "内存压力过高，降低上传并发: usage={:.2}, {} -> {}",
                    usage, previous, next
                );
            } else {
                debug!("提高上传并发: usage={:.2}, {} -> {}", usage, previous, next);
            }
        }
        next
    }
}

impl std::fmt::Debug for AdaptiveConcurrency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveConcurrency")
            .field("current", &self.current())
            .field("max", &self.max)
            .field("adaptive", &self.is_adaptive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixedMemorySampler;

    #[test]
    fn test_no_sampler_is_fixed() {
        let pool = AdaptiveConcurrency::new(&UploadConfig::default(), None);
        assert!(!pool.is_adaptive());
        assert_eq!(pool.retune(), 6);
        assert_eq!(pool.retune(), 6);
    }

    #[test]
    fn test_high_pressure_drops_to_one_then_recovers() {
        let sampler = Arc::new(FixedMemorySampler::new(0.9));
        let pool = AdaptiveConcurrency::new(
            &UploadConfig::default(),
            Some(sampler.clone() as Arc<dyn MemoryPressureSampler>),
        );

        assert_eq!(pool.retune(), 1);

        // 中间区间保持不变
        sampler.set(0.75);
        assert_eq!(pool.retune(), 1);

        // 低压力时每次 +1，直到上限
        sampler.set(0.3);
        assert_eq!(pool.retune(), 2);
        assert_eq!(pool.retune(), 3);
        for _ in 0..10 {
            pool.retune();
        }
        assert_eq!(pool.current(), 6);
    }

    #[test]
    fn test_adaptive_disabled_by_config() {
        let config = UploadConfig {
            adaptive_concurrency: false,
            max_concurrency: 3,
            ..Default::default()
        };
        let sampler: Arc<dyn MemoryPressureSampler> = Arc::new(FixedMemorySampler::new(0.99));
        let pool = AdaptiveConcurrency::new(&config, Some(sampler));
        assert_eq!(pool.retune(), 3);
    }
}
