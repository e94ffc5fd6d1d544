// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

/// 上传并发硬上限
pub const MAX_UPLOAD_CONCURRENCY: usize = 6;

/// 引擎配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
}

/// 文件夹上传配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    /// 最大并发数（同时处理的文件夹节点数）
    pub max_concurrency: usize,
    /// 创建文件夹后等待远程元数据生效的时间（毫秒），0 表示不等待
    pub settle_delay_ms: u64,
    /// 是否根据内存压力动态调整并发
    pub adaptive_concurrency: bool,
    /// 低于此内存占用比例时并发 +1
    pub memory_low_watermark: f64,
    /// 达到此内存占用比例时并发降为 1
    pub memory_high_watermark: f64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrency: MAX_UPLOAD_CONCURRENCY,
            settle_delay_ms: 500,
            adaptive_concurrency: true,
            memory_low_watermark: 0.70,
            memory_high_watermark: 0.80,
        }
    }
}

impl UploadConfig {
    /// 创建文件夹后的等待时间
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// 实际生效的最大并发（限制在 1..=6）
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.clamp(1, MAX_UPLOAD_CONCURRENCY)
    }
}

/// 打包下载配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    /// 任务进度发布最小间隔（毫秒）
    pub progress_interval_ms: u64,
    /// 写回本地缓存的单文件大小上限（字节）
    pub cache_write_limit: u64,
    /// 速度计算窗口（秒）
    pub speed_window_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: 200,
            cache_write_limit: 64 * 1024 * 1024,
            speed_window_secs: 5,
        }
    }
}

impl EngineConfig {
    /// 验证配置是否合法
    pub fn validate(&self) -> Result<(), String> {
        let upload = &self.upload;
        if upload.max_concurrency == 0 || upload.max_concurrency > MAX_UPLOAD_CONCURRENCY {
            return Err(format!(
                "上传并发数必须在 1 到 {} 之间，当前: {}",
                MAX_UPLOAD_CONCURRENCY, upload.max_concurrency
            ));
        }

        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        if !in_range(upload.memory_low_watermark) || !in_range(upload.memory_high_watermark) {
            return Err("内存水位必须在 0.0 到 1.0 之间".to_string());
        }
        if upload.memory_low_watermark >= upload.memory_high_watermark {
            return Err(format!(
                "内存低水位 ({}) 必须小于高水位 ({})",
                upload.memory_low_watermark, upload.memory_high_watermark
            ));
        }

        if self.download.speed_window_secs == 0 {
            return Err("速度计算窗口不能为 0".to_string());
        }

        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: EngineConfig =
            toml::from_str(&content).context("Failed to parse config file")?;

        if let Err(msg) = config.validate() {
            anyhow::bail!("配置无效: {}", msg);
        }

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}
