use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::scheduler::CrawlSettings;
use crate::services::DEFAULT_CAPACITY;
use crate::store::StoreSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_post_retention")]
    pub post_retention_hours: u64,

    #[serde(default = "default_trim_interval")]
    pub trim_interval_minutes: u64,

    #[serde(default = "default_crawl_interval")]
    pub crawl_interval_seconds: u64,

    #[serde(default = "default_crawl_warmup")]
    pub crawl_warmup_seconds: u64,

    #[serde(default = "default_article_cache_capacity")]
    pub article_cache_capacity: usize,

    #[serde(default = "default_max_feed_requests")]
    pub max_feed_requests: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
}

fn default_db_path() -> String {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("news-ingest");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("news.db").to_string_lossy().to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_post_retention() -> u64 {
    48
}

fn default_trim_interval() -> u64 {
    60
}

fn default_crawl_interval() -> u64 {
    300
}

fn default_crawl_warmup() -> u64 {
    2
}

fn default_article_cache_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_max_feed_requests() -> usize {
    64
}

fn default_user_agent() -> String {
    "news-ingest/0.1".to_string()
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
            post_retention_hours: default_post_retention(),
            trim_interval_minutes: default_trim_interval(),
            crawl_interval_seconds: default_crawl_interval(),
            crawl_warmup_seconds: default_crawl_warmup(),
            article_cache_capacity: default_article_cache_capacity(),
            max_feed_requests: default_max_feed_requests(),
            user_agent: default_user_agent(),
            http_timeout_seconds: default_http_timeout(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("news-ingest")
            .join("config.toml")
    }

    fn validate(&self) -> Result<()> {
        if self.post_retention_hours == 0 {
            return Err(AppError::Config("post_retention_hours must be positive".into()));
        }
        if self.article_cache_capacity == 0 {
            return Err(AppError::Config("article_cache_capacity must be positive".into()));
        }
        if self.crawl_interval_seconds == 0 || self.trim_interval_minutes == 0 {
            return Err(AppError::Config("intervals must be positive".into()));
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.post_retention_hours * 3600)
    }

    pub fn trim_interval(&self) -> Duration {
        Duration::from_secs(self.trim_interval_minutes * 60)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            retention: self.retention(),
            max_feed_requests: self.max_feed_requests,
        }
    }

    pub fn crawl_settings(&self) -> CrawlSettings {
        CrawlSettings {
            warmup: Duration::from_secs(self.crawl_warmup_seconds),
            interval: Duration::from_secs(self.crawl_interval_seconds),
            ..CrawlSettings::default()
        }
    }
}
