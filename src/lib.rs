//! Feed ingestion engine: polls RSS/Atom feeds on a schedule, stores new
//! posts under time-ordered ids, trims them after a retention window and
//! serves extracted article bodies through a fetch-through cache.

pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod id;
pub mod models;
pub mod scheduler;
pub mod services;
pub mod store;

pub use config::Config;
pub use error::{AppError, Result};
pub use id::IdGen;
pub use scheduler::{CrawlScheduler, CrawlSettings, CycleReport, TrimScheduler};
pub use services::ArticleCache;
pub use store::{Store, StoreSettings};
