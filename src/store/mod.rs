//! Durable entity store with lazily rebuilt in-memory caches.
//!
//! Feeds and posts each have their own cache behind their own lock. Readers
//! rebuild a dropped cache from a full bucket scan; writers persist first
//! and drop the cache only after the write committed, so a failed write
//! leaves the cache matching what is durable. Feed requests are always read
//! through.

mod feed_requests;
mod feeds;
mod posts;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::db::KvStore;
use crate::error::{AppError, Result};
use crate::id::{IdGen, GENERAL_SUBSYSTEM};
use crate::models::{Feed, FeedRequest, Post};

pub use feeds::FeedCache;
pub use posts::PostCache;

pub const DB_VERSION: &str = "1";

const INFO: &str = "info";
const FEEDS: &str = "feeds";
const POSTS: &str = "posts";
const FEED_REQUESTS: &str = "feedrequests";
const VERSION_KEY: &[u8] = b"dbversion";

#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Posts older than this are rejected on insert and removed by trims.
    pub retention: Duration,
    pub max_feed_requests: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(48 * 3600),
            max_feed_requests: 64,
        }
    }
}

/// Everything the store holds, in a JSON friendly shape.
#[derive(Debug, Clone, Serialize)]
pub struct Backup {
    pub dbversion: String,
    pub feeds: Vec<Feed>,
    pub posts: Vec<Post>,
    pub feedrequests: Vec<FeedRequest>,
}

pub struct Store {
    kv: KvStore,
    ids: Arc<IdGen>,
    settings: StoreSettings,
    feed_cache: Mutex<Option<Arc<FeedCache>>>,
    post_cache: Mutex<Option<Arc<PostCache>>>,
}

impl Store {
    pub async fn open(db_path: &str, settings: StoreSettings) -> Result<Self> {
        Self::open_with_ids(db_path, settings, Arc::new(IdGen::new(GENERAL_SUBSYSTEM))).await
    }

    /// Open with an explicit general-purpose generator, e.g. one with a
    /// manual clock.
    pub async fn open_with_ids(
        db_path: &str,
        settings: StoreSettings,
        ids: Arc<IdGen>,
    ) -> Result<Self> {
        let kv = KvStore::open(db_path).await?;

        kv.update(|tx| {
            match tx.get(INFO, VERSION_KEY)? {
                Some(version) if version != DB_VERSION.as_bytes() => {
                    return Err(AppError::validation(format!(
                        "unknown database version {}",
                        String::from_utf8_lossy(&version)
                    )));
                }
                Some(_) => {}
                None => {
                    tx.create_bucket(INFO)?;
                    tx.put(INFO, VERSION_KEY, DB_VERSION.as_bytes())?;
                }
            }
            for bucket in [FEEDS, POSTS, FEED_REQUESTS] {
                tx.create_bucket(bucket)?;
            }
            Ok(())
        })
        .await?;

        tracing::debug!("opened store at {}", db_path);

        Ok(Self {
            kv,
            ids,
            settings,
            feed_cache: Mutex::new(None),
            post_cache: Mutex::new(None),
        })
    }

    pub async fn check_version(&self) -> Result<Option<String>> {
        let version = self.kv.view(|tx| tx.get(INFO, VERSION_KEY)).await?;
        Ok(version.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// The general-purpose generator, shared with other components that
    /// mint ids on subsystem 0.
    pub fn ids(&self) -> Arc<IdGen> {
        Arc::clone(&self.ids)
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Oldest publish date still inside the retention window.
    pub fn posts_max_age(&self) -> DateTime<Utc> {
        cutoff(self.ids.now(), self.settings.retention)
    }

    pub async fn export(&self) -> Result<Backup> {
        Ok(Backup {
            dbversion: self.check_version().await?.unwrap_or_default(),
            feeds: self.feeds_all().await?,
            posts: self.posts_all(None).await?,
            feedrequests: self.feed_reqs_all().await?,
        })
    }
}

pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn index_by_id<T, F: Fn(&T) -> i64>(items: &[T], id: F) -> HashMap<i64, usize> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| (id(item), i))
        .collect()
}
