use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, warn};

use crate::db::Order;
use crate::error::{AppError, Result};
use crate::id::id_key;
use crate::models::{Feed, FeedData};

use super::{index_by_id, Store, FEEDS};

/// Snapshot of every feed, ordered by handle, descending.
#[derive(Debug, Default)]
pub struct FeedCache {
    feeds: Vec<Feed>,
    by_id: HashMap<i64, usize>,
}

impl FeedCache {
    fn new(mut feeds: Vec<Feed>) -> Self {
        feeds.sort_by(|a, b| b.handle.cmp(&a.handle));
        let by_id = index_by_id(&feeds, |f| f.id);
        Self { feeds, by_id }
    }

    pub fn feeds(&self) -> &[Feed] {
        &self.feeds
    }

    pub fn get(&self, id: i64) -> Option<&Feed> {
        self.by_id.get(&id).map(|&i| &self.feeds[i])
    }
}

impl Store {
    async fn feeds_touch(&self, slot: &mut Option<Arc<FeedCache>>) -> Result<Arc<FeedCache>> {
        if let Some(cache) = slot {
            return Ok(Arc::clone(cache));
        }

        let records = self.kv.view(|tx| tx.scan(FEEDS, Order::Ascending)).await?;
        let mut feeds = Vec::with_capacity(records.len());
        for (_, value) in records {
            match serde_json::from_slice::<Feed>(&value) {
                Ok(feed) => feeds.push(feed),
                Err(e) => warn!("skipping unreadable feed record: {}", e),
            }
        }

        let cache = Arc::new(FeedCache::new(feeds));
        *slot = Some(Arc::clone(&cache));
        Ok(cache)
    }

    pub async fn feed_cache(&self) -> Result<Arc<FeedCache>> {
        let mut slot = self.feed_cache.lock().await;
        self.feeds_touch(&mut slot).await
    }

    pub async fn feeds_all(&self) -> Result<Vec<Feed>> {
        Ok(self.feed_cache().await?.feeds().to_vec())
    }

    pub async fn feeds_all_map(&self) -> Result<HashMap<i64, Feed>> {
        let cache = self.feed_cache().await?;
        Ok(cache.feeds().iter().map(|f| (f.id, f.clone())).collect())
    }

    pub async fn feed_by_id(&self, id: i64) -> Result<Feed> {
        self.feed_cache()
            .await?
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("feed {}", id)))
    }

    /// True when another feed already uses this handle or URL.
    pub async fn feed_exists(&self, handle: &str, url: &str) -> Result<bool> {
        let cache = self.feed_cache().await?;
        Ok(cache
            .feeds()
            .iter()
            .any(|f| f.handle == handle || f.url == url))
    }

    /// Create or replace a feed record.
    pub async fn set_feed(&self, feed: &Feed) -> Result<()> {
        validate_feed(feed)?;

        let mut slot = self.feed_cache.lock().await;
        let cache = self.feeds_touch(&mut slot).await?;
        check_unique(&cache, feed)?;

        self.persist_feed(feed).await?;
        *slot = None;
        Ok(())
    }

    /// Administrative creation path: mints the id and stores the feed.
    pub async fn add_feed(&self, handle: &str, url: &str) -> Result<Feed> {
        let feed = Feed::new(self.ids.make_id(), handle.trim(), url.trim());
        self.set_feed(&feed).await?;
        tracing::info!(handle = %feed.handle, "added feed {}", feed.url);
        Ok(feed)
    }

    /// Record first-fetch metadata. Returns `false` when the feed was
    /// already initialized, in which case nothing is written.
    pub async fn initialize_feed(&self, id: i64, data: &FeedData) -> Result<bool> {
        let mut slot = self.feed_cache.lock().await;
        let cache = self.feeds_touch(&mut slot).await?;

        let current = cache
            .get(id)
            .ok_or_else(|| AppError::not_found(format!("feed {}", id)))?;
        if current.initialized {
            return Ok(false);
        }

        let updated = current.initialized_from(data);
        validate_feed(&updated)?;
        self.persist_feed(&updated).await?;
        *slot = None;
        Ok(true)
    }

    async fn persist_feed(&self, feed: &Feed) -> Result<()> {
        let key = id_key(feed.id);
        let value = serde_json::to_vec(feed)?;
        let result = self
            .kv
            .update(move |tx| tx.put(FEEDS, &key, &value))
            .await;
        if let Err(e) = &result {
            error!(handle = %feed.handle, "failed to store feed: {}", e);
        }
        result
    }
}

fn validate_feed(feed: &Feed) -> Result<()> {
    if feed.id <= 0 {
        return Err(AppError::validation("invalid feed id"));
    }
    if feed.url.trim().is_empty() {
        return Err(AppError::validation("invalid feed url"));
    }
    if feed.handle.trim().is_empty() {
        return Err(AppError::validation("invalid feed handle"));
    }
    Ok(())
}

fn check_unique(cache: &FeedCache, feed: &Feed) -> Result<()> {
    for other in cache.feeds().iter().filter(|f| f.id != feed.id) {
        if other.url == feed.url {
            return Err(AppError::validation(format!("feed url {} already exists", feed.url)));
        }
        if other.handle == feed.handle {
            return Err(AppError::validation(format!(
                "feed handle {} already exists",
                feed.handle
            )));
        }
    }
    Ok(())
}
