//! Fetch-through cache of extracted article bodies, keyed by post link.
//!
//! Concurrent misses on the same link are coalesced: the first caller
//! fetches while later callers wait on a per-link gate and then read the
//! cached entry. A failed fetch is not shared, so a waiter retries it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::Result;
use crate::id::IdGen;
use crate::models::ArticleContent;
use crate::store::Store;

use super::ArticleFetcher;

pub const DEFAULT_CAPACITY: usize = 512;

type Gate = Arc<tokio::sync::Mutex<()>>;

/// Registration of a caller's gate in the in-flight map. Dropping it
/// removes the gate, also when the caller's future is cancelled mid-fetch.
struct InFlight<'a> {
    map: &'a Mutex<HashMap<String, Gate>>,
    url: &'a str,
    gate: Gate,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        if map.get(self.url).is_some_and(|g| Arc::ptr_eq(g, &self.gate)) {
            map.remove(self.url);
        }
    }
}

pub struct ArticleCache {
    store: Arc<Store>,
    fetcher: Arc<dyn ArticleFetcher>,
    ids: Arc<IdGen>,
    capacity: usize,
    entries: Mutex<HashMap<String, ArticleContent>>,
    in_flight: Mutex<HashMap<String, Gate>>,
}

impl ArticleCache {
    /// Entry ids come from the store's general generator.
    pub fn new(store: Arc<Store>, fetcher: Arc<dyn ArticleFetcher>, capacity: usize) -> Self {
        let ids = store.ids();
        Self {
            store,
            fetcher,
            ids,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Body text of the article behind post `post_id`.
    pub async fn get_content(&self, post_id: i64) -> Result<ArticleContent> {
        let post = self.store.post_by_id(post_id).await?;
        self.content_for_url(&post.link).await
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries().contains_key(url)
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, ArticleContent>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, url: &str) -> Option<ArticleContent> {
        self.entries().get(url).cloned()
    }

    async fn content_for_url(&self, url: &str) -> Result<ArticleContent> {
        if let Some(hit) = self.lookup(url) {
            return Ok(hit);
        }

        let in_flight = {
            let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            InFlight {
                map: &self.in_flight,
                url,
                gate: Arc::clone(map.entry(url.to_string()).or_default()),
            }
        };
        // Released before `in_flight` is dropped.
        let _guard = in_flight.gate.lock().await;

        match self.lookup(url) {
            Some(hit) => Ok(hit),
            None => {
                debug!("fetching article {}", url);
                match self.fetcher.fetch_article(url).await {
                    Ok(body) => Ok(self.insert(url, body)),
                    Err(e) => {
                        warn!("failed to fetch article {}: {}", url, e);
                        Err(e)
                    }
                }
            }
        }
    }

    fn insert(&self, url: &str, body: String) -> ArticleContent {
        let content = ArticleContent {
            id: self.ids.make_id(),
            url: url.to_string(),
            body,
        };

        let mut entries = self.entries();
        entries.insert(url.to_string(), content.clone());

        if entries.len() > self.capacity {
            let mut order: Vec<(i64, String)> = entries
                .values()
                .map(|c| (c.id, c.url.clone()))
                .collect();
            order.sort_unstable_by(|a, b| b.0.cmp(&a.0));
            for (_, url) in order.into_iter().skip(self.capacity) {
                entries.remove(&url);
            }
        }

        content
    }
}
