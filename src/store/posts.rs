use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::db::{KvTx, Order};
use crate::error::{AppError, Result};
use crate::id::{encode_boundary, id_key};
use crate::models::Post;

use super::{cutoff, index_by_id, Store, POSTS};

/// Snapshot of every post, newest first.
#[derive(Debug, Default)]
pub struct PostCache {
    posts: Vec<Post>,
    by_id: HashMap<i64, usize>,
}

impl PostCache {
    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    pub fn get(&self, id: i64) -> Option<&Post> {
        self.by_id.get(&id).map(|&i| &self.posts[i])
    }

    /// Up to `n` posts matching `predicate`, newest first. `None` means no
    /// limit.
    pub fn filter<F>(&self, n: Option<usize>, predicate: F) -> Vec<Post>
    where
        F: Fn(&Post) -> bool,
    {
        self.posts
            .iter()
            .filter(|p| predicate(p))
            .take(n.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

#[derive(Deserialize)]
struct GuidOnly {
    guid: String,
}

fn known_guids(tx: &KvTx<'_>) -> Result<HashSet<String>> {
    let mut guids = HashSet::new();
    for (_, value) in tx.scan(POSTS, Order::Descending)? {
        match serde_json::from_slice::<GuidOnly>(&value) {
            Ok(record) => {
                guids.insert(record.guid);
            }
            Err(e) => warn!("skipping unreadable post record: {}", e),
        }
    }
    Ok(guids)
}

impl Store {
    pub async fn post_cache(&self) -> Result<Arc<PostCache>> {
        let mut slot = self.post_cache.lock().await;
        if let Some(cache) = slot.as_ref() {
            return Ok(Arc::clone(cache));
        }

        // Descending key order is newest first, since keys embed the date.
        let records = self.kv.view(|tx| tx.scan(POSTS, Order::Descending)).await?;
        let mut posts = Vec::with_capacity(records.len());
        for (_, value) in records {
            match serde_json::from_slice::<Post>(&value) {
                Ok(post) => posts.push(post),
                Err(e) => warn!("skipping unreadable post record: {}", e),
            }
        }
        let by_id = index_by_id(&posts, |p| p.id);

        let cache = Arc::new(PostCache { posts, by_id });
        *slot = Some(Arc::clone(&cache));
        Ok(cache)
    }

    async fn post_cache_invalidate(&self) {
        *self.post_cache.lock().await = None;
    }

    /// Insert-or-ignore a batch. A post is skipped when its GUID or id is
    /// already stored, when an earlier post in the batch had the same GUID,
    /// or when it is older than the retention window. Returns the number of
    /// posts written.
    pub async fn insert_posts(&self, batch: Vec<Post>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let boundary = encode_boundary(self.posts_max_age());
        let result = self
            .kv
            .update(move |tx| {
                let mut guids = known_guids(tx)?;
                let mut inserted = 0;
                for post in batch {
                    if post.id < boundary || guids.contains(&post.guid) {
                        continue;
                    }
                    let key = id_key(post.id);
                    if tx.contains(POSTS, &key)? {
                        continue;
                    }
                    tx.put(POSTS, &key, &serde_json::to_vec(&post)?)?;
                    guids.insert(post.guid);
                    inserted += 1;
                }
                Ok(inserted)
            })
            .await;

        match result {
            Ok(inserted) => {
                if inserted > 0 {
                    self.post_cache_invalidate().await;
                }
                Ok(inserted)
            }
            Err(e) => {
                error!("failed to insert posts: {}", e);
                Err(e)
            }
        }
    }

    /// GUIDs of every stored post.
    pub async fn all_guids(&self) -> Result<HashSet<String>> {
        self.kv.view(|tx| known_guids(tx)).await
    }

    pub async fn filter_posts<F>(&self, n: Option<usize>, predicate: F) -> Result<Vec<Post>>
    where
        F: Fn(&Post) -> bool,
    {
        Ok(self.post_cache().await?.filter(n, predicate))
    }

    pub async fn posts_all(&self, n: Option<usize>) -> Result<Vec<Post>> {
        self.filter_posts(n, |_| true).await
    }

    /// Posts of the feeds with the given handles.
    pub async fn posts_by_feeds(&self, n: Option<usize>, handles: &[&str]) -> Result<Vec<Post>> {
        let feeds = self.feed_cache().await?;
        let wanted: HashSet<i64> = feeds
            .feeds()
            .iter()
            .filter(|f| handles.contains(&f.handle.as_str()))
            .map(|f| f.id)
            .collect();
        self.filter_posts(n, |p| wanted.contains(&p.feed_id)).await
    }

    /// Posts older than the post with id `after`, for paging.
    pub async fn posts_all_after(&self, n: Option<usize>, after: i64) -> Result<Vec<Post>> {
        self.filter_posts(n, |p| p.id < after).await
    }

    pub async fn post_by_id(&self, id: i64) -> Result<Post> {
        self.post_cache()
            .await?
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("post {}", id)))
    }

    /// Delete every post published before `now - max_age`. Returns the
    /// number of deleted posts.
    pub async fn trim(&self, max_age: Duration) -> Result<usize> {
        let boundary = id_key(encode_boundary(cutoff(self.ids.now(), max_age)));

        let result = self
            .kv
            .update(move |tx| {
                let mut cursor = tx.cursor(POSTS);
                // Everything sorting before the boundary key is older.
                cursor.seek(&boundary)?;
                let mut trimmed = 0;
                while let Some((key, _)) = cursor.prev()? {
                    if tx.delete(POSTS, &key)? {
                        trimmed += 1;
                    }
                }
                Ok(trimmed)
            })
            .await;

        let trimmed = match result {
            Ok(n) => n,
            Err(e) => {
                error!("failed to trim posts: {}", e);
                return Err(e);
            }
        };
        info!("trimmed {} posts", trimmed);

        if trimmed > 0 {
            self.post_cache_invalidate().await;
        }
        Ok(trimmed)
    }

    /// Trim with the configured retention window.
    pub async fn trim_expired(&self) -> Result<usize> {
        self.trim(self.settings.retention).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::id::tests::ManualClock;
    use crate::id::{make_id_raw, IdGen, GENERAL_SUBSYSTEM};
    use crate::store::tests::{accept_writes, open_temp, reject_writes};
    use crate::store::StoreSettings;

    fn post(id: i64, guid: &str, feed_id: i64) -> Post {
        Post {
            id,
            title: format!("title {}", guid),
            guid: guid.to_string(),
            link: guid.to_string(),
            feed_id,
        }
    }

    fn at(t: DateTime<Utc>, seq: u16) -> i64 {
        make_id_raw(t, 256, seq)
    }

    async fn open_at(now: DateTime<Utc>, retention: Duration) -> (tempfile::TempDir, Store) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("news.db");
        let ids = Arc::new(IdGen::with_clock(GENERAL_SUBSYSTEM, ManualClock::new(now)));
        let settings = StoreSettings {
            retention,
            ..StoreSettings::default()
        };
        let store = Store::open_with_ids(path.to_str().unwrap(), settings, ids)
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_insert_or_ignore_on_guid() {
        let (_dir, store) = open_temp().await;
        let now = Utc::now();

        let inserted = store.insert_posts(vec![post(at(now, 1), "g", 1)]).await.unwrap();
        assert_eq!(inserted, 1);

        let mut again = post(at(now, 2), "g", 1);
        again.title = "replacement".into();
        let inserted = store.insert_posts(vec![again]).await.unwrap();
        assert_eq!(inserted, 0);

        let posts = store.posts_all(None).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].title, "title g");
    }

    #[tokio::test]
    async fn test_insert_ignores_known_id_and_batch_duplicates() {
        let (_dir, store) = open_temp().await;
        let now = Utc::now();
        let id = at(now, 1);

        store.insert_posts(vec![post(id, "a", 1)]).await.unwrap();
        let inserted = store
            .insert_posts(vec![post(id, "b", 1), post(at(now, 2), "c", 1), post(at(now, 3), "c", 2)])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(store.posts_all(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_insert_skips_expired() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let (_dir, store) = open_at(now, Duration::from_secs(3600)).await;

        let old = post(at(now - chrono::Duration::hours(2), 1), "old", 1);
        let fresh = post(at(now - chrono::Duration::minutes(5), 1), "fresh", 1);
        assert_eq!(store.insert_posts(vec![old, fresh]).await.unwrap(), 1);
        assert_eq!(store.posts_all(None).await.unwrap()[0].guid, "fresh");
    }

    #[tokio::test]
    async fn test_posts_newest_first_and_limited() {
        let (_dir, store) = open_temp().await;
        let now = Utc::now();
        let batch: Vec<Post> = (0..5)
            .map(|i| post(at(now - chrono::Duration::minutes(i), 0), &format!("g{}", i), 1))
            .collect();
        store.insert_posts(batch).await.unwrap();

        let guids: Vec<String> = store
            .posts_all(Some(3))
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.guid)
            .collect();
        assert_eq!(guids, vec!["g0", "g1", "g2"]);

        let all = store.posts_all(None).await.unwrap();
        assert!(all.windows(2).all(|w| w[0].date() >= w[1].date()));

        let page = store.posts_all_after(Some(10), all[1].id).await.unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].guid, "g2");
    }

    #[tokio::test]
    async fn test_posts_by_feeds_and_lookup() {
        let (_dir, store) = open_temp().await;
        let bbc = store.add_feed("bbc", "http://b/rss").await.unwrap();
        let wik = store.add_feed("wik", "http://w/rss").await.unwrap();
        let now = Utc::now();
        store
            .insert_posts(vec![
                post(at(now, 1), "b1", bbc.id),
                post(at(now, 2), "w1", wik.id),
                post(at(now, 3), "b2", bbc.id),
            ])
            .await
            .unwrap();

        let posts = store.posts_by_feeds(None, &["bbc"]).await.unwrap();
        assert_eq!(posts.len(), 2);
        assert!(posts.iter().all(|p| p.feed_id == bbc.id));
        assert!(store.posts_by_feeds(None, &["csm"]).await.unwrap().is_empty());

        let found = store.post_by_id(at(now, 2)).await.unwrap();
        assert_eq!(found.guid, "w1");
        assert!(matches!(store.post_by_id(7).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_trim_removes_only_older_posts() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let (_dir, store) = open_at(now, Duration::from_secs(10 * 24 * 3600)).await;

        let cutoff = now - chrono::Duration::hours(24);
        let batch = vec![
            post(at(cutoff - chrono::Duration::hours(5), 1), "old1", 1),
            post(at(cutoff - chrono::Duration::milliseconds(1), 4095), "old2", 1),
            post(at(cutoff, 0), "edge", 1),
            post(at(cutoff + chrono::Duration::hours(1), 1), "new1", 1),
            post(at(now, 2), "new2", 1),
        ];
        assert_eq!(store.insert_posts(batch).await.unwrap(), 5);
        // Warm the cache so the trim has something to invalidate.
        assert_eq!(store.posts_all(None).await.unwrap().len(), 5);

        let trimmed = store.trim(Duration::from_secs(24 * 3600)).await.unwrap();
        assert_eq!(trimmed, 2);

        let remaining = store.posts_all(None).await.unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().all(|p| p.date() >= cutoff));

        let guids = store.all_guids().await.unwrap();
        assert!(!guids.contains("old1") && !guids.contains("old2"));

        // Idempotent.
        assert_eq!(store.trim(Duration::from_secs(24 * 3600)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_all_guids() {
        let (_dir, store) = open_temp().await;
        let now = Utc::now();
        store
            .insert_posts(vec![post(at(now, 1), "a", 1), post(at(now, 2), "b", 1)])
            .await
            .unwrap();
        let guids = store.all_guids().await.unwrap();
        assert_eq!(guids.len(), 2);
        assert!(guids.contains("a") && guids.contains("b"));
    }

    #[tokio::test]
    async fn test_failed_insert_keeps_cache() {
        let (dir, store) = open_temp().await;
        let now = Utc::now();
        store.insert_posts(vec![post(at(now, 1), "a", 1)]).await.unwrap();
        let before = store.post_cache().await.unwrap();

        reject_writes(&dir, POSTS);
        let err = store
            .insert_posts(vec![post(at(now, 2), "b", 1)])
            .await
            .unwrap_err();
        assert!(err.is_persistence());
        assert!(Arc::ptr_eq(&before, &store.post_cache().await.unwrap()));
        assert_eq!(store.all_guids().await.unwrap(), HashSet::from(["a".to_string()]));

        accept_writes(&dir, POSTS);
        assert_eq!(store.insert_posts(vec![post(at(now, 2), "b", 1)]).await.unwrap(), 1);
        assert_eq!(store.posts_all(None).await.unwrap().len(), 2);
    }
}
