use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, Result};
use crate::feed::FeedSource;
use crate::id::{IdGen, CRAWL_SUBSYSTEM_BASE, MAX_SUBSYSTEMS};
use crate::models::{Feed, FeedItem, Post};
use crate::store::Store;

use super::{Running, StopSignal};

/// Every concurrently polled feed needs its own id subsystem.
pub const MAX_CONCURRENT_FEEDS: usize = (MAX_SUBSYSTEMS - CRAWL_SUBSYSTEM_BASE) as usize;

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    /// Delay between `start` and the first cycle.
    pub warmup: Duration,
    /// Time from the start of one cycle to the start of the next.
    pub interval: Duration,
    pub max_feeds: usize,
    pub channel_capacity: usize,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(2),
            interval: Duration::from_secs(5 * 60),
            max_feeds: MAX_CONCURRENT_FEEDS,
            channel_capacity: 256,
        }
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub feeds: usize,
    pub failed: usize,
    pub candidates: usize,
    pub inserted: usize,
}

/// Polls every feed concurrently on a fixed interval and stores new posts.
pub struct CrawlScheduler {
    crawl: Arc<Crawl>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl CrawlScheduler {
    pub fn new(store: Arc<Store>, source: Arc<dyn FeedSource>, settings: CrawlSettings) -> Self {
        let settings = CrawlSettings {
            max_feeds: settings.max_feeds.min(MAX_CONCURRENT_FEEDS),
            channel_capacity: settings.channel_capacity.max(1),
            ..settings
        };
        Self {
            crawl: Arc::new(Crawl {
                store,
                source,
                settings,
                seen: Mutex::new(Arc::new(HashSet::new())),
                worker_ids: Mutex::new(Vec::new()),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Load the seen-set from the store and launch the polling loop.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(Running::is_alive) {
            return Err(AppError::AlreadyRunning);
        }

        self.crawl.sync_seen().await?;

        let crawl = Arc::clone(&self.crawl);
        *running = Some(Running::spawn(move |stop| crawl.run(stop)));
        info!("crawler started");
        Ok(())
    }

    /// Ask the loop to exit at its next wait point and wait for it. A cycle
    /// in progress runs to completion.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.shutdown().await;
            info!("crawler stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(Running::is_alive)
    }

    /// Run a single poll cycle right away.
    pub async fn poll_once(&self) -> Result<CycleReport> {
        self.crawl.poll_once().await
    }
}

struct Crawl {
    store: Arc<Store>,
    source: Arc<dyn FeedSource>,
    settings: CrawlSettings,
    // GUIDs known to be stored. Accumulates for the life of the process.
    seen: Mutex<Arc<HashSet<String>>>,
    worker_ids: Mutex<Vec<Arc<IdGen>>>,
}

impl Crawl {
    async fn run(self: Arc<Self>, mut stop: StopSignal) {
        if stop.stopped_before(Instant::now() + self.settings.warmup).await {
            return;
        }

        loop {
            let next = Instant::now() + self.settings.interval;
            match self.poll_once().await {
                Ok(report) => info!(
                    feeds = report.feeds,
                    failed = report.failed,
                    "{} new posts",
                    report.inserted
                ),
                Err(e) => error!("crawl cycle failed: {}", e),
            }
            if stop.stopped_before(next).await {
                break;
            }
        }
    }

    async fn sync_seen(&self) -> Result<()> {
        let guids = self.store.all_guids().await?;
        debug!("loaded {} known guids", guids.len());
        *self.seen.lock().unwrap_or_else(|e| e.into_inner()) = Arc::new(guids);
        Ok(())
    }

    fn seen_snapshot(&self) -> Arc<HashSet<String>> {
        Arc::clone(&self.seen.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn merge_seen(&self, fresh: HashSet<String>) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        Arc::make_mut(&mut seen).extend(fresh);
    }

    /// Generator for worker slot `i`, kept across cycles so sequences carry on.
    fn worker_ids(&self, i: usize) -> Arc<IdGen> {
        let mut ids = self.worker_ids.lock().unwrap_or_else(|e| e.into_inner());
        while ids.len() <= i {
            let subsystem = CRAWL_SUBSYSTEM_BASE + ids.len() as u16;
            ids.push(Arc::new(IdGen::new(subsystem)));
        }
        Arc::clone(&ids[i])
    }

    async fn poll_once(&self) -> Result<CycleReport> {
        let mut feeds = self.store.feeds_all().await?;
        if feeds.len() > self.settings.max_feeds {
            warn!(
                "too many feeds ({}), polling only the first {}",
                feeds.len(),
                self.settings.max_feeds
            );
            feeds.truncate(self.settings.max_feeds);
        }

        let seen = self.seen_snapshot();
        let max_age = self.store.posts_max_age();
        let (tx, mut rx) = mpsc::channel(self.settings.channel_capacity);

        let mut workers = JoinSet::new();
        let polled = feeds.len();
        for (i, feed) in feeds.into_iter().enumerate() {
            let worker = Worker {
                feed,
                ids: self.worker_ids(i),
                store: Arc::clone(&self.store),
                source: Arc::clone(&self.source),
                seen: Arc::clone(&seen),
                max_age,
                posts: tx.clone(),
            };
            workers.spawn(worker.run());
        }
        drop(seen);
        // The channel closes once every worker has dropped its sender.
        drop(tx);

        let mut batch = Vec::new();
        let mut fresh = HashSet::new();
        while let Some(post) = rx.recv().await {
            fresh.insert(post.guid.clone());
            batch.push(post);
        }

        let mut failed = 0;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(true) => {}
                Ok(false) => failed += 1,
                Err(e) => {
                    error!("crawl worker panicked: {}", e);
                    failed += 1;
                }
            }
        }

        let candidates = batch.len();
        let inserted = self.store.insert_posts(batch).await?;
        // Only after the write, so a failed insert is retried next cycle.
        self.merge_seen(fresh);

        Ok(CycleReport {
            feeds: polled,
            failed,
            candidates,
            inserted,
        })
    }
}

/// Polls one feed for one cycle.
struct Worker {
    feed: Feed,
    ids: Arc<IdGen>,
    store: Arc<Store>,
    source: Arc<dyn FeedSource>,
    seen: Arc<HashSet<String>>,
    max_age: DateTime<Utc>,
    posts: mpsc::Sender<Post>,
}

impl Worker {
    /// Returns `false` when the feed could not be fetched.
    async fn run(self) -> bool {
        let handle = self.feed.handle.as_str();

        let data = match self.source.fetch(&self.feed.url).await {
            Ok(data) => data,
            Err(e) if e.is_transient() => {
                warn!(handle, "failed to fetch feed: {}", e);
                return false;
            }
            Err(e) => {
                error!(handle, "failed to fetch feed: {}", e);
                return false;
            }
        };

        if !self.feed.initialized {
            match self.store.initialize_feed(self.feed.id, &data).await {
                Ok(true) => info!(handle, "initialized feed \"{}\"", data.title),
                Ok(false) => {}
                Err(e) => error!(handle, "failed to initialize feed: {}", e),
            }
        }

        let mut emitted = 0;
        for item in data.items {
            let Some(post) = self.candidate(item) else {
                continue;
            };
            if self.posts.send(post).await.is_err() {
                break;
            }
            emitted += 1;
        }
        debug!(handle, "{} candidate posts", emitted);
        true
    }

    fn candidate(&self, item: FeedItem) -> Option<Post> {
        let link = item.link.trim();
        if link.is_empty() || self.seen.contains(link) {
            return None;
        }

        // Missing or zero dates count as "now" and are never stale.
        let date = item
            .published
            .filter(|d| d.timestamp_millis() > 0)
            .unwrap_or_else(|| self.ids.now());
        if date < self.max_age {
            return None;
        }

        Some(Post {
            id: self.ids.make_id_from_timestamp(date),
            title: item.title,
            guid: link.to_string(),
            link: link.to_string(),
            feed_id: self.feed.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::id::subsystem_of;
    use crate::models::FeedData;
    use crate::store::tests::{accept_writes, open_temp, reject_writes};

    #[derive(Default)]
    struct StubSource {
        feeds: HashMap<String, FeedData>,
        delays: HashMap<String, Duration>,
        calls: AtomicUsize,
    }

    impl StubSource {
        fn with(mut self, url: &str, data: FeedData) -> Self {
            self.feeds.insert(url.to_string(), data);
            self
        }

        fn slow(mut self, url: &str, delay: Duration) -> Self {
            self.delays.insert(url.to_string(), delay);
            self
        }
    }

    #[async_trait]
    impl FeedSource for StubSource {
        async fn fetch(&self, url: &str) -> Result<FeedData> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delays.get(url) {
                tokio::time::sleep(*delay).await;
            }
            self.feeds
                .get(url)
                .cloned()
                .ok_or_else(|| AppError::fetch(url, "connection refused"))
        }
    }

    fn item(link: &str, published: Option<DateTime<Utc>>) -> FeedItem {
        FeedItem {
            title: format!("about {}", link),
            link: link.to_string(),
            published,
        }
    }

    fn data(items: Vec<FeedItem>) -> FeedData {
        FeedData {
            title: "BBC News".into(),
            homepage_link: "http://x/".into(),
            image_url: "http://x/logo.png".into(),
            items,
        }
    }

    fn settings() -> CrawlSettings {
        CrawlSettings {
            warmup: Duration::ZERO,
            interval: Duration::from_secs(3600),
            ..CrawlSettings::default()
        }
    }

    #[tokio::test]
    async fn test_cycle_skips_seen_guid() {
        let (_dir, store) = open_temp().await;
        let store = Arc::new(store);
        store.add_feed("bbc", "http://x/rss").await.unwrap();

        let now = Utc::now();
        let source = StubSource::default().with(
            "http://x/rss",
            data(vec![
                item("http://x/1", Some(now)),
                item("http://x/2", Some(now - chrono::Duration::minutes(3))),
                item("http://x/old-news", Some(now)),
            ]),
        );
        let crawler = CrawlScheduler::new(Arc::clone(&store), Arc::new(source), settings());
        crawler
            .crawl
            .merge_seen(HashSet::from(["http://x/old-news".to_string()]));

        let report = crawler.poll_once().await.unwrap();
        assert_eq!(report.feeds, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.candidates, 2);
        assert_eq!(report.inserted, 2);

        let posts = store.posts_by_feeds(None, &["bbc"]).await.unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].guid, "http://x/1");
        assert!(posts.iter().all(|p| subsystem_of(p.id) == CRAWL_SUBSYSTEM_BASE));
    }

    #[tokio::test]
    async fn test_first_fetch_initializes_feed() {
        let (_dir, store) = open_temp().await;
        let store = Arc::new(store);
        let feed = store.add_feed("bbc", "http://x/rss").await.unwrap();
        let source = StubSource::default().with("http://x/rss", data(vec![]));
        let crawler = CrawlScheduler::new(Arc::clone(&store), Arc::new(source), settings());

        crawler.poll_once().await.unwrap();
        let stored = store.feed_by_id(feed.id).await.unwrap();
        assert!(stored.initialized);
        assert_eq!(stored.title, "BBC News");
        assert_eq!(stored.link, "http://x/");
        assert_eq!(stored.image_url, "http://x/logo.png");
    }

    #[tokio::test]
    async fn test_failed_feed_does_not_block_others() {
        let (_dir, store) = open_temp().await;
        let store = Arc::new(store);
        store.add_feed("bbc", "http://x/rss").await.unwrap();
        store.add_feed("dead", "http://dead/rss").await.unwrap();
        let source = StubSource::default().with(
            "http://x/rss",
            data(vec![item("http://x/1", Some(Utc::now()))]),
        );
        let crawler = CrawlScheduler::new(Arc::clone(&store), Arc::new(source), settings());

        let report = crawler.poll_once().await.unwrap();
        assert_eq!(report.feeds, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.inserted, 1);
    }

    #[tokio::test]
    async fn test_stale_and_undated_items() {
        let (_dir, store) = open_temp().await;
        let store = Arc::new(store);
        store.add_feed("bbc", "http://x/rss").await.unwrap();
        let stale = Utc::now() - chrono::Duration::days(30);
        let source = StubSource::default().with(
            "http://x/rss",
            data(vec![
                item("http://x/stale", Some(stale)),
                item("http://x/undated", None),
                item("http://x/zero", Some(DateTime::UNIX_EPOCH)),
                item("   ", Some(Utc::now())),
            ]),
        );
        let crawler = CrawlScheduler::new(Arc::clone(&store), Arc::new(source), settings());

        let report = crawler.poll_once().await.unwrap();
        assert_eq!(report.inserted, 2);
        let posts = store.posts_all(None).await.unwrap();
        let cutoff = Utc::now() - chrono::Duration::minutes(1);
        assert!(posts.iter().all(|p| p.date() > cutoff));
        assert!(posts.iter().all(|p| p.guid != "http://x/stale"));
    }

    #[tokio::test]
    async fn test_seen_set_accumulates_across_cycles() {
        let (_dir, store) = open_temp().await;
        let store = Arc::new(store);
        store.add_feed("bbc", "http://x/rss").await.unwrap();
        let source = StubSource::default().with(
            "http://x/rss",
            data(vec![item("http://x/1", Some(Utc::now()))]),
        );
        let crawler = CrawlScheduler::new(Arc::clone(&store), Arc::new(source), settings());

        assert_eq!(crawler.poll_once().await.unwrap().candidates, 1);
        assert_eq!(crawler.poll_once().await.unwrap().candidates, 0);
        assert_eq!(crawler.poll_once().await.unwrap().candidates, 0);
        assert_eq!(store.posts_all(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_feed_count_capped() {
        let (_dir, store) = open_temp().await;
        let store = Arc::new(store);
        for i in 0..3 {
            store
                .add_feed(&format!("f{}", i), &format!("http://f{}/rss", i))
                .await
                .unwrap();
        }
        let source = Arc::new(StubSource::default());
        let crawler = CrawlScheduler::new(
            Arc::clone(&store),
            source.clone(),
            CrawlSettings {
                max_feeds: 2,
                ..settings()
            },
        );

        let report = crawler.poll_once().await.unwrap();
        assert_eq!(report.feeds, 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_worker_subsystems_distinct() {
        let (_dir, store) = open_temp().await;
        let crawler = CrawlScheduler::new(
            Arc::new(store),
            Arc::new(StubSource::default()),
            settings(),
        );
        let a = crawler.crawl.worker_ids(0);
        let b = crawler.crawl.worker_ids(5);
        assert_eq!(a.subsystem(), CRAWL_SUBSYSTEM_BASE);
        assert_eq!(b.subsystem(), CRAWL_SUBSYSTEM_BASE + 5);
        assert!(Arc::ptr_eq(&a, &crawler.crawl.worker_ids(0)));
        assert_eq!(MAX_CONCURRENT_FEEDS, 768);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (_dir, store) = open_temp().await;
        let store = Arc::new(store);
        store.add_feed("bbc", "http://x/rss").await.unwrap();
        let source = Arc::new(StubSource::default().with(
            "http://x/rss",
            data(vec![item("http://x/1", Some(Utc::now()))]),
        ));
        let crawler = CrawlScheduler::new(Arc::clone(&store), source.clone(), settings());

        crawler.start().await.unwrap();
        assert!(crawler.is_running().await);
        assert!(matches!(crawler.start().await, Err(AppError::AlreadyRunning)));

        // The first cycle runs right away with no warm-up.
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.posts_all(None).await.unwrap().is_empty() {
            assert!(Instant::now() < deadline, "first cycle never stored posts");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::timeout(Duration::from_secs(5), crawler.stop())
            .await
            .unwrap();
        assert!(!crawler.is_running().await);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_seeds_seen_from_store() {
        let (_dir, store) = open_temp().await;
        let store = Arc::new(store);
        store.add_feed("bbc", "http://x/rss").await.unwrap();
        store
            .insert_posts(vec![Post {
                id: crate::id::make_id_raw(Utc::now(), 300, 1),
                title: "known".into(),
                guid: "http://x/1".into(),
                link: "http://x/1".into(),
                feed_id: 1,
            }])
            .await
            .unwrap();

        let source = StubSource::default().with(
            "http://x/rss",
            data(vec![item("http://x/1", Some(Utc::now()))]),
        );
        let crawler = CrawlScheduler::new(
            Arc::clone(&store),
            Arc::new(source),
            CrawlSettings {
                warmup: Duration::from_secs(3600),
                ..settings()
            },
        );
        crawler.start().await.unwrap();
        assert_eq!(crawler.poll_once().await.unwrap().candidates, 0);
        crawler.stop().await;
    }

    async fn wait_for_calls(source: &StubSource, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while source.calls.load(Ordering::SeqCst) < n {
            assert!(Instant::now() < deadline, "fetches never started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_stop_lets_cycle_finish() {
        let (_dir, store) = open_temp().await;
        let store = Arc::new(store);
        store.add_feed("bbc", "http://x/rss").await.unwrap();
        let source = Arc::new(
            StubSource::default()
                .with("http://x/rss", data(vec![item("http://x/1", Some(Utc::now()))]))
                .slow("http://x/rss", Duration::from_millis(300)),
        );
        let crawler = CrawlScheduler::new(Arc::clone(&store), source.clone(), settings());

        crawler.start().await.unwrap();
        wait_for_calls(&source, 1).await;
        assert!(store.posts_all(None).await.unwrap().is_empty());

        tokio::time::timeout(Duration::from_secs(5), crawler.stop())
            .await
            .unwrap();
        assert_eq!(store.posts_all(None).await.unwrap().len(), 1);
        assert!(!crawler.is_running().await);
    }

    #[tokio::test]
    async fn test_cycle_writes_once_all_workers_finish() {
        let (_dir, store) = open_temp().await;
        let store = Arc::new(store);
        store.add_feed("fast", "http://fast/rss").await.unwrap();
        store.add_feed("slow", "http://slow/rss").await.unwrap();
        let now = Utc::now();
        let source = Arc::new(
            StubSource::default()
                .with("http://fast/rss", data(vec![item("http://fast/1", Some(now))]))
                .with("http://slow/rss", data(vec![item("http://slow/1", Some(now))]))
                .slow("http://slow/rss", Duration::from_millis(300)),
        );
        let crawler = Arc::new(CrawlScheduler::new(
            Arc::clone(&store),
            source.clone(),
            settings(),
        ));

        let cycle = {
            let crawler = Arc::clone(&crawler);
            tokio::spawn(async move { crawler.poll_once().await })
        };
        wait_for_calls(&source, 2).await;
        // The fast feed is done by now, yet nothing is written before the
        // slow one reports.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.posts_all(None).await.unwrap().is_empty());

        let report = cycle.await.unwrap().unwrap();
        assert_eq!(report.candidates, 2);
        assert_eq!(report.inserted, 2);
        assert_eq!(store.posts_by_feeds(None, &["fast"]).await.unwrap().len(), 1);
        assert_eq!(store.posts_by_feeds(None, &["slow"]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_insert_not_marked_seen() {
        let (dir, store) = open_temp().await;
        let store = Arc::new(store);
        store.add_feed("bbc", "http://x/rss").await.unwrap();
        let source = StubSource::default().with(
            "http://x/rss",
            data(vec![item("http://x/1", Some(Utc::now()))]),
        );
        let crawler = CrawlScheduler::new(Arc::clone(&store), Arc::new(source), settings());

        reject_writes(&dir, "posts");
        let err = crawler.poll_once().await.unwrap_err();
        assert!(err.is_persistence());
        assert!(!crawler.crawl.seen_snapshot().contains("http://x/1"));

        accept_writes(&dir, "posts");
        let report = crawler.poll_once().await.unwrap();
        assert_eq!(report.inserted, 1);
        assert!(crawler.crawl.seen_snapshot().contains("http://x/1"));
    }
}
