use std::sync::Arc;

use anyhow::{bail, Context};
use tracing_subscriber::EnvFilter;

use news_ingest::feed::FeedFetcher;
use news_ingest::services::HttpArticleFetcher;
use news_ingest::{ArticleCache, Config, CrawlScheduler, Store, TrimScheduler};

const USAGE: &str = "usage: news-ingest [--add-feed <handle> <url> | --request <url> | --backup | --poll | --article <post-id>]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let store = Arc::new(
        Store::open(&config.db_path, config.store_settings())
            .await
            .with_context(|| format!("failed to open database {}", config.db_path))?,
    );

    match args.as_slice() {
        ["--add-feed", handle, url] => {
            let feed = store.add_feed(handle, url).await?;
            println!("Added feed {} ({})", feed.handle, feed.id);
        }
        ["--request", url] => {
            let request = store.feed_reqs_add(url).await?;
            println!("Requested {} ({} times)", request.url, request.request_count);
        }
        ["--backup"] => {
            let backup = store.export().await?;
            println!("{}", serde_json::to_string_pretty(&backup)?);
        }
        ["--poll"] => {
            let crawler = crawler(&config, &store)?;
            let report = crawler.poll_once().await?;
            println!(
                "Polled {} feeds ({} failed), stored {} of {} new posts",
                report.feeds, report.failed, report.inserted, report.candidates
            );
        }
        ["--article", id] => {
            let id: i64 = id.parse().context("post id must be an integer")?;
            let fetcher = HttpArticleFetcher::new(&config.user_agent, config.http_timeout())?;
            let cache = ArticleCache::new(
                Arc::clone(&store),
                Arc::new(fetcher),
                config.article_cache_capacity,
            );
            let content = cache.get_content(id).await?;
            println!("{}\n\n{}", content.url, content.body);
        }
        [] => run(&config, store).await?,
        _ => bail!(USAGE),
    }

    Ok(())
}

fn crawler(config: &Config, store: &Arc<Store>) -> anyhow::Result<CrawlScheduler> {
    let source = FeedFetcher::new(&config.user_agent, config.http_timeout())?;
    Ok(CrawlScheduler::new(
        Arc::clone(store),
        Arc::new(source),
        config.crawl_settings(),
    ))
}

/// Crawl and trim in the background until Ctrl-C.
async fn run(config: &Config, store: Arc<Store>) -> anyhow::Result<()> {
    let crawler = crawler(config, &store)?;
    let trimmer = TrimScheduler::new(Arc::clone(&store), config.trim_interval());

    crawler.start().await.context("failed to start crawler")?;
    trimmer.start().await.context("failed to start trimmer")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutting down");

    crawler.stop().await;
    trimmer.stop().await;
    Ok(())
}
