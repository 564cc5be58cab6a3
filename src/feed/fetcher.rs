use std::time::Duration;

use async_trait::async_trait;
use feed_rs::model::Feed as ParsedFeed;
use feed_rs::parser;
use reqwest::Client;

use crate::error::{AppError, Result};
use crate::models::{FeedData, FeedItem};

/// Something that can fetch and parse a feed document.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FeedData>;
}

pub struct FeedFetcher {
    client: Client,
}

impl FeedFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(user_agent)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl FeedSource for FeedFetcher {
    async fn fetch(&self, url: &str) -> Result<FeedData> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(AppError::fetch(url, format!("HTTP {}", response.status())));
        }

        let bytes = response.bytes().await?;
        let feed = parser::parse(&bytes[..])?;

        Ok(feed_data(feed))
    }
}

fn feed_data(feed: ParsedFeed) -> FeedData {
    let items = feed
        .entries
        .into_iter()
        .map(|entry| FeedItem {
            title: entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string()),
            link: entry
                .links
                .first()
                .map(|l| l.href.clone())
                .unwrap_or_default(),
            published: entry.published.or(entry.updated),
        })
        .collect();

    FeedData {
        title: feed.title.map(|t| t.content).unwrap_or_default(),
        homepage_link: feed
            .links
            .iter()
            .find(|l| l.rel.as_deref() != Some("self"))
            .or_else(|| feed.links.first())
            .map(|l| l.href.clone())
            .unwrap_or_default(),
        image_url: feed
            .logo
            .or(feed.icon)
            .map(|image| image.uri)
            .unwrap_or_default(),
        items,
    }
}
