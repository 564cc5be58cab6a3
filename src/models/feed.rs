use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A syndication source. `id`, `handle` and `url` are each unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub id: i64,
    #[serde(default)]
    pub initialized: bool,
    pub handle: String,
    #[serde(default)]
    pub title: String,
    /// Homepage of the site publishing the feed.
    #[serde(default)]
    pub link: String,
    pub url: String,
    #[serde(default)]
    pub image_url: String,
}

impl Feed {
    pub fn new(id: i64, handle: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id,
            initialized: false,
            handle: handle.into(),
            title: String::new(),
            link: String::new(),
            url: url.into(),
            image_url: String::new(),
        }
    }

    /// Copy of this feed carrying the metadata of its first successful fetch.
    pub fn initialized_from(&self, data: &FeedData) -> Self {
        Self {
            id: self.id,
            initialized: true,
            handle: self.handle.clone(),
            title: data.title.clone(),
            link: data.homepage_link.clone(),
            url: self.url.clone(),
            image_url: data.image_url.clone(),
        }
    }
}

/// Result of fetching and parsing a feed document.
#[derive(Debug, Clone, Default)]
pub struct FeedData {
    pub title: String,
    pub homepage_link: String,
    pub image_url: String,
    pub items: Vec<FeedItem>,
}

#[derive(Debug, Clone, Default)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub published: Option<DateTime<Utc>>,
}
