use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::Client;

use crate::error::{AppError, Result};

/// Fetches a page and reduces it to readable body text.
#[async_trait]
pub trait ArticleFetcher: Send + Sync {
    async fn fetch_article(&self, url: &str) -> Result<String>;
}

pub struct HttpArticleFetcher {
    client: Client,
}

impl HttpArticleFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"));
        let user_agent = HeaderValue::from_str(user_agent)
            .map_err(|e| AppError::Config(format!("invalid user agent: {}", e)))?;
        headers.insert(USER_AGENT, user_agent);

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArticleFetcher for HttpArticleFetcher {
    async fn fetch_article(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(AppError::fetch(url, format!("HTTP {}", response.status())));
        }

        let html = response.text().await?;
        extract_article(&html).map_err(|e| AppError::fetch(url, e))
    }
}

/// Extract readable text from an HTML document.
pub fn extract_article(html: &str) -> std::result::Result<String, String> {
    let text = html2text::from_read(html.as_bytes(), 80)
        .map_err(|e| format!("failed to convert HTML to text: {}", e))?;

    // Clean up the text - remove excessive whitespace
    let cleaned: String = text
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    if cleaned.is_empty() {
        return Err("no readable content".to_string());
    }
    Ok(cleaned)
}
