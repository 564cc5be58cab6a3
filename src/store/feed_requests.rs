use tracing::warn;
use url::Url;

use crate::db::Order;
use crate::error::{AppError, Result};
use crate::models::FeedRequest;

use super::{Store, FEED_REQUESTS};

fn validate_request_url(raw: &str) -> Result<String> {
    let url = raw.trim();
    if url.is_empty() {
        return Err(AppError::validation("invalid feed request url"));
    }
    match Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.host().is_some() => {
            Ok(url.to_string())
        }
        _ => Err(AppError::validation(format!("malformed feed request url {}", url))),
    }
}

impl Store {
    /// Count a suggestion for `url`. Repeats bump the counter of the
    /// existing request; new URLs are refused once the cap is reached.
    pub async fn feed_reqs_add(&self, url: &str) -> Result<FeedRequest> {
        let url = validate_request_url(url)?;
        let id = self.ids.make_id();
        let now = self.ids.now();
        let max = self.settings.max_feed_requests;

        self.kv
            .update(move |tx| {
                let key = url.as_bytes();
                let request = match tx.get(FEED_REQUESTS, key)? {
                    Some(encoded) => {
                        let mut request: FeedRequest = serde_json::from_slice(&encoded)?;
                        request.request_count += 1;
                        request.last_requested = now;
                        request
                    }
                    None => {
                        if tx.count(FEED_REQUESTS)? >= max {
                            return Err(AppError::capacity(format!(
                                "maximum of {} feed requests reached",
                                max
                            )));
                        }
                        FeedRequest {
                            id,
                            url: url.clone(),
                            request_count: 1,
                            last_requested: now,
                        }
                    }
                };
                tx.put(FEED_REQUESTS, key, &serde_json::to_vec(&request)?)?;
                Ok(request)
            })
            .await
    }

    /// Every feed request, most requested first.
    pub async fn feed_reqs_all(&self) -> Result<Vec<FeedRequest>> {
        let records = self
            .kv
            .view(|tx| tx.scan(FEED_REQUESTS, Order::Ascending))
            .await?;

        let mut requests: Vec<FeedRequest> = records
            .into_iter()
            .filter_map(|(_, value)| match serde_json::from_slice(&value) {
                Ok(request) => Some(request),
                Err(e) => {
                    warn!("skipping unreadable feed request: {}", e);
                    None
                }
            })
            .collect();
        requests.sort_by(|a, b| {
            b.request_count
                .cmp(&a.request_count)
                .then_with(|| b.last_requested.cmp(&a.last_requested))
        });
        Ok(requests)
    }

    pub async fn feed_reqs_remove(&self, requests: &[FeedRequest]) -> Result<()> {
        let urls: Vec<String> = requests.iter().map(|r| r.url.clone()).collect();
        self.kv
            .update(move |tx| {
                for url in &urls {
                    tx.delete(FEED_REQUESTS, url.as_bytes())?;
                }
                Ok(())
            })
            .await
    }

    pub async fn feed_reqs_remove_all(&self) -> Result<()> {
        self.kv
            .update(|tx| {
                tx.delete_bucket(FEED_REQUESTS)?;
                tx.create_bucket(FEED_REQUESTS)
            })
            .await
    }
}
