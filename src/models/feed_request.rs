use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user suggestion for a feed to add, counted per URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRequest {
    pub id: i64,
    pub url: String,
    #[serde(rename = "n")]
    pub request_count: u32,
    #[serde(rename = "date")]
    pub last_requested: DateTime<Utc>,
}
