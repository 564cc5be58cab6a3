use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id;

/// A feed item accepted into the store.
///
/// The id encodes the publish date, so `date()` is derived from it rather
/// than stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub title: String,
    pub guid: String,
    pub link: String,
    #[serde(rename = "feed")]
    pub feed_id: i64,
}

impl Post {
    pub fn date(&self) -> DateTime<Utc> {
        id::time_from_id(self.id)
    }
}
