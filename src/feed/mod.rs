mod fetcher;

pub use fetcher::{FeedFetcher, FeedSource};
