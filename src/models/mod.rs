mod article;
mod feed;
mod feed_request;
mod post;

pub use article::ArticleContent;
pub use feed::{Feed, FeedData, FeedItem};
pub use feed_request::FeedRequest;
pub use post::Post;
