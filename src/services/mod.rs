mod article_cache;
mod content_fetcher;

pub use article_cache::{ArticleCache, DEFAULT_CAPACITY};
pub use content_fetcher::{extract_article, ArticleFetcher, HttpArticleFetcher};
