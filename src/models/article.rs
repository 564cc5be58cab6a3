/// Extracted body text of an article, keyed by its source URL.
///
/// `id` comes from the general generator and only orders eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleContent {
    pub id: i64,
    pub url: String,
    pub body: String,
}
