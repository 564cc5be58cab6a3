pub const SCHEMA: &str = r#"
-- registered namespaces
CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY
) WITHOUT ROWID;

-- ordered records; BLOB keys compare with memcmp, so key order is byte order
CREATE TABLE IF NOT EXISTS kv (
    bucket TEXT NOT NULL,
    key BLOB NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (bucket, key)
) WITHOUT ROWID;
"#;
