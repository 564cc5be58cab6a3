use rusqlite::{params, Connection as SqliteConnection, OptionalExtension, Params, TransactionBehavior};
use tokio_rusqlite::Connection;

use crate::error::Result;

use super::schema::SCHEMA;

pub type Entry = (Vec<u8>, Vec<u8>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// Embedded ordered key-value store with named buckets.
///
/// Every `view`/`update` closure runs inside one SQLite transaction on the
/// connection thread. An `update` closure that returns `Err` rolls back.
pub struct KvStore {
    conn: Connection,
}

impl KvStore {
    pub async fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    pub async fn view<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&KvTx<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let result = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
                // Dropping the transaction rolls it back; reads never commit.
                Ok(f(&KvTx { conn: &*tx }))
            })
            .await?;
        result
    }

    pub async fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&KvTx<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let result = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let result = f(&KvTx { conn: &*tx });
                if result.is_ok() {
                    tx.commit()?;
                }
                Ok(result)
            })
            .await?;
        result
    }
}

/// Handle to the store inside one transaction.
pub struct KvTx<'a> {
    conn: &'a SqliteConnection,
}

impl<'a> KvTx<'a> {
    pub fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO buckets (name) VALUES (?1)",
            params![bucket],
        )?;
        Ok(())
    }

    pub fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM buckets WHERE name = ?1",
                params![bucket],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv WHERE bucket = ?1", params![bucket])?;
        self.conn
            .execute("DELETE FROM buckets WHERE name = ?1", params![bucket])?;
        Ok(())
    }

    pub fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self
            .conn
            .prepare_cached("SELECT value FROM kv WHERE bucket = ?1 AND key = ?2")?
            .query_row(params![bucket, key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn contains(&self, bucket: &str, key: &[u8]) -> Result<bool> {
        let found = self
            .conn
            .prepare_cached("SELECT 1 FROM kv WHERE bucket = ?1 AND key = ?2")?
            .query_row(params![bucket, key], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.conn
            .prepare_cached(
                r#"INSERT INTO kv (bucket, key, value) VALUES (?1, ?2, ?3)
                   ON CONFLICT(bucket, key) DO UPDATE SET value = excluded.value"#,
            )?
            .execute(params![bucket, key, value])?;
        Ok(())
    }

    pub fn delete(&self, bucket: &str, key: &[u8]) -> Result<bool> {
        let n = self
            .conn
            .prepare_cached("DELETE FROM kv WHERE bucket = ?1 AND key = ?2")?
            .execute(params![bucket, key])?;
        Ok(n > 0)
    }

    pub fn count(&self, bucket: &str) -> Result<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM kv WHERE bucket = ?1",
            params![bucket],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// All entries of a bucket in key order.
    pub fn scan(&self, bucket: &str, order: Order) -> Result<Vec<Entry>> {
        let sql = match order {
            Order::Ascending => "SELECT key, value FROM kv WHERE bucket = ?1 ORDER BY key ASC",
            Order::Descending => "SELECT key, value FROM kv WHERE bucket = ?1 ORDER BY key DESC",
        };
        let mut stmt = self.conn.prepare_cached(sql)?;
        let entries = stmt
            .query_map(params![bucket], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn cursor(&self, bucket: &str) -> Cursor<'_> {
        Cursor {
            conn: self.conn,
            bucket: bucket.to_string(),
            position: None,
        }
    }
}

/// Positioned walk over one bucket.
///
/// After `seek(k)` the cursor sits at `k` even when no such key exists, so
/// `prev()` yields the greatest key below `k` and `next()` the smallest key
/// above it.
pub struct Cursor<'a> {
    conn: &'a SqliteConnection,
    bucket: String,
    position: Option<Vec<u8>>,
}

impl<'a> Cursor<'a> {
    pub fn first(&mut self) -> Result<Option<Entry>> {
        let entry = self.query(
            "SELECT key, value FROM kv WHERE bucket = ?1 ORDER BY key ASC LIMIT 1",
            params![self.bucket],
        )?;
        self.settle(entry)
    }

    /// Move to the first key `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<Entry>> {
        let entry = self.query(
            "SELECT key, value FROM kv WHERE bucket = ?1 AND key >= ?2 ORDER BY key ASC LIMIT 1",
            params![self.bucket, key],
        )?;
        self.position = Some(key.to_vec());
        self.settle(entry)
    }

    pub fn next(&mut self) -> Result<Option<Entry>> {
        let Some(position) = self.position.clone() else {
            return Ok(None);
        };
        let entry = self.query(
            "SELECT key, value FROM kv WHERE bucket = ?1 AND key > ?2 ORDER BY key ASC LIMIT 1",
            params![self.bucket, position],
        )?;
        self.settle(entry)
    }

    pub fn prev(&mut self) -> Result<Option<Entry>> {
        let Some(position) = self.position.clone() else {
            return Ok(None);
        };
        let entry = self.query(
            "SELECT key, value FROM kv WHERE bucket = ?1 AND key < ?2 ORDER BY key DESC LIMIT 1",
            params![self.bucket, position],
        )?;
        self.settle(entry)
    }

    fn query<P: Params>(&self, sql: &str, params: P) -> Result<Option<Entry>> {
        let entry = self
            .conn
            .prepare_cached(sql)?
            .query_row(params, |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        Ok(entry)
    }

    fn settle(&mut self, entry: Option<Entry>) -> Result<Option<Entry>> {
        if let Some((key, _)) = &entry {
            self.position = Some(key.clone());
        }
        Ok(entry)
    }
}
