mod kv;
mod schema;

pub use kv::{Cursor, Entry, KvStore, KvTx, Order};
