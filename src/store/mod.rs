//! Durable key-value storage.
//!
//! Every other component of the core persists through [`KeyValueStore`]: opaque
//! byte blobs keyed by string. Writes are atomic per key and errors are always
//! reported back to the caller.

mod memory;
mod sqlite;

use color_eyre::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Trait for durable storage backends.
pub trait KeyValueStore: Send + Sync {
  /// Store a value, replacing any previous value for `key`.
  fn put(&self, key: &str, value: &[u8]) -> Result<()>;

  /// Get the value stored under `key`.
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Remove `key`. Removing an absent key is not an error.
  fn remove(&self, key: &str) -> Result<()>;

  /// List all keys starting with `prefix`, in lexical order.
  fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}
