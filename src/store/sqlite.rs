//! SQLite implementation of the key-value store.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::KeyValueStore;

/// SQLite-based durable store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offsync").join("offsync.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

    Ok(())
  }
}

/// Single-row upserts are atomic under SQLite's rollback journal.
const SCHEMA: &str = r#"
PRAGMA synchronous = FULL;

CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueStore for SqliteStore {
  fn put(&self, key: &str, value: &[u8]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv (key, value, written_at) VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| describe_write_error(key, e))?;

    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv WHERE key = ?", params![key])
      .map_err(|e| describe_write_error(key, e))?;

    Ok(())
  }

  fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // substr comparison instead of LIKE: keys may contain % and _
    let mut stmt = conn
      .prepare("SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![prefix], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }
}

fn describe_write_error(key: &str, e: rusqlite::Error) -> color_eyre::Report {
  match e.sqlite_error_code() {
    Some(ErrorCode::DiskFull) => eyre!("Storage full while writing {}", key),
    _ => eyre!("Failed to write {}: {}", key, e),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store.put("outbox", br#"{"pending":[]}"#).unwrap();
      store.put("cache:abc", b"payload").unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(
      store.get("outbox").unwrap().as_deref(),
      Some(&br#"{"pending":[]}"#[..])
    );
    assert_eq!(store.list_keys("cache:").unwrap(), vec!["cache:abc"]);
  }

  #[test]
  fn test_put_overwrites_and_remove_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("kv.db")).unwrap();

    store.put("k", b"one").unwrap();
    store.put("k", b"two").unwrap();
    assert_eq!(store.get("k").unwrap(), Some(b"two".to_vec()));

    store.remove("k").unwrap();
    assert!(store.get("k").unwrap().is_none());
    store.remove("k").unwrap();
  }

  #[test]
  fn test_list_keys_treats_wildcards_literally() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("kv.db")).unwrap();

    store.put("cache_%x", b"1").unwrap();
    store.put("cacheAy", b"2").unwrap();

    assert_eq!(store.list_keys("cache_%").unwrap(), vec!["cache_%x"]);
  }
}
