use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::KeyValueStore;

/// Store that keeps everything in memory.
/// Nothing survives the process; useful for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueStore for MemoryStore {
  fn put(&self, key: &str, value: &[u8]) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(key);
    Ok(())
  }

  fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      entries
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_list_keys_respects_prefix() {
    let store = MemoryStore::new();
    store.put("cache:a", b"1").unwrap();
    store.put("cache:b", b"2").unwrap();
    store.put("outbox", b"3").unwrap();

    assert_eq!(store.list_keys("cache:").unwrap(), vec!["cache:a", "cache:b"]);
    assert_eq!(store.list_keys("").unwrap().len(), 3);
  }

  #[test]
  fn test_remove_absent_key_is_ok() {
    let store = MemoryStore::new();
    assert!(store.remove("missing").is_ok());
    assert!(store.get("missing").unwrap().is_none());
  }
}
