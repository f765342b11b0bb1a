//! Response cache for read requests.
//!
//! Entries live under `cache:<sha256 of resource key>` in the durable store and
//! carry their capture time. Anything older than the freshness window is
//! logically absent and gets purged the moment it is looked at.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::store::KeyValueStore;
use crate::transport::Request;

pub const CACHE_PREFIX: &str = "cache:";

/// Query parameters that only bust HTTP caches and would fragment ours.
pub const DEFAULT_IGNORED_PARAMS: &[&str] = &["_", "t", "ts", "timestamp", "nocache"];

/// A captured read response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
  /// Canonical resource key (method + normalized target)
  pub key: String,
  pub payload: Value,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
    now - self.stored_at > window
  }
}

pub struct ResponseCache<S: KeyValueStore> {
  storage: Arc<S>,
  clock: Arc<dyn Clock>,
  /// How long a captured response may be served
  freshness: Duration,
  ignored_params: Vec<String>,
}

impl<S: KeyValueStore> ResponseCache<S> {
  pub fn new(storage: Arc<S>) -> Self {
    Self {
      storage,
      clock: Arc::new(SystemClock),
      freshness: Duration::hours(24),
      ignored_params: DEFAULT_IGNORED_PARAMS.iter().map(|p| p.to_string()).collect(),
    }
  }

  pub fn with_freshness_window(mut self, window: Duration) -> Self {
    self.freshness = window;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_ignored_params(mut self, params: Vec<String>) -> Self {
    self.ignored_params = params;
    self
  }

  pub fn freshness_window(&self) -> Duration {
    self.freshness
  }

  /// Stable key for the resource a request reads.
  ///
  /// Trailing slashes and cache-busting query parameters are dropped and the
  /// remaining parameters sorted, so `GET /loans/?b=2&a=1&_=99` and
  /// `GET /loans?a=1&b=2` share one entry.
  pub fn canonical_key(&self, request: &Request) -> String {
    let target = request.target.trim();
    let (path, query) = match target.split_once('?') {
      Some((path, query)) => (path, Some(query)),
      None => (target, None),
    };

    let path = path.trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };

    let mut params: Vec<&str> = query
      .map(|q| {
        q.split('&')
          .filter(|pair| !pair.is_empty())
          .filter(|pair| {
            let name = pair.split('=').next().unwrap_or_default();
            !self.ignored_params.iter().any(|ignored| ignored == name)
          })
          .collect()
      })
      .unwrap_or_default();
    params.sort_unstable();

    if params.is_empty() {
      format!("{} {}", request.method, path)
    } else {
      format!("{} {}?{}", request.method, path, params.join("&"))
    }
  }

  /// Store a fresh entry for `key`, replacing whatever was there.
  pub fn put(&self, key: &str, payload: &Value) -> Result<()> {
    let entry = CacheEntry {
      key: key.to_string(),
      payload: payload.clone(),
      stored_at: self.clock.now(),
    };
    let data =
      serde_json::to_vec(&entry).map_err(|e| eyre!("Failed to serialize cache entry: {}", e))?;

    self.storage.put(&storage_key(key), &data)?;
    debug!(key, "cached response");
    Ok(())
  }

  /// Look up `key`. Expired or unreadable entries are purged and reported absent.
  pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    let storage_key = storage_key(key);
    let data = match self.storage.get(&storage_key)? {
      Some(data) => data,
      None => return Ok(None),
    };

    let entry: CacheEntry = match serde_json::from_slice(&data) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key, error = %e, "dropping unreadable cache entry");
        self.storage.remove(&storage_key)?;
        return Ok(None);
      }
    };

    if entry.is_expired(self.clock.now(), self.freshness) {
      debug!(key, stored_at = %entry.stored_at, "cache entry expired");
      self.storage.remove(&storage_key)?;
      return Ok(None);
    }

    Ok(Some(entry))
  }

  /// Drop the entry for `key`, fresh or not.
  pub fn invalidate(&self, key: &str) -> Result<()> {
    self.storage.remove(&storage_key(key))
  }

  /// Remove every cache entry. Returns how many were removed.
  pub fn clear(&self) -> Result<usize> {
    let keys = self.storage.list_keys(CACHE_PREFIX)?;
    for key in &keys {
      self.storage.remove(key)?;
    }
    Ok(keys.len())
  }

  /// Sweep out expired entries without waiting for them to be read.
  pub fn purge_expired(&self) -> Result<usize> {
    let now = self.clock.now();
    let mut purged = 0;

    for key in self.storage.list_keys(CACHE_PREFIX)? {
      let Some(data) = self.storage.get(&key)? else {
        continue;
      };
      let stale = serde_json::from_slice::<CacheEntry>(&data)
        .map(|entry| entry.is_expired(now, self.freshness))
        .unwrap_or(true);
      if stale {
        self.storage.remove(&key)?;
        purged += 1;
      }
    }

    Ok(purged)
  }

  /// Number of stored entries, expired ones included.
  pub fn len(&self) -> Result<usize> {
    Ok(self.storage.list_keys(CACHE_PREFIX)?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}

impl<S: KeyValueStore> Clone for ResponseCache<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      clock: Arc::clone(&self.clock),
      freshness: self.freshness,
      ignored_params: self.ignored_params.clone(),
    }
  }
}

/// SHA256 for stable, fixed-length storage keys.
fn storage_key(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  format!("{}{}", CACHE_PREFIX, hex::encode(hasher.finalize()))
}
