//! Durable FIFO queue of write requests issued while the backend was unreachable.
//!
//! The whole queue lives under a single `outbox` key so that every mutation of
//! it is one atomic read-modify-write against the store. Nothing is held in
//! memory between calls: if a store write fails, the operation did not happen.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Report, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::store::KeyValueStore;
use crate::transport::Request;

pub const OUTBOX_KEY: &str = "outbox";

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationStatus {
  Pending,
  InFlight,
  /// Permanently failed; only ever seen on dead letters
  Failed,
}

/// A write request captured at the moment it could not be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
  pub id: u64,
  /// Method, target, payload and headers as issued
  pub request: Request,
  pub enqueued_at: DateTime<Utc>,
  pub attempts: u32,
  pub status: MutationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
  pub mutation: QueuedMutation,
  pub failed_at: DateTime<Utc>,
  /// Status of the last rejection, if the backend answered at all
  pub last_status: Option<u16>,
}

/// What `mark_failed` did with the entry.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
  /// Still pending; will be retried on the next drain
  Retry { attempts: u32 },
  /// Attempts exhausted; moved off the active queue
  DeadLettered(DeadLetter),
}

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
  #[error("cannot queue, storage full ({capacity} mutations pending)")]
  Full { capacity: usize },
  #[error("outbox storage error: {0}")]
  Storage(Report),
}

impl From<Report> for OutboxError {
  fn from(report: Report) -> Self {
    OutboxError::Storage(report)
  }
}

/// Persisted layout of the `outbox` key.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutboxState {
  /// Next id to hand out; survives `clear` so ids are never reused
  next_id: u64,
  pending: Vec<QueuedMutation>,
  dead_letters: Vec<DeadLetter>,
}

pub struct Outbox<S: KeyValueStore> {
  storage: Arc<S>,
  clock: Arc<dyn Clock>,
  /// Serializes read-modify-write cycles on the outbox key
  lock: Mutex<()>,
  max_attempts: u32,
  capacity: usize,
  dead_letter_capacity: usize,
}

impl<S: KeyValueStore> Outbox<S> {
  pub fn new(storage: Arc<S>) -> Self {
    Self {
      storage,
      clock: Arc::new(SystemClock),
      lock: Mutex::new(()),
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      capacity: DEFAULT_CAPACITY,
      dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts.max(1);
    self
  }

  pub fn with_capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity;
    self
  }

  pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
    self.dead_letter_capacity = capacity;
    self
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Append `request` to the tail of the queue. Does not attempt delivery.
  pub fn enqueue(&self, request: Request) -> Result<u64, OutboxError> {
    let capacity = self.capacity;
    let now = self.clock.now();

    self.update(|state| -> Result<u64, OutboxError> {
      if state.pending.len() >= capacity {
        return Err(OutboxError::Full { capacity });
      }

      state.next_id += 1;
      let id = state.next_id;
      state.pending.push(QueuedMutation {
        id,
        request,
        enqueued_at: now,
        attempts: 0,
        status: MutationStatus::Pending,
      });
      Ok(id)
    })
  }

  /// Snapshot of every queued mutation, oldest first.
  pub fn peek_all(&self) -> Result<Vec<QueuedMutation>> {
    Ok(self.load()?.pending)
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.load()?.pending.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
    Ok(self.load()?.dead_letters)
  }

  /// Record that a replay of `id` is about to hit the network.
  pub fn mark_in_flight(&self, id: u64) -> Result<()> {
    self.set_status(id, MutationStatus::InFlight)
  }

  /// Put an in-flight entry back to pending without counting an attempt.
  pub fn release(&self, id: u64) -> Result<()> {
    self.set_status(id, MutationStatus::Pending)
  }

  /// Confirmed delivered: drop the entry. Returns false if it was not queued.
  pub fn mark_succeeded(&self, id: u64) -> Result<bool> {
    self.update(|state| {
      let before = state.pending.len();
      state.pending.retain(|m| m.id != id);
      Ok::<_, Report>(state.pending.len() != before)
    })
  }

  /// Count a failed replay. Dead-letters the entry once attempts are exhausted.
  pub fn mark_failed(&self, id: u64, last_status: Option<u16>) -> Result<FailOutcome> {
    let max_attempts = self.max_attempts;
    let dead_letter_capacity = self.dead_letter_capacity;
    let now = self.clock.now();

    self.update(|state| -> Result<FailOutcome> {
      let position = state
        .pending
        .iter()
        .position(|m| m.id == id)
        .ok_or_else(|| eyre!("No queued mutation with id {}", id))?;

      let entry = &mut state.pending[position];
      entry.attempts += 1;

      if entry.attempts < max_attempts {
        entry.status = MutationStatus::Pending;
        return Ok(FailOutcome::Retry {
          attempts: entry.attempts,
        });
      }

      let mut mutation = state.pending.remove(position);
      mutation.status = MutationStatus::Failed;
      let letter = DeadLetter {
        mutation,
        failed_at: now,
        last_status,
      };

      state.dead_letters.push(letter.clone());
      if state.dead_letters.len() > dead_letter_capacity {
        let overflow = state.dead_letters.len() - dead_letter_capacity;
        state.dead_letters.drain(..overflow);
      }

      Ok(FailOutcome::DeadLettered(letter))
    })
  }

  /// Entries left `InFlight` by a process that died mid-drain go back to pending.
  pub fn recover_in_flight(&self) -> Result<usize> {
    let recovered = self.update(|state| {
      let mut recovered = 0;
      for entry in &mut state.pending {
        if entry.status == MutationStatus::InFlight {
          entry.status = MutationStatus::Pending;
          recovered += 1;
        }
      }
      Ok::<_, Report>(recovered)
    })?;

    if recovered > 0 {
      warn!(recovered, "reset interrupted replays to pending");
    }
    Ok(recovered)
  }

  /// Drop every pending mutation and dead letter. Ids keep counting up.
  pub fn clear(&self) -> Result<usize> {
    let cleared = self.update(|state| {
      let cleared = state.pending.len();
      state.pending.clear();
      state.dead_letters.clear();
      Ok::<_, Report>(cleared)
    })?;

    info!(cleared, "outbox cleared");
    Ok(cleared)
  }

  fn set_status(&self, id: u64, status: MutationStatus) -> Result<()> {
    self.update(|state| -> Result<()> {
      let entry = state
        .pending
        .iter_mut()
        .find(|m| m.id == id)
        .ok_or_else(|| eyre!("No queued mutation with id {}", id))?;
      entry.status = status;
      Ok(())
    })
  }

  fn load(&self) -> Result<OutboxState> {
    match self.storage.get(OUTBOX_KEY)? {
      Some(data) => {
        serde_json::from_slice(&data).map_err(|e| eyre!("Failed to parse outbox: {}", e))
      }
      None => Ok(OutboxState::default()),
    }
  }

  /// Load, apply `f`, persist. Nothing is written if `f` fails.
  fn update<T, E, F>(&self, f: F) -> Result<T, E>
  where
    F: FnOnce(&mut OutboxState) -> Result<T, E>,
    E: From<Report>,
  {
    let _guard = self
      .lock
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut state = self.load()?;
    let value = f(&mut state)?;

    let data =
      serde_json::to_vec(&state).map_err(|e| eyre!("Failed to serialize outbox: {}", e))?;
    self.storage.put(OUTBOX_KEY, &data)?;

    Ok(value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;
  use crate::transport::Method;
  use serde_json::json;

  fn outbox() -> Outbox<MemoryStore> {
    Outbox::new(Arc::new(MemoryStore::new()))
  }

  fn write(n: u64) -> Request {
    Request::post("/payments/create", json!({ "seq": n }))
  }

  /// Store whose writes can be switched off to simulate a full disk.
  #[derive(Default)]
  struct FlakyStore {
    inner: MemoryStore,
    fail_writes: std::sync::atomic::AtomicBool,
  }

  impl KeyValueStore for FlakyStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
      if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
        return Err(eyre!("Storage full while writing {}", key));
      }
      self.inner.put(key, value)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
      self.inner.get(key)
    }

    fn remove(&self, key: &str) -> Result<()> {
      self.inner.remove(key)
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
      self.inner.list_keys(prefix)
    }
  }

  #[test]
  fn test_enqueue_preserves_fifo_and_unique_ids() {
    let outbox = outbox();
    let ids: Vec<u64> = (1..=3).map(|n| outbox.enqueue(write(n)).unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    let queued = outbox.peek_all().unwrap();
    let seqs: Vec<_> = queued
      .iter()
      .map(|m| m.request.payload.clone().unwrap()["seq"].clone())
      .collect();
    assert_eq!(seqs, vec![json!(1), json!(2), json!(3)]);
    assert!(queued.iter().all(|m| m.status == MutationStatus::Pending));
  }

  #[test]
  fn test_full_queue_rejects_without_evicting() {
    let outbox = outbox();
    for n in 0..100 {
      outbox.enqueue(write(n)).unwrap();
    }

    let err = outbox.enqueue(write(100)).unwrap_err();
    assert!(matches!(err, OutboxError::Full { capacity: 100 }));

    let queued = outbox.peek_all().unwrap();
    assert_eq!(queued.len(), 100);
    assert_eq!(queued[0].id, 1);
    assert_eq!(queued[99].id, 100);
  }

  #[test]
  fn test_mark_succeeded_removes_only_that_entry() {
    let outbox = outbox();
    let first = outbox.enqueue(write(1)).unwrap();
    let second = outbox.enqueue(write(2)).unwrap();

    assert!(outbox.mark_succeeded(first).unwrap());
    assert!(!outbox.mark_succeeded(first).unwrap());

    let remaining = outbox.peek_all().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, second);
  }

  #[test]
  fn test_mark_failed_dead_letters_after_max_attempts() {
    let outbox = outbox().with_max_attempts(3);
    let id = outbox.enqueue(write(1)).unwrap();

    assert_eq!(
      outbox.mark_failed(id, Some(422)).unwrap(),
      FailOutcome::Retry { attempts: 1 }
    );
    assert_eq!(
      outbox.mark_failed(id, Some(422)).unwrap(),
      FailOutcome::Retry { attempts: 2 }
    );

    match outbox.mark_failed(id, Some(422)).unwrap() {
      FailOutcome::DeadLettered(letter) => {
        assert_eq!(letter.mutation.id, id);
        assert_eq!(letter.mutation.attempts, 3);
        assert_eq!(letter.mutation.status, MutationStatus::Failed);
        assert_eq!(letter.last_status, Some(422));
      }
      other => panic!("expected dead letter, got {:?}", other),
    }

    assert!(outbox.is_empty().unwrap());
    assert_eq!(outbox.dead_letters().unwrap().len(), 1);
  }

  #[test]
  fn test_dead_letters_drop_oldest_when_capped() {
    let outbox = outbox().with_max_attempts(1).with_dead_letter_capacity(2);
    for n in 1..=3 {
      let id = outbox.enqueue(write(n)).unwrap();
      outbox.mark_failed(id, Some(400)).unwrap();
    }

    let letters: Vec<u64> = outbox
      .dead_letters()
      .unwrap()
      .iter()
      .map(|l| l.mutation.id)
      .collect();
    assert_eq!(letters, vec![2, 3]);
  }

  #[test]
  fn test_mark_failed_unknown_id_is_an_error() {
    let outbox = outbox();
    assert!(outbox.mark_failed(7, None).is_err());
  }

  #[test]
  fn test_recover_in_flight_resets_to_pending() {
    let store = Arc::new(MemoryStore::new());
    let outbox = Outbox::new(store.clone());
    let id = outbox.enqueue(Request::new(Method::Delete, "/loans/9")).unwrap();
    outbox.mark_in_flight(id).unwrap();

    // Same store, fresh handle: as after a restart
    let reopened = Outbox::new(store);
    assert_eq!(reopened.recover_in_flight().unwrap(), 1);
    assert_eq!(
      reopened.peek_all().unwrap()[0].status,
      MutationStatus::Pending
    );
  }

  #[test]
  fn test_clear_keeps_id_sequence() {
    let outbox = outbox();
    outbox.enqueue(write(1)).unwrap();
    outbox.enqueue(write(2)).unwrap();

    assert_eq!(outbox.clear().unwrap(), 2);
    assert_eq!(outbox.enqueue(write(3)).unwrap(), 3);
  }

  #[test]
  fn test_failed_store_write_leaves_queue_untouched() {
    let store = Arc::new(FlakyStore::default());
    let outbox = Outbox::new(store.clone());
    let id = outbox.enqueue(write(1)).unwrap();

    store
      .fail_writes
      .store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(matches!(
      outbox.enqueue(write(2)),
      Err(OutboxError::Storage(_))
    ));
    assert!(outbox.mark_succeeded(id).is_err());

    store
      .fail_writes
      .store(false, std::sync::atomic::Ordering::SeqCst);
    let queued = outbox.peek_all().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, id);
  }
}
