//! Sync coordinator: the request gateway.
//!
//! Every request goes live first. Only when no response arrives at all does the
//! coordinator fall back: writes are queued in the outbox, reads are served from
//! the response cache. Queued writes are replayed in order by a drain pass that
//! runs on reconnect, with at most one pass executing at a time.

use color_eyre::{Report, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth::{authorize, Anonymous, AuthProvider};
use crate::cache::{CacheEntry, ResponseCache};
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor, Reachability};
use crate::outbox::{DeadLetter, FailOutcome, Outbox, OutboxError, QueuedMutation};
use crate::store::KeyValueStore;
use crate::transport::{Method, Request, Response, Transport, TransportError};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Successful result of `execute`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  /// Live response from the backend
  Live(Response),
  /// Backend unreachable; served from cache, possibly stale
  Cached(CacheEntry),
  /// Backend unreachable; the write will be replayed later
  Queued { id: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
  #[error("backend unreachable and nothing cached: {reason}")]
  Unreachable { reason: String },
  /// The backend answered with a non-success status. Carried unchanged.
  #[error("backend returned status {}", .0.status)]
  Application(Response),
  #[error("cannot queue, storage full ({capacity} mutations pending)")]
  QueueFull { capacity: usize },
  #[error("invalid request: {0}")]
  Invalid(String),
  #[error("storage error: {0}")]
  Storage(Report),
}

impl From<Report> for SyncError {
  fn from(report: Report) -> Self {
    SyncError::Storage(report)
  }
}

impl From<OutboxError> for SyncError {
  fn from(e: OutboxError) -> Self {
    match e {
      OutboxError::Full { capacity } => SyncError::QueueFull { capacity },
      OutboxError::Storage(report) => SyncError::Storage(report),
    }
  }
}

/// Summary of one `drain` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Passes run; more than one when reconnects arrived mid-drain
  pub passes: usize,
  pub replayed: usize,
  pub rejected: usize,
  pub dead_lettered: usize,
  /// A pass ended early because the backend stopped answering
  pub interrupted: bool,
  /// Another drain was already running; this call only asked it for one more pass
  pub coalesced: bool,
}

/// Notifications for work that finishes after the original caller returned.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  Replayed { id: u64, status: u16 },
  Rejected { id: u64, status: Option<u16>, attempts: u32 },
  DeadLettered(DeadLetter),
  DrainFinished(DrainReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
  pub connectivity: Reachability,
  pub pending: usize,
  pub dead_letters: usize,
  pub cached_entries: usize,
}

/// How one replay ended.
enum Replay {
  Delivered,
  /// Rejected; later entries may proceed
  Skipped,
  /// Stop the pass to keep order
  Halt,
}

pub struct SyncCoordinator<S: KeyValueStore> {
  transport: Arc<dyn Transport>,
  auth: Arc<dyn AuthProvider>,
  cache: ResponseCache<S>,
  outbox: Arc<Outbox<S>>,
  monitor: Arc<ConnectivityMonitor>,
  /// Held for the whole of a drain
  drain_lock: tokio::sync::Mutex<()>,
  /// Set when a drain is requested while one is running
  drain_requested: AtomicBool,
  /// Asks the background loop to retry after `retry_interval`
  retry_wanted: Notify,
  subscribers: Mutex<Vec<mpsc::UnboundedSender<SyncEvent>>>,
  invalidate_on_write: bool,
  /// Delay before retrying a drain that halted while the backend stayed reachable
  retry_interval: Duration,
}

impl<S: KeyValueStore + 'static> SyncCoordinator<S> {
  /// Build a coordinator. Replays interrupted by a previous crash go back to pending.
  pub fn new(
    transport: Arc<dyn Transport>,
    cache: ResponseCache<S>,
    outbox: Arc<Outbox<S>>,
    monitor: Arc<ConnectivityMonitor>,
  ) -> Result<Self> {
    outbox.recover_in_flight()?;

    Ok(Self {
      transport,
      auth: Arc::new(Anonymous),
      cache,
      outbox,
      monitor,
      drain_lock: tokio::sync::Mutex::new(()),
      drain_requested: AtomicBool::new(false),
      retry_wanted: Notify::new(),
      subscribers: Mutex::new(Vec::new()),
      invalidate_on_write: true,
      retry_interval: DEFAULT_RETRY_INTERVAL,
    })
  }

  pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
    self.auth = auth;
    self
  }

  /// Drop the cached read of a target after a successful write to it.
  pub fn with_invalidate_on_write(mut self, enabled: bool) -> Self {
    self.invalidate_on_write = enabled;
    self
  }

  pub fn with_retry_interval(mut self, interval: Duration) -> Self {
    self.retry_interval = interval;
    self
  }

  pub fn cache(&self) -> &ResponseCache<S> {
    &self.cache
  }

  pub fn outbox(&self) -> &Outbox<S> {
    &self.outbox
  }

  pub fn monitor(&self) -> &ConnectivityMonitor {
    &self.monitor
  }

  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Ok(mut subscribers) = self.subscribers.lock() {
      subscribers.push(tx);
    }
    rx
  }

  pub fn status(&self) -> Result<SyncStatus> {
    Ok(SyncStatus {
      connectivity: self.monitor.state(),
      pending: self.outbox.len()?,
      dead_letters: self.outbox.dead_letters()?.len(),
      cached_entries: self.cache.len()?,
    })
  }

  /// Issue `request`, falling back to the outbox or cache only if the backend
  /// could not be reached.
  pub async fn execute(&self, request: Request) -> Result<Outcome, SyncError> {
    let mutating = request.method.is_mutating();

    // Older writes go first. Queue behind them only if they could not all be sent.
    if mutating && !self.outbox.is_empty()? {
      let report = self.drain().await?;
      if !self.outbox.is_empty()? {
        let id = self.enqueue(request)?;
        if report.interrupted {
          self.schedule_retry();
        }
        return Ok(Outcome::Queued { id });
      }
    }

    let outgoing = authorize(&request, self.auth.as_ref());
    match self.transport.send(&outgoing).await {
      Ok(response) if response.is_success() => {
        if mutating {
          self.invalidate_related(&request);
        } else if request.method == Method::Get {
          let key = self.cache.canonical_key(&request);
          if let Err(e) = self.cache.put(&key, &response.body) {
            warn!(key, error = %e, "failed to cache response");
          }
        }
        Ok(Outcome::Live(response))
      }
      Ok(response) => {
        debug!(
          method = %request.method,
          path = %request.target,
          status = response.status,
          "application error"
        );
        Err(SyncError::Application(response))
      }
      Err(TransportError::Invalid(msg)) => Err(SyncError::Invalid(msg)),
      Err(TransportError::Unreachable(reason)) => {
        if mutating {
          let id = self.enqueue(request)?;
          return Ok(Outcome::Queued { id });
        }

        let key = self.cache.canonical_key(&request);
        match self.cache.get(&key)? {
          Some(entry) => {
            info!(key, stored_at = %entry.stored_at, "serving cached response");
            Ok(Outcome::Cached(entry))
          }
          None => Err(SyncError::Unreachable { reason }),
        }
      }
    }
  }

  fn enqueue(&self, request: Request) -> Result<u64, SyncError> {
    let method = request.method;
    let path = request.target.clone();
    match self.outbox.enqueue(request) {
      Ok(id) => {
        info!(id, %method, path, "queued write for replay");
        Ok(id)
      }
      Err(e) => {
        error!(%method, path, error = %e, "failed to queue write");
        Err(e.into())
      }
    }
  }

  /// Replay queued writes in order. Only one drain runs at a time; a call made
  /// while one is running returns at once and makes the running drain do one
  /// more pass.
  pub async fn drain(&self) -> Result<DrainReport> {
    let mut report = DrainReport::default();
    loop {
      {
        let Ok(_guard) = self.drain_lock.try_lock() else {
          self.drain_requested.store(true, Ordering::SeqCst);
          if report.passes > 0 {
            // Whoever holds the lock now runs a full pass
            break;
          }
          debug!("drain already running, coalescing");
          return Ok(DrainReport {
            coalesced: true,
            ..DrainReport::default()
          });
        };
        self.run_passes(&mut report).await?;
      }

      // A request may have landed after the last check but before the lock was released
      if report.interrupted || !self.drain_requested.load(Ordering::SeqCst) {
        break;
      }
    }

    if report.replayed + report.rejected > 0 || report.interrupted {
      info!(
        replayed = report.replayed,
        rejected = report.rejected,
        dead_lettered = report.dead_lettered,
        interrupted = report.interrupted,
        "drain finished"
      );
    }
    self.emit(SyncEvent::DrainFinished(report.clone()));

    Ok(report)
  }

  /// Passes under the drain lock until no further pass is requested.
  async fn run_passes(&self, report: &mut DrainReport) -> Result<()> {
    loop {
      self.drain_requested.store(false, Ordering::SeqCst);
      report.passes += 1;

      if self.drain_pass(report).await? {
        report.interrupted = true;
        return Ok(());
      }
      if !self.drain_requested.swap(false, Ordering::SeqCst) {
        return Ok(());
      }
    }
  }

  /// One pass over the current snapshot. Returns true if it halted early.
  async fn drain_pass(&self, report: &mut DrainReport) -> Result<bool> {
    let snapshot = self.outbox.peek_all()?;
    if snapshot.is_empty() {
      return Ok(false);
    }
    debug!(pending = snapshot.len(), "drain pass");

    for mutation in snapshot {
      match self.replay(&mutation, report).await? {
        Replay::Delivered | Replay::Skipped => {}
        Replay::Halt => return Ok(true),
      }
    }

    Ok(false)
  }

  async fn replay(&self, mutation: &QueuedMutation, report: &mut DrainReport) -> Result<Replay> {
    let id = mutation.id;
    self.outbox.mark_in_flight(id)?;

    let outgoing = authorize(&mutation.request, self.auth.as_ref());
    match self.transport.send(&outgoing).await {
      Ok(response) if response.is_success() => {
        self.outbox.mark_succeeded(id)?;
        report.replayed += 1;
        debug!(id, status = response.status, "replayed queued write");
        self.invalidate_related(&mutation.request);
        self.emit(SyncEvent::Replayed {
          id,
          status: response.status,
        });
        Ok(Replay::Delivered)
      }
      Ok(response) => {
        let status = response.status;
        self.reject(mutation, Some(status), report)?;
        if is_transient(status) {
          warn!(id, status, "backend temporarily failing, stopping drain");
          Ok(Replay::Halt)
        } else {
          Ok(Replay::Skipped)
        }
      }
      Err(TransportError::Unreachable(reason)) => {
        self.outbox.release(id)?;
        warn!(id, reason, "backend unreachable during drain, stopping");
        Ok(Replay::Halt)
      }
      Err(TransportError::Invalid(msg)) => {
        warn!(id, msg, "queued write cannot be sent");
        self.reject(mutation, None, report)?;
        Ok(Replay::Skipped)
      }
    }
  }

  fn reject(
    &self,
    mutation: &QueuedMutation,
    status: Option<u16>,
    report: &mut DrainReport,
  ) -> Result<()> {
    report.rejected += 1;
    match self.outbox.mark_failed(mutation.id, status)? {
      FailOutcome::Retry { attempts } => {
        warn!(id = mutation.id, ?status, attempts, "queued write rejected");
        self.emit(SyncEvent::Rejected {
          id: mutation.id,
          status,
          attempts,
        });
      }
      FailOutcome::DeadLettered(letter) => {
        report.dead_lettered += 1;
        error!(
          id = mutation.id,
          method = %mutation.request.method,
          path = %mutation.request.target,
          ?status,
          "queued write permanently failed"
        );
        self.emit(SyncEvent::DeadLettered(letter));
      }
    }
    Ok(())
  }

  fn invalidate_related(&self, request: &Request) {
    if !self.invalidate_on_write {
      return;
    }
    let key = self
      .cache
      .canonical_key(&Request::get(request.target.clone()));
    if let Err(e) = self.cache.invalidate(&key) {
      warn!(key, error = %e, "failed to invalidate cached read");
    }
  }

  fn emit(&self, event: SyncEvent) {
    if let Ok(mut subscribers) = self.subscribers.lock() {
      subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
  }

  /// Ask the background loop to try again after `retry_interval`. Used when a
  /// pass halted but no reconnect edge is coming to resume it.
  fn schedule_retry(&self) {
    self.retry_wanted.notify_one();
  }

  /// Drain on every reconnect edge and on request. Also drains once at start
  /// if already reachable, which is how a restarted process resumes. A drain
  /// that halts while the backend is not known to be down is retried after
  /// `retry_interval`.
  pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
    let coordinator = Arc::clone(self);
    let mut edges = coordinator.monitor.subscribe();

    tokio::spawn(async move {
      let mut retry_at: Option<Instant> = None;
      if coordinator.monitor.is_reachable() {
        retry_at = coordinator.drain_logged().await;
      }

      loop {
        let retry = async move {
          match retry_at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
          }
        };

        let next = tokio::select! {
          event = edges.recv() => match event {
            Some(ConnectivityEvent::BecameReachable) => coordinator.drain_logged().await,
            Some(ConnectivityEvent::BecameUnreachable) => None,
            None => break,
          },
          _ = coordinator.retry_wanted.notified() => {
            Some(Instant::now() + coordinator.retry_interval)
          }
          _ = retry => coordinator.drain_logged().await,
        };
        retry_at = next;
      }
    })
  }

  /// Drain, returning when to retry if the pass halted with work left.
  async fn drain_logged(&self) -> Option<Instant> {
    match self.drain().await {
      Ok(report) if report.interrupted => {
        let pending = self.outbox.len().unwrap_or(0);
        if pending > 0 && self.monitor.state() != Reachability::Unreachable {
          debug!(pending, retry_in = ?self.retry_interval, "scheduling drain retry");
          return Some(Instant::now() + self.retry_interval);
        }
        None
      }
      Ok(_) => None,
      Err(e) => {
        error!(error = %e, "drain failed");
        None
      }
    }
  }
}

/// Statuses worth retrying later rather than skipping past.
fn is_transient(status: u16) -> bool {
  status >= 500 || status == 408 || status == 429
}
