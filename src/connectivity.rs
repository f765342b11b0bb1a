//! Connectivity monitor.
//!
//! Turns a stream of raw reachability signals into edge-triggered events. The
//! state is a hint for when to drain the outbox, never a reason to skip a live
//! call: the call's own outcome is what counts.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
  /// No signal observed yet
  Unknown,
  Reachable,
  Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  BecameReachable,
  BecameUnreachable,
}

pub struct ConnectivityMonitor {
  state: Mutex<Reachability>,
  subscribers: Mutex<Vec<mpsc::UnboundedSender<ConnectivityEvent>>>,
}

impl Default for ConnectivityMonitor {
  fn default() -> Self {
    Self::new()
  }
}

impl ConnectivityMonitor {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(Reachability::Unknown),
      subscribers: Mutex::new(Vec::new()),
    }
  }

  pub fn state(&self) -> Reachability {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(Reachability::Unknown)
  }

  pub fn is_reachable(&self) -> bool {
    self.state() == Reachability::Reachable
  }

  /// Receive every future edge.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectivityEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Ok(mut subscribers) = self.subscribers.lock() {
      subscribers.push(tx);
    }
    rx
  }

  /// Feed one platform signal. Returns the event fired, if this was an edge.
  ///
  /// Leaving `Unknown` counts as an edge: after a restart the first
  /// `Reachable` signal is what resumes an interrupted drain.
  pub fn observe(&self, reachable: bool) -> Option<ConnectivityEvent> {
    let next = if reachable {
      Reachability::Reachable
    } else {
      Reachability::Unreachable
    };

    // Held until subscribers are told, so events go out in the order states change
    let mut state = self.state.lock().ok()?;
    let previous = std::mem::replace(&mut *state, next);
    if previous == next {
      return None;
    }

    let event = if reachable {
      ConnectivityEvent::BecameReachable
    } else {
      ConnectivityEvent::BecameUnreachable
    };
    info!(from = ?previous, to = ?next, "connectivity changed");

    if let Ok(mut subscribers) = self.subscribers.lock() {
      subscribers.retain(|tx| tx.send(event).is_ok());
    }
    drop(state);

    Some(event)
  }
}

/// Host and port probed to decide reachability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
  pub host: String,
  pub port: u16,
}

impl ProbeTarget {
  pub fn from_base_url(base_url: &str) -> Result<Self> {
    let url = Url::parse(base_url).map_err(|e| eyre!("Invalid base URL {}: {}", base_url, e))?;
    let host = url
      .host_str()
      .ok_or_else(|| eyre!("Base URL {} has no host", base_url))?
      .to_string();
    let port = url
      .port_or_known_default()
      .ok_or_else(|| eyre!("Base URL {} has no port", base_url))?;
    Ok(Self { host, port })
  }

  /// One TCP connect attempt, bounded by `timeout`.
  pub async fn probe(&self, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((self.host.as_str(), self.port))).await
    {
      Ok(Ok(_)) => true,
      Ok(Err(e)) => {
        debug!(host = %self.host, port = self.port, error = %e, "probe failed");
        false
      }
      Err(_) => {
        debug!(host = %self.host, port = self.port, "probe timed out");
        false
      }
    }
  }
}

/// Background task standing in for the platform reachability callback:
/// probes `target` every `interval` and feeds the result to `monitor`.
pub fn spawn_probe(
  monitor: Arc<ConnectivityMonitor>,
  target: ProbeTarget,
  interval: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let timeout = interval.min(Duration::from_secs(5));
    let mut ticker = tokio::time::interval(interval);
    loop {
      ticker.tick().await;
      let reachable = target.probe(timeout).await;
      if monitor.observe(reachable) == Some(ConnectivityEvent::BecameUnreachable) {
        warn!(host = %target.host, "backend unreachable");
      }
    }
  })
}
