//! Offline synchronization core.
//!
//! Lets a client keep working over an intermittent connection: reads that
//! cannot reach the backend are answered from a local response cache, and
//! writes are queued in a durable outbox and replayed in order once
//! connectivity returns.
//!
//! [`SyncCoordinator::execute`] is the entry point for callers; it returns a
//! live response, a cached one, or a queued acknowledgement.

pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod logging;
pub mod outbox;
pub mod store;
pub mod transport;

pub use cache::{CacheEntry, ResponseCache};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, Reachability};
pub use coordinator::{DrainReport, Outcome, SyncCoordinator, SyncError, SyncEvent, SyncStatus};
pub use outbox::{DeadLetter, MutationStatus, Outbox, OutboxError, QueuedMutation};
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
pub use transport::{HttpTransport, Method, Request, Response, Transport, TransportError};
