//! # logos-sync — Client-side synchronization core for Logos
//!
//! Keeps a local document consistent with an authoritative ordering server
//! while the user keeps editing, online or offline.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   commit   ┌───────────────┐  push / pull  ┌─────────────┐
//! │ Application │ ─────────► │  SyncSession  │ ────────────► │  Ordering   │
//! │ (SyncHandle)│ ◄───────── │ (single task) │ ◄──────────── │  server     │
//! └─────────────┘  SyncEvent └───────┬───────┘  acknowledged └─────────────┘
//!                                    │
//!              ┌─────────────────────┼─────────────────────┐
//!              ▼                     ▼                     ▼
//!      ┌───────────────┐    ┌────────────────┐    ┌────────────────┐
//!      │ OutgoingQueue │    │   Reconciler   │    │ Connection-    │
//!      │ (pending ops) │    │ (version gate) │    │ Manager (rate- │
//!      └───────────────┘    └───────┬────────┘    │ limited FSM)   │
//!                                   ▼             └────────────────┘
//!                          DocumentStore → UpdateSink
//! ```
//!
//! ## Modules
//!
//! - [`change`] — Change identities and payload records
//! - [`protocol`] — JSON envelope messages and inbound dispatch
//! - [`queue`] — Ordered, coalescing queue of unconfirmed local changes
//! - [`store`] — Document store and update sink seams, in-memory store
//! - [`reconcile`] — Atomic merge of acknowledged batches
//! - [`connection`] — Connection state machine with rate limiting
//! - [`transport`] — WebSocket link task per connection attempt
//! - [`session`] — Event loop tying it all together

pub mod change;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use change::{Change, ChangeId, ChangeKind, ServerChange};
pub use config::SyncConfig;
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus, RateLimiter};
pub use error::SyncError;
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use queue::{OutgoingQueue, QueuedChange};
pub use reconcile::{ReconcileError, Reconciled, Reconciler, VersionCursor};
pub use session::{SessionStats, SyncEvent, SyncHandle, SyncSession};
pub use store::{ApplyError, DocumentStore, Entities, Entity, MemoryStore, UpdateSink};
