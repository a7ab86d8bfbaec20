//! Error type of the session API.

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::reconcile::ReconcileError;
use crate::store::ApplyError;

/// Errors surfaced by [`crate::SyncHandle`] operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("{0}")]
    Apply(#[from] ApplyError),
    #[error("{0}")]
    Reconcile(#[from] ReconcileError),
    /// Connection attempt did not open within the configured timeout.
    #[error("Connection timeout")]
    Timeout,
    /// Socket-level failure (connect refused, read/write error, abnormal close).
    #[error("Transport error: {0}")]
    Transport(String),
    /// The attempt or connection was torn down before completing.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
    /// The session task has exited.
    #[error("Sync session closed")]
    SessionClosed,
}
