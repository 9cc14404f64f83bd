//! Engine error types.
//!
//! Typed errors (`thiserror`) for the store, queue, and engine layers;
//! `anyhow` is used only at the binary boundary.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the durable stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Ticket does not exist
    #[error("ticket {0} not found")]
    TicketNotFound(Uuid),

    /// Conditional update lost an optimistic-lock race
    #[error("version conflict for ticket {id}: expected version {expected}")]
    VersionConflict { id: Uuid, expected: u64 },

    /// Approval request does not exist
    #[error("approval request {0} not found")]
    ApprovalNotFound(Uuid),

    /// State blob could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend failure (connectivity, I/O)
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether this error means another writer won the race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// Errors raised by the work queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Queue was closed; no further messages will be delivered
    #[error("queue closed")]
    Closed,

    /// Unknown delivery tag (already acked or expired)
    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),
}

/// Top-level engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Approval request was created against a ticket that is not processing
    #[error("ticket {id} is not processing (status: {status})")]
    NotProcessing { id: Uuid, status: String },

    /// Checkpoint named a step the engine does not know
    #[error("unknown step name in checkpoint: {0}")]
    UnknownStep(String),
}
