//! Durable store seams.
//!
//! Four narrow traits (tickets, checkpoints, events, approvals) so the
//! engine can run against the in-memory backend in tests and a real
//! database in production. The ticket store owns the optimistic-lock
//! protocol: `update` with an expected version either wins and bumps the
//! version, or fails with `StoreError::VersionConflict`.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    ApprovalDecision, ApprovalRequest, Checkpoint, EventType, NewTicket, Ticket, TicketEvent,
    TicketStatus, TicketUpdate,
};

pub use memory::{InMemoryApprovalStore, InMemoryCheckpointStore, InMemoryEventStore, InMemoryTicketStore};

/// Ticket persistence with optimistic concurrency.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Insert a new ticket in `pending` status at version 1.
    async fn create(&self, ticket: NewTicket) -> Result<Ticket, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Ticket>, StoreError>;

    async fn list(&self) -> Result<Vec<Ticket>, StoreError>;

    /// Apply a partial update. When `expected_version` is given the update
    /// only succeeds if the stored version matches; either way a successful
    /// update bumps the version by one and stamps `updated_at`.
    async fn update(
        &self,
        id: Uuid,
        update: TicketUpdate,
        expected_version: Option<u64>,
    ) -> Result<Ticket, StoreError>;

    /// Refresh the heartbeat for a held ticket. Takes effect only while
    /// `worker_id` still holds the ticket; like every persisted mutation
    /// it bumps the version.
    async fn update_heartbeat(&self, id: Uuid, worker_id: &str) -> Result<(), StoreError>;

    /// Claim a ticket for processing. Loses cleanly with `VersionConflict`
    /// when another worker got there first.
    async fn acquire_for_processing(
        &self,
        id: Uuid,
        worker_id: &str,
        expected_version: u64,
    ) -> Result<Ticket, StoreError> {
        let now = Utc::now();
        self.update(
            id,
            TicketUpdate {
                status: Some(TicketStatus::Processing),
                worker_id: Some(Some(worker_id.to_string())),
                last_heartbeat: Some(now),
                started_at: Some(now),
                ..TicketUpdate::default()
            },
            Some(expected_version),
        )
        .await
    }

    /// Conditional update by the current holder. Reloads the live version
    /// and retries when a concurrent heartbeat bump wins the race; fails
    /// with `VersionConflict` once `worker_id` no longer holds the ticket.
    async fn commit_held(
        &self,
        id: Uuid,
        worker_id: &str,
        update: TicketUpdate,
    ) -> Result<Ticket, StoreError> {
        loop {
            let current = self.get(id).await?.ok_or(StoreError::TicketNotFound(id))?;
            if current.worker_id.as_deref() != Some(worker_id) {
                return Err(StoreError::VersionConflict {
                    id,
                    expected: current.version,
                });
            }
            match self.update(id, update.clone(), Some(current.version)).await {
                Ok(ticket) => return Ok(ticket),
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        worker_id: &str,
        result: Value,
    ) -> Result<Ticket, StoreError> {
        self.commit_held(
            id,
            worker_id,
            TicketUpdate {
                status: Some(TicketStatus::Completed),
                result: Some(result),
                worker_id: Some(None),
                completed_at: Some(Utc::now()),
                ..TicketUpdate::default()
            },
        )
        .await
    }

    async fn mark_awaiting_approval(&self, id: Uuid, worker_id: &str) -> Result<Ticket, StoreError> {
        self.commit_held(
            id,
            worker_id,
            TicketUpdate {
                status: Some(TicketStatus::AwaitingApproval),
                worker_id: Some(None),
                ..TicketUpdate::default()
            },
        )
        .await
    }

    async fn mark_failed_permanent(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        attempt_count: Option<u32>,
    ) -> Result<Ticket, StoreError> {
        self.commit_held(
            id,
            worker_id,
            TicketUpdate {
                status: Some(TicketStatus::FailedPermanent),
                last_error: Some(error.to_string()),
                attempt_count,
                worker_id: Some(None),
                completed_at: Some(Utc::now()),
                ..TicketUpdate::default()
            },
        )
        .await
    }

    /// Record a transient failure: bump `attempt_count`, store the error,
    /// and return the ticket to `pending` so a redelivery can claim it.
    /// Applied without a version check; retry bookkeeping always lands.
    async fn record_retry(&self, id: Uuid, error: &str) -> Result<Ticket, StoreError> {
        let current = self
            .get(id)
            .await?
            .ok_or(StoreError::TicketNotFound(id))?;
        self.update(
            id,
            TicketUpdate {
                status: Some(TicketStatus::Pending),
                attempt_count: Some(current.attempt_count + 1),
                last_error: Some(error.to_string()),
                worker_id: Some(None),
                ..TicketUpdate::default()
            },
            None,
        )
        .await
    }
}

/// One resume point per ticket.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert or overwrite the checkpoint for a ticket, compare-and-set on
    /// its version: `None` creates a fresh checkpoint, `Some` must match the
    /// stored version. A stale worker whose ticket was reclaimed loses with
    /// `VersionConflict` instead of clobbering the new owner's progress.
    /// Returns the new version.
    async fn upsert(
        &self,
        ticket_id: Uuid,
        current_step: &str,
        state: Value,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    async fn get(&self, ticket_id: Uuid) -> Result<Option<Checkpoint>, StoreError>;

    /// Remove the checkpoint once a ticket reaches a terminal status.
    async fn delete(&self, ticket_id: Uuid) -> Result<(), StoreError>;
}

/// Append-only event log per ticket.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(
        &self,
        ticket_id: Uuid,
        event_type: EventType,
        step_name: Option<&str>,
        payload: Value,
    ) -> Result<TicketEvent, StoreError>;

    /// Events for a ticket in insertion order.
    async fn list_for_ticket(&self, ticket_id: Uuid) -> Result<Vec<TicketEvent>, StoreError>;

    async fn log_status_change(
        &self,
        ticket_id: Uuid,
        from: TicketStatus,
        to: TicketStatus,
    ) -> Result<(), StoreError> {
        self.append(
            ticket_id,
            EventType::StatusChange,
            None,
            json!({ "from": from.as_str(), "to": to.as_str() }),
        )
        .await?;
        Ok(())
    }

    async fn log_step_complete(
        &self,
        ticket_id: Uuid,
        step_name: &str,
        payload: Value,
    ) -> Result<(), StoreError> {
        self.append(ticket_id, EventType::StepComplete, Some(step_name), payload)
            .await?;
        Ok(())
    }

    async fn log_error(
        &self,
        ticket_id: Uuid,
        message: &str,
        step_name: Option<&str>,
    ) -> Result<(), StoreError> {
        self.append(
            ticket_id,
            EventType::Error,
            step_name,
            json!({ "message": message }),
        )
        .await?;
        Ok(())
    }

    async fn log_retry(
        &self,
        ticket_id: Uuid,
        attempt: u32,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.append(
            ticket_id,
            EventType::Retry,
            None,
            json!({ "attempt": attempt, "reason": reason }),
        )
        .await?;
        Ok(())
    }
}

/// Approval requests and the pending→decided transition.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn create(
        &self,
        ticket_id: Uuid,
        action_type: &str,
        params: Value,
    ) -> Result<ApprovalRequest, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>, StoreError>;

    /// Pending requests across all tickets, oldest first.
    async fn list_pending(&self) -> Result<Vec<ApprovalRequest>, StoreError>;

    /// Requests for one ticket, newest first.
    async fn list_for_ticket(&self, ticket_id: Uuid) -> Result<Vec<ApprovalRequest>, StoreError>;

    /// Atomically move a request from pending to decided. Returns
    /// `Ok(None)` when the request was already decided, leaving it
    /// untouched.
    async fn decide(
        &self,
        id: Uuid,
        decision: ApprovalDecision,
    ) -> Result<Option<ApprovalRequest>, StoreError>;
}

/// The bundle of store handles the engine components share.
#[derive(Clone)]
pub struct EngineStores {
    pub tickets: Arc<dyn TicketStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub events: Arc<dyn EventStore>,
    pub approvals: Arc<dyn ApprovalStore>,
}

impl EngineStores {
    /// Fresh in-memory backends, shared via `Arc`.
    pub fn in_memory() -> Self {
        Self {
            tickets: Arc::new(InMemoryTicketStore::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            events: Arc::new(InMemoryEventStore::new()),
            approvals: Arc::new(InMemoryApprovalStore::new()),
        }
    }
}
