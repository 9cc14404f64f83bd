//! Core data model for the ticket engine.
//!
//! Every struct here is the durable shape: tickets, checkpoints, approval
//! requests, the append-only event log, and the queue message envelope.
//! Status enums carry `Display` impls and terminal/active predicates so
//! callers never match on raw strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle status of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Queued, waiting for a worker to claim it
    Pending,
    /// Claimed by a worker, steps are running
    Processing,
    /// Suspended on a human approval decision
    AwaitingApproval,
    /// Finished successfully; `result` is set
    Completed,
    /// Exhausted retries or hit a permanent error; `last_error` is set
    FailedPermanent,
}

impl TicketStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketStatus::Completed | TicketStatus::FailedPermanent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Pending => "pending",
            TicketStatus::Processing => "processing",
            TicketStatus::AwaitingApproval => "awaiting_approval",
            TicketStatus::Completed => "completed",
            TicketStatus::FailedPermanent => "failed_permanent",
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A support ticket and its processing bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub customer_id: String,
    pub subject: String,
    pub body: String,
    pub status: TicketStatus,
    /// Optimistic-lock version; bumped on every successful update
    pub version: u64,
    /// Transient-failure retries consumed so far
    pub attempt_count: u32,
    /// Worker currently (or last) holding the ticket
    pub worker_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Final payload, set only on completion
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields for a new ticket; the store assigns bookkeeping defaults.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub id: Uuid,
    pub customer_id: String,
    pub subject: String,
    pub body: String,
}

/// Partial update applied to a ticket. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TicketUpdate {
    pub status: Option<TicketStatus>,
    pub worker_id: Option<Option<String>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    pub attempt_count: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The durable resume point for a ticket: the step to run next and the
/// accumulated workflow state. One checkpoint per ticket, overwritten on
/// every step boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub ticket_id: Uuid,
    pub current_step: String,
    pub state: Value,
    /// Optimistic-lock version, same protocol as the ticket row
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Status of a human approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn is_decided(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A request for a human to approve a side-effecting action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub ticket_id: Uuid,
    /// Tool name the workflow wants to run, e.g. `process_refund`
    pub action_type: String,
    pub params: Value,
    pub status: ApprovalStatus,
    pub decided_by: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// The decision applied to a pending approval request.
#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub decided_by: String,
    pub reason: Option<String>,
}

/// Kinds of entries in the append-only ticket event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    StatusChange,
    StepComplete,
    Error,
    Retry,
    ApprovalDecision,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::StatusChange => "status_change",
            EventType::StepComplete => "step_complete",
            EventType::Error => "error",
            EventType::Retry => "retry",
            EventType::ApprovalDecision => "approval_decision",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry in the ticket event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketEvent {
    pub id: u64,
    pub ticket_id: Uuid,
    pub event_type: EventType,
    /// Step that produced the event, when one applies
    pub step_name: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// The envelope carried on the work queue. Deliberately thin: the ticket
/// row is the source of truth, the message just names it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub ticket_id: Uuid,
    /// Delivery attempt, stamped by the enqueuer; informational
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(ticket_id: Uuid, attempt: u32) -> Self {
        Self {
            ticket_id,
            attempt,
            enqueued_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(TicketStatus::Completed.is_terminal());
        assert!(TicketStatus::FailedPermanent.is_terminal());
        assert!(!TicketStatus::Pending.is_terminal());
        assert!(!TicketStatus::Processing.is_terminal());
        assert!(!TicketStatus::AwaitingApproval.is_terminal());
    }

    #[test]
    fn test_status_serde_roundtrip() {
        let json = serde_json::to_string(&TicketStatus::AwaitingApproval).unwrap();
        assert_eq!(json, "\"awaiting_approval\"");
        let back: TicketStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TicketStatus::AwaitingApproval);
    }

    #[test]
    fn test_approval_status_decided() {
        assert!(!ApprovalStatus::Pending.is_decided());
        assert!(ApprovalStatus::Approved.is_decided());
        assert!(ApprovalStatus::Rejected.is_decided());
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::StepComplete.to_string(), "step_complete");
        assert_eq!(EventType::StatusChange.to_string(), "status_change");
    }
}
