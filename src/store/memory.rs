//! In-memory store backends over `tokio::sync::RwLock` maps.
//!
//! These back the tests and the demo binary. The concurrency contract is
//! the same one a database backend would give: the version predicate is
//! checked and the version bumped under one write lock, so at most one
//! writer wins any given version.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    ApprovalDecision, ApprovalRequest, ApprovalStatus, Checkpoint, EventType, NewTicket, Ticket,
    TicketEvent, TicketStatus, TicketUpdate,
};
use crate::store::{ApprovalStore, CheckpointStore, EventStore, TicketStore};

/// Tickets keyed by id.
#[derive(Default)]
pub struct InMemoryTicketStore {
    tickets: RwLock<HashMap<Uuid, Ticket>>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn create(&self, ticket: NewTicket) -> Result<Ticket, StoreError> {
        let now = Utc::now();
        let row = Ticket {
            id: ticket.id,
            customer_id: ticket.customer_id,
            subject: ticket.subject,
            body: ticket.body,
            status: TicketStatus::Pending,
            version: 1,
            attempt_count: 0,
            worker_id: None,
            last_heartbeat: None,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        let mut tickets = self.tickets.write().await;
        tickets.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Ticket>, StoreError> {
        let tickets = self.tickets.read().await;
        Ok(tickets.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Ticket>, StoreError> {
        let tickets = self.tickets.read().await;
        let mut rows: Vec<Ticket> = tickets.values().cloned().collect();
        rows.sort_by_key(|t| t.created_at);
        Ok(rows)
    }

    async fn update(
        &self,
        id: Uuid,
        update: TicketUpdate,
        expected_version: Option<u64>,
    ) -> Result<Ticket, StoreError> {
        let mut tickets = self.tickets.write().await;
        let row = tickets.get_mut(&id).ok_or(StoreError::TicketNotFound(id))?;

        if let Some(expected) = expected_version {
            if row.version != expected {
                return Err(StoreError::VersionConflict { id, expected });
            }
        }

        if let Some(status) = update.status {
            row.status = status;
        }
        if let Some(worker_id) = update.worker_id {
            row.worker_id = worker_id;
        }
        if let Some(heartbeat) = update.last_heartbeat {
            row.last_heartbeat = Some(heartbeat);
        }
        if let Some(error) = update.last_error {
            row.last_error = Some(error);
        }
        if let Some(result) = update.result {
            row.result = Some(result);
        }
        if let Some(attempts) = update.attempt_count {
            row.attempt_count = attempts;
        }
        if let Some(started) = update.started_at {
            row.started_at = Some(started);
        }
        if let Some(completed) = update.completed_at {
            row.completed_at = Some(completed);
        }

        row.version += 1;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn update_heartbeat(&self, id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let mut tickets = self.tickets.write().await;
        let row = tickets.get_mut(&id).ok_or(StoreError::TicketNotFound(id))?;
        // Only the holder refreshes; a worker that lost the ticket must not
        // revive its staleness clock.
        if row.worker_id.as_deref() == Some(worker_id) {
            row.last_heartbeat = Some(Utc::now());
            row.version += 1;
            row.updated_at = Utc::now();
        }
        Ok(())
    }
}

/// One checkpoint per ticket.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<Uuid, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn upsert(
        &self,
        ticket_id: Uuid,
        current_step: &str,
        state: Value,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut checkpoints = self.checkpoints.write().await;
        match checkpoints.get_mut(&ticket_id) {
            Some(row) => {
                let Some(expected) = expected_version else {
                    // writer thinks it is first; someone else already wrote
                    return Err(StoreError::VersionConflict {
                        id: ticket_id,
                        expected: 0,
                    });
                };
                if row.version != expected {
                    return Err(StoreError::VersionConflict {
                        id: ticket_id,
                        expected,
                    });
                }
                row.current_step = current_step.to_string();
                row.state = state;
                row.version += 1;
                row.updated_at = Utc::now();
                Ok(row.version)
            }
            None => {
                if let Some(expected) = expected_version {
                    // checkpoint was deleted under the writer
                    return Err(StoreError::VersionConflict {
                        id: ticket_id,
                        expected,
                    });
                }
                checkpoints.insert(
                    ticket_id,
                    Checkpoint {
                        ticket_id,
                        current_step: current_step.to_string(),
                        state,
                        version: 1,
                        updated_at: Utc::now(),
                    },
                );
                Ok(1)
            }
        }
    }

    async fn get(&self, ticket_id: Uuid) -> Result<Option<Checkpoint>, StoreError> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(&ticket_id).cloned())
    }

    async fn delete(&self, ticket_id: Uuid) -> Result<(), StoreError> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.remove(&ticket_id);
        Ok(())
    }
}

/// Append-only event log.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<TicketEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        ticket_id: Uuid,
        event_type: EventType,
        step_name: Option<&str>,
        payload: Value,
    ) -> Result<TicketEvent, StoreError> {
        let mut events = self.events.write().await;
        let event = TicketEvent {
            id: events.len() as u64 + 1,
            ticket_id,
            event_type,
            step_name: step_name.map(String::from),
            payload,
            created_at: Utc::now(),
        };
        events.push(event.clone());
        Ok(event)
    }

    async fn list_for_ticket(&self, ticket_id: Uuid) -> Result<Vec<TicketEvent>, StoreError> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| e.ticket_id == ticket_id)
            .cloned()
            .collect())
    }
}

/// Approval requests keyed by id.
#[derive(Default)]
pub struct InMemoryApprovalStore {
    requests: RwLock<HashMap<Uuid, ApprovalRequest>>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn create(
        &self,
        ticket_id: Uuid,
        action_type: &str,
        params: Value,
    ) -> Result<ApprovalRequest, StoreError> {
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            ticket_id,
            action_type: action_type.to_string(),
            params,
            status: ApprovalStatus::Pending,
            decided_by: None,
            reason: None,
            created_at: Utc::now(),
            decided_at: None,
        };
        let mut requests = self.requests.write().await;
        requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>, StoreError> {
        let requests = self.requests.read().await;
        Ok(requests.get(&id).cloned())
    }

    async fn list_pending(&self) -> Result<Vec<ApprovalRequest>, StoreError> {
        let requests = self.requests.read().await;
        let mut pending: Vec<ApprovalRequest> = requests
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }

    async fn list_for_ticket(&self, ticket_id: Uuid) -> Result<Vec<ApprovalRequest>, StoreError> {
        let requests = self.requests.read().await;
        let mut rows: Vec<ApprovalRequest> = requests
            .values()
            .filter(|r| r.ticket_id == ticket_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn decide(
        &self,
        id: Uuid,
        decision: ApprovalDecision,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        let mut requests = self.requests.write().await;
        let row = requests.get_mut(&id).ok_or(StoreError::ApprovalNotFound(id))?;

        if row.status.is_decided() {
            return Ok(None);
        }

        row.status = if decision.approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        row.decided_by = Some(decision.decided_by);
        row.reason = decision.reason;
        row.decided_at = Some(Utc::now());
        Ok(Some(row.clone()))
    }
}
