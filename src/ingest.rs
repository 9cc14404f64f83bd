//! Idempotent ticket ingestion.
//!
//! The ticket id is a deterministic function of the submission content,
//! so submitting the same ticket twice returns the first ticket instead
//! of creating a duplicate.

use std::sync::Arc;

use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{EventType, NewTicket, Ticket};
use crate::queue::WorkQueue;
use crate::store::{EngineStores, EventStore, TicketStore};

/// Namespace for content-derived ticket ids.
const TICKET_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0xa7, 0xb8, 0x10, 0x9d, 0xad, 0x11, 0xd1, 0x80, 0xb4, 0x00, 0xc0, 0x4f, 0xd4, 0x30,
    0xc8,
]);

/// An incoming ticket submission.
#[derive(Debug, Clone)]
pub struct TicketIntake {
    pub customer_id: String,
    pub subject: String,
    pub body: String,
}

/// Result of a submit call.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub ticket: Ticket,
    /// True when the ticket already existed and nothing was enqueued.
    pub duplicate: bool,
}

/// Deterministic id: UUIDv5 over the hex SHA-256 digest of the submission.
pub fn deterministic_ticket_id(intake: &TicketIntake) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(intake.customer_id.as_bytes());
    hasher.update(b":");
    hasher.update(intake.subject.as_bytes());
    hasher.update(b":");
    hasher.update(intake.body.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    Uuid::new_v5(&TICKET_NAMESPACE, digest.as_bytes())
}

#[derive(Clone)]
pub struct TicketIngest {
    stores: EngineStores,
    queue: Arc<dyn WorkQueue>,
}

impl TicketIngest {
    pub fn new(stores: EngineStores, queue: Arc<dyn WorkQueue>) -> Self {
        Self { stores, queue }
    }

    /// Create-or-return: new submissions are persisted, logged, and
    /// enqueued; duplicates return the existing ticket untouched.
    pub async fn submit(&self, intake: TicketIntake) -> Result<SubmitOutcome, EngineError> {
        let id = deterministic_ticket_id(&intake);

        if let Some(existing) = self.stores.tickets.get(id).await? {
            tracing::debug!(ticket_id = %id, "duplicate submission");
            return Ok(SubmitOutcome {
                ticket: existing,
                duplicate: true,
            });
        }

        let ticket = self
            .stores
            .tickets
            .create(NewTicket {
                id,
                customer_id: intake.customer_id,
                subject: intake.subject,
                body: intake.body,
            })
            .await?;
        self.stores
            .events
            .append(
                id,
                EventType::Created,
                None,
                json!({ "customer_id": ticket.customer_id, "subject": ticket.subject }),
            )
            .await?;
        self.queue.enqueue(id, 1).await?;
        tracing::info!(ticket_id = %id, customer_id = %ticket.customer_id, "ticket submitted");

        Ok(SubmitOutcome {
            ticket,
            duplicate: false,
        })
    }
}
