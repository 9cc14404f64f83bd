//! The human approval gate.
//!
//! Workers create requests here when a step proposes an approval-tagged
//! action; humans decide them here. A first decision folds the outcome
//! into the ticket's checkpoint and re-enqueues it so a worker resumes
//! at the dispatch step. Duplicate decisions are idempotent: they return
//! the original outcome and cause no second event or enqueue.

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{EngineError, StoreError};
use crate::model::{ApprovalDecision, ApprovalRequest, EventType, TicketStatus};
use crate::queue::WorkQueue;
use crate::store::{ApprovalStore, CheckpointStore, EngineStores, EventStore, TicketStore};
use crate::workflow::state::ApprovalOutcome;
use crate::workflow::WorkflowState;

/// Outcome of a decide call.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub request: ApprovalRequest,
    /// True when the request had already been decided; the stored
    /// decision is returned unchanged.
    pub duplicate: bool,
}

#[derive(Clone)]
pub struct ApprovalGate {
    stores: EngineStores,
    queue: Arc<dyn WorkQueue>,
}

impl ApprovalGate {
    pub fn new(stores: EngineStores, queue: Arc<dyn WorkQueue>) -> Self {
        Self { stores, queue }
    }

    /// Create a request for a ticket that is currently processing.
    pub async fn create_request(
        &self,
        ticket_id: Uuid,
        action_type: &str,
        params: Value,
    ) -> Result<ApprovalRequest, EngineError> {
        let ticket = self
            .stores
            .tickets
            .get(ticket_id)
            .await?
            .ok_or(StoreError::TicketNotFound(ticket_id))?;
        if ticket.status != TicketStatus::Processing {
            return Err(EngineError::NotProcessing {
                id: ticket_id,
                status: ticket.status.to_string(),
            });
        }
        let request = self
            .stores
            .approvals
            .create(ticket_id, action_type, params)
            .await?;
        tracing::info!(
            %ticket_id,
            approval_id = %request.id,
            action_type,
            "approval request created"
        );
        Ok(request)
    }

    /// Requests still waiting on a human, oldest first.
    pub async fn list_pending(&self) -> Result<Vec<ApprovalRequest>, EngineError> {
        Ok(self.stores.approvals.list_pending().await?)
    }

    pub async fn get(&self, request_id: Uuid) -> Result<Option<ApprovalRequest>, EngineError> {
        Ok(self.stores.approvals.get(request_id).await?)
    }

    /// Decide a pending request. First decision wins; repeats return the
    /// stored outcome with `duplicate` set.
    pub async fn decide(
        &self,
        request_id: Uuid,
        approved: bool,
        decided_by: &str,
        reason: Option<String>,
    ) -> Result<DecisionOutcome, EngineError> {
        let decision = ApprovalDecision {
            approved,
            decided_by: decided_by.to_string(),
            reason: reason.clone(),
        };

        let Some(decided) = self.stores.approvals.decide(request_id, decision).await? else {
            // already decided: idempotent, no event, no enqueue
            let request = self
                .stores
                .approvals
                .get(request_id)
                .await?
                .ok_or(StoreError::ApprovalNotFound(request_id))?;
            tracing::debug!(approval_id = %request_id, "duplicate decision ignored");
            return Ok(DecisionOutcome {
                request,
                duplicate: true,
            });
        };

        let ticket_id = decided.ticket_id;
        self.stores
            .events
            .append(
                ticket_id,
                EventType::ApprovalDecision,
                None,
                json!({
                    "approval_id": decided.id,
                    "action_type": decided.action_type,
                    "approved": approved,
                    "decided_by": decided_by,
                    "reason": reason,
                }),
            )
            .await?;

        // Fold the outcome into the checkpoint so resume is a pure
        // function of stored state. Read-modify-write under the checkpoint
        // version; a conflict means a concurrent writer, so re-read.
        loop {
            let Some(cp) = self.stores.checkpoints.get(ticket_id).await? else {
                tracing::warn!(%ticket_id, "decided approval but ticket has no checkpoint");
                break;
            };
            let mut state: WorkflowState =
                serde_json::from_value(cp.state).map_err(StoreError::Serialization)?;
            state.approval_decision = Some(ApprovalOutcome {
                action_type: decided.action_type.clone(),
                params: decided.params.clone(),
                approved,
                decided_by: decided_by.to_string(),
                reason: reason.clone(),
            });
            state.pending_approval = None;
            let blob = serde_json::to_value(&state).map_err(StoreError::Serialization)?;
            match self
                .stores
                .checkpoints
                .upsert(ticket_id, &cp.current_step, blob, Some(cp.version))
                .await
            {
                Ok(_) => break,
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.queue.enqueue(ticket_id, 1).await?;
        tracing::info!(
            %ticket_id,
            approval_id = %request_id,
            approved,
            decided_by,
            "approval decided, ticket re-enqueued"
        );
        Ok(DecisionOutcome {
            request: decided,
            duplicate: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::model::NewTicket;
    use crate::queue::InMemoryQueue;
    use crate::workflow::StepName;

    async fn setup() -> (ApprovalGate, EngineStores, Arc<InMemoryQueue>, Uuid) {
        let stores = EngineStores::in_memory();
        let queue = Arc::new(InMemoryQueue::new(QueueConfig::default()));
        let gate = ApprovalGate::new(stores.clone(), Arc::clone(&queue) as Arc<dyn WorkQueue>);

        let ticket = stores
            .tickets
            .create(NewTicket {
                id: Uuid::new_v4(),
                customer_id: "cust_1".to_string(),
                subject: "Refund".to_string(),
                body: "refund $10 for ord_1".to_string(),
            })
            .await
            .unwrap();
        stores
            .tickets
            .acquire_for_processing(ticket.id, "worker-a", ticket.version)
            .await
            .unwrap();
        (gate, stores, queue, ticket.id)
    }

    #[tokio::test]
    async fn test_create_requires_processing_status() {
        let (gate, stores, _queue, ticket_id) = setup().await;

        // processing: ok
        gate.create_request(ticket_id, "process_refund", json!({}))
            .await
            .unwrap();

        // completed: refused
        stores
            .tickets
            .mark_completed(ticket_id, "worker-a", json!({}))
            .await
            .unwrap();
        let err = gate
            .create_request(ticket_id, "process_refund", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotProcessing { .. }));
    }

    #[tokio::test]
    async fn test_decide_folds_into_checkpoint_and_enqueues() {
        let (gate, stores, queue, ticket_id) = setup().await;

        let state = WorkflowState {
            customer_id: "cust_1".to_string(),
            subject: "Refund".to_string(),
            body: "refund $10 for ord_1".to_string(),
            classification: Some("billing".to_string()),
            entities: None,
            research_results: Vec::new(),
            draft_response: None,
            review_notes: None,
            final_response: None,
            actions_taken: Vec::new(),
            pending_tools: Vec::new(),
            resume_step: Some(StepName::Review),
            pending_approval: None,
            approval_decision: None,
        };
        stores
            .checkpoints
            .upsert(
                ticket_id,
                StepName::DispatchTools.as_str(),
                serde_json::to_value(&state).unwrap(),
                None,
            )
            .await
            .unwrap();

        let request = gate
            .create_request(ticket_id, "process_refund", json!({"amount": 10.0}))
            .await
            .unwrap();
        let outcome = gate
            .decide(request.id, true, "agent_smith", Some("valid claim".to_string()))
            .await
            .unwrap();
        assert!(!outcome.duplicate);

        let cp = stores.checkpoints.get(ticket_id).await.unwrap().unwrap();
        assert_eq!(cp.current_step, "dispatch_tools");
        let folded: WorkflowState = serde_json::from_value(cp.state).unwrap();
        let decision = folded.approval_decision.unwrap();
        assert!(decision.approved);
        assert_eq!(decision.decided_by, "agent_smith");
        assert!(folded.pending_approval.is_none());

        // re-enqueued exactly once
        assert_eq!(queue.stats().await.ready, 1);
    }

    #[tokio::test]
    async fn test_duplicate_decide_is_idempotent() {
        let (gate, stores, queue, ticket_id) = setup().await;
        stores
            .checkpoints
            .upsert(
                ticket_id,
                "dispatch_tools",
                json!({
                    "customer_id": "cust_1", "subject": "s", "body": "b"
                }),
                None,
            )
            .await
            .unwrap();

        let request = gate
            .create_request(ticket_id, "process_refund", json!({}))
            .await
            .unwrap();

        let first = gate.decide(request.id, false, "agent_a", None).await.unwrap();
        let second = gate.decide(request.id, true, "agent_b", None).await.unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        // the stored decision is the first one
        assert_eq!(second.request.decided_by.as_deref(), Some("agent_a"));

        // one decision event, one enqueue
        let events = stores.events.list_for_ticket(ticket_id).await.unwrap();
        let decisions = events
            .iter()
            .filter(|e| e.event_type == EventType::ApprovalDecision)
            .count();
        assert_eq!(decisions, 1);
        assert_eq!(queue.stats().await.ready, 1);
    }

    #[tokio::test]
    async fn test_decide_unknown_request_errors() {
        let (gate, _stores, _queue, _ticket_id) = setup().await;
        let err = gate.decide(Uuid::new_v4(), true, "agent", None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Store(StoreError::ApprovalNotFound(_))
        ));
    }
}
