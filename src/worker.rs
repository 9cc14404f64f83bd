//! The worker: consumes queue messages and drives tickets through the
//! pipeline.
//!
//! One message, one claim attempt. The worker that wins the optimistic
//! claim drives steps until the ticket completes, suspends on approval,
//! or fails; every step boundary persists a checkpoint, an event, and a
//! heartbeat, so a crash at any point is recoverable by the next
//! delivery.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::config::WorkerConfig;
use crate::error::{EngineError, QueueError, StoreError};
use crate::model::{TicketStatus, TicketUpdate};
use crate::queue::{Delivery, WorkQueue};
use crate::store::{
    ApprovalStore, CheckpointStore, EngineStores, EventStore, TicketStore,
};
use crate::workflow::state::PendingApproval;
use crate::workflow::tools::ToolCall;
use crate::workflow::{FailureKind, Signal, StepExecutor, StepName, WorkflowState};

/// What to do with the delivery after handling.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Ack,
    Requeue,
}

/// Aborts the heartbeat task when the ticket is released.
struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct Worker {
    worker_id: String,
    config: WorkerConfig,
    stores: EngineStores,
    queue: Arc<dyn WorkQueue>,
    executor: Arc<dyn StepExecutor>,
    gate: ApprovalGate,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<String>,
        config: WorkerConfig,
        stores: EngineStores,
        queue: Arc<dyn WorkQueue>,
        executor: Arc<dyn StepExecutor>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let gate = ApprovalGate::new(stores.clone(), Arc::clone(&queue));
        Self {
            worker_id: worker_id.into(),
            config,
            stores,
            queue,
            executor,
            gate,
            shutdown,
        }
    }

    /// Consume until shutdown is signalled or the queue closes.
    pub async fn run(mut self) {
        tracing::info!(worker_id = %self.worker_id, "worker started");
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                delivery = self.queue.consume() => {
                    let delivery = match delivery {
                        Ok(d) => d,
                        Err(QueueError::Closed) => break,
                        Err(e) => {
                            tracing::error!(error = %e, "consume failed");
                            break;
                        }
                    };
                    self.settle(&delivery).await;
                }
            }
        }
        tracing::info!(worker_id = %self.worker_id, "worker stopped");
    }

    async fn settle(&self, delivery: &Delivery) {
        let ticket_id = delivery.message.ticket_id;
        let outcome = match self.handle(delivery).await {
            Ok(disposition) => disposition,
            Err(e) => {
                // transport-level trouble: let redelivery have another go
                tracing::error!(%ticket_id, error = %e, "message handling failed");
                Disposition::Requeue
            }
        };
        let result = match outcome {
            Disposition::Ack => self.queue.ack(delivery).await,
            Disposition::Requeue => self.queue.nack(delivery, true).await,
        };
        if let Err(e) = result {
            tracing::warn!(%ticket_id, error = %e, "queue settle failed");
        }
    }

    /// The per-message algorithm: dedupe, claim, resume, drive.
    async fn handle(&self, delivery: &Delivery) -> Result<Disposition, EngineError> {
        let ticket_id = delivery.message.ticket_id;

        let Some(ticket) = self.stores.tickets.get(ticket_id).await? else {
            tracing::warn!(%ticket_id, "message for unknown ticket, discarding");
            return Ok(Disposition::Ack);
        };

        // duplicate deliveries of finished work are dropped silently
        if ticket.status.is_terminal() {
            tracing::debug!(%ticket_id, status = %ticket.status, "ticket already terminal");
            return Ok(Disposition::Ack);
        }

        if ticket.status == TicketStatus::Processing && !self.is_stale(&ticket) {
            tracing::debug!(%ticket_id, "ticket held by an active worker, requeueing");
            return Ok(Disposition::Requeue);
        }

        if ticket.status == TicketStatus::AwaitingApproval {
            // only the gate's re-enqueue resumes a suspended ticket
            let newest = self
                .stores
                .approvals
                .list_for_ticket(ticket_id)
                .await?
                .into_iter()
                .next();
            if !newest.is_some_and(|r| r.status.is_decided()) {
                tracing::debug!(%ticket_id, "approval still pending, discarding delivery");
                return Ok(Disposition::Ack);
            }
        }

        match self
            .stores
            .tickets
            .acquire_for_processing(ticket_id, &self.worker_id, ticket.version)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                tracing::debug!(%ticket_id, "lost claim race");
                return Ok(Disposition::Ack);
            }
            Err(e) => return Err(e.into()),
        }
        self.stores
            .events
            .log_status_change(ticket_id, ticket.status, TicketStatus::Processing)
            .await?;
        tracing::info!(
            %ticket_id,
            worker_id = %self.worker_id,
            attempt = delivery.message.attempt,
            "claimed ticket"
        );

        self.drive(ticket_id).await
    }

    /// Run steps from the checkpoint until a terminal signal.
    async fn drive(&self, ticket_id: Uuid) -> Result<Disposition, EngineError> {
        let (mut step, mut state, mut cp_version) = self.load_resume_point(ticket_id).await?;
        let _heartbeat = self.spawn_heartbeat(ticket_id);

        loop {
            if *self.shutdown.borrow() {
                // release the claim so the redelivery can be picked up cleanly
                self.stores
                    .tickets
                    .commit_held(
                        ticket_id,
                        &self.worker_id,
                        TicketUpdate {
                            status: Some(TicketStatus::Pending),
                            worker_id: Some(None),
                            ..TicketUpdate::default()
                        },
                    )
                    .await?;
                tracing::info!(%ticket_id, "shutdown requested, releasing ticket");
                return Ok(Disposition::Requeue);
            }

            let signal = match tokio::time::timeout(
                self.config.step_timeout(),
                self.executor.execute(step, &mut state),
            )
            .await
            {
                Ok(signal) => signal,
                Err(_) => Signal::Failed(FailureKind::Transient(format!(
                    "step {step} timed out after {}s",
                    self.config.step_timeout_secs
                ))),
            };

            match signal {
                Signal::Continue(next) => {
                    cp_version = Some(self.checkpoint(ticket_id, next, &state, cp_version).await?);
                    self.stores
                        .events
                        .log_step_complete(ticket_id, step.as_str(), json!({ "next": next.as_str() }))
                        .await?;
                    self.stores
                        .tickets
                        .update_heartbeat(ticket_id, &self.worker_id)
                        .await?;
                    step = next;
                }
                Signal::NeedsTools(calls) => {
                    let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
                    self.stores
                        .events
                        .log_step_complete(
                            ticket_id,
                            step.as_str(),
                            json!({ "requested_tools": names }),
                        )
                        .await?;
                    for call in calls {
                        if !state.pending_tools.iter().any(|c| c.name == call.name) {
                            state.pending_tools.push(call);
                        }
                    }
                    state.resume_step = Some(step);
                    cp_version = Some(
                        self.checkpoint(ticket_id, StepName::DispatchTools, &state, cp_version)
                            .await?,
                    );
                    self.stores
                        .tickets
                        .update_heartbeat(ticket_id, &self.worker_id)
                        .await?;
                    step = StepName::DispatchTools;
                }
                Signal::NeedsApproval { action_type, params } => {
                    return self
                        .suspend_for_approval(ticket_id, cp_version, step, state, action_type, params)
                        .await;
                }
                Signal::Done(result) => {
                    self.stores
                        .tickets
                        .mark_completed(ticket_id, &self.worker_id, result)
                        .await?;
                    self.stores
                        .events
                        .log_status_change(ticket_id, TicketStatus::Processing, TicketStatus::Completed)
                        .await?;
                    self.stores.checkpoints.delete(ticket_id).await?;
                    tracing::info!(%ticket_id, "ticket completed");
                    return Ok(Disposition::Ack);
                }
                Signal::Failed(kind) => {
                    return self.fail(ticket_id, step, &kind).await;
                }
            }
        }
    }

    async fn load_resume_point(
        &self,
        ticket_id: Uuid,
    ) -> Result<(StepName, WorkflowState, Option<u64>), EngineError> {
        match self.stores.checkpoints.get(ticket_id).await? {
            Some(cp) => {
                let step: StepName = cp.current_step.parse()?;
                let state: WorkflowState =
                    serde_json::from_value(cp.state).map_err(StoreError::Serialization)?;
                tracing::debug!(%ticket_id, step = %step, "resuming from checkpoint");
                Ok((step, state, Some(cp.version)))
            }
            None => {
                let ticket = self
                    .stores
                    .tickets
                    .get(ticket_id)
                    .await?
                    .ok_or(StoreError::TicketNotFound(ticket_id))?;
                Ok((StepName::initial(), WorkflowState::for_ticket(&ticket), None))
            }
        }
    }

    async fn checkpoint(
        &self,
        ticket_id: Uuid,
        next_step: StepName,
        state: &WorkflowState,
        expected_version: Option<u64>,
    ) -> Result<u64, EngineError> {
        let blob = serde_json::to_value(state).map_err(StoreError::Serialization)?;
        let version = self
            .stores
            .checkpoints
            .upsert(ticket_id, next_step.as_str(), blob, expected_version)
            .await?;
        Ok(version)
    }

    async fn suspend_for_approval(
        &self,
        ticket_id: Uuid,
        cp_version: Option<u64>,
        step: StepName,
        mut state: WorkflowState,
        action_type: String,
        params: serde_json::Value,
    ) -> Result<Disposition, EngineError> {
        if step != StepName::DispatchTools {
            state.resume_step = Some(step);
        }
        if !state.pending_tools.iter().any(|c| c.name == action_type) {
            state
                .pending_tools
                .push(ToolCall::new(&action_type, params.clone()));
        }
        state.pending_approval = Some(PendingApproval {
            action_type: action_type.clone(),
            params: params.clone(),
        });
        // checkpoint first: once the status flips, resume must find the
        // dispatch step waiting
        self.checkpoint(ticket_id, StepName::DispatchTools, &state, cp_version)
            .await?;

        let request = self
            .gate
            .create_request(ticket_id, &action_type, params)
            .await?;
        self.stores
            .tickets
            .mark_awaiting_approval(ticket_id, &self.worker_id)
            .await?;
        self.stores
            .events
            .log_status_change(
                ticket_id,
                TicketStatus::Processing,
                TicketStatus::AwaitingApproval,
            )
            .await?;
        tracing::info!(
            %ticket_id,
            approval_id = %request.id,
            action_type = %action_type,
            "suspended awaiting approval"
        );
        Ok(Disposition::Ack)
    }

    async fn fail(
        &self,
        ticket_id: Uuid,
        step: StepName,
        kind: &FailureKind,
    ) -> Result<Disposition, EngineError> {
        self.stores
            .events
            .log_error(ticket_id, kind.message(), Some(step.as_str()))
            .await?;

        if kind.is_transient() {
            let current = self
                .stores
                .tickets
                .get(ticket_id)
                .await?
                .ok_or(StoreError::TicketNotFound(ticket_id))?;
            let attempts = current.attempt_count + 1;
            if attempts < self.config.max_retries {
                self.stores
                    .tickets
                    .record_retry(ticket_id, kind.message())
                    .await?;
                self.stores
                    .events
                    .log_retry(ticket_id, attempts, kind.message())
                    .await?;
                tracing::warn!(
                    %ticket_id,
                    attempt = attempts,
                    error = kind.message(),
                    "transient failure, requeueing"
                );
                return Ok(Disposition::Requeue);
            }
            // retries exhausted; commit the terminal state while still held
            self.stores
                .tickets
                .mark_failed_permanent(ticket_id, &self.worker_id, kind.message(), Some(attempts))
                .await?;
            self.stores
                .events
                .log_status_change(ticket_id, TicketStatus::Processing, TicketStatus::FailedPermanent)
                .await?;
            tracing::error!(%ticket_id, error = kind.message(), "retries exhausted");
            return Ok(Disposition::Ack);
        }

        self.stores
            .tickets
            .mark_failed_permanent(ticket_id, &self.worker_id, kind.message(), None)
            .await?;
        self.stores
            .events
            .log_status_change(ticket_id, TicketStatus::Processing, TicketStatus::FailedPermanent)
            .await?;
        tracing::error!(%ticket_id, error = kind.message(), "permanent failure");
        Ok(Disposition::Ack)
    }

    fn is_stale(&self, ticket: &crate::model::Ticket) -> bool {
        let Some(heartbeat) = ticket.last_heartbeat else {
            return true;
        };
        let age = Utc::now()
            .signed_duration_since(heartbeat)
            .to_std()
            .unwrap_or_default();
        age > self.config.stale_threshold()
    }

    fn spawn_heartbeat(&self, ticket_id: Uuid) -> HeartbeatGuard {
        let tickets = Arc::clone(&self.stores.tickets);
        let worker_id = self.worker_id.clone();
        let interval = self.config.heartbeat_interval();
        HeartbeatGuard {
            handle: tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.tick().await; // first tick fires immediately
                loop {
                    tick.tick().await;
                    if let Err(e) = tickets.update_heartbeat(ticket_id, &worker_id).await {
                        tracing::warn!(%ticket_id, error = %e, "heartbeat update failed");
                    }
                }
            }),
        }
    }
}
