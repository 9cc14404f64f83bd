//! ticketflow - durable, resumable customer-support ticket processing.
//!
//! Tickets are ingested once, queued, and driven through a checkpointed
//! step pipeline by competing workers. Optimistic locking makes claims
//! race-safe, checkpoints make crashes recoverable, the approval gate
//! suspends side-effecting actions on a human decision, and the
//! reconciler re-enqueues work abandoned by dead workers.

pub mod approval;
pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod queue;
pub mod reconciler;
pub mod store;
pub mod worker;
pub mod workflow;

pub use approval::{ApprovalGate, DecisionOutcome};
pub use config::EngineConfig;
pub use error::{EngineError, QueueError, StoreError};
pub use ingest::{deterministic_ticket_id, SubmitOutcome, TicketIngest, TicketIntake};
pub use model::{ApprovalRequest, ApprovalStatus, Ticket, TicketEvent, TicketStatus};
pub use queue::{InMemoryQueue, WorkQueue};
pub use reconciler::Reconciler;
pub use store::EngineStores;
pub use worker::Worker;
pub use workflow::{Signal, StepExecutor, StepName, SupportPipeline, WorkflowState};
