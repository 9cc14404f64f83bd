//! Approval gate scenarios: suspend, decide, resume, and the idempotence
//! guarantees around human decisions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use ticketflow::approval::ApprovalGate;
use ticketflow::config::{QueueConfig, WorkerConfig};
use ticketflow::ingest::{TicketIngest, TicketIntake};
use ticketflow::model::{ApprovalStatus, EventType, TicketStatus};
use ticketflow::queue::{InMemoryQueue, WorkQueue};
use ticketflow::store::{ApprovalStore, EngineStores, EventStore, TicketStore};
use ticketflow::worker::Worker;
use ticketflow::workflow::SupportPipeline;

struct Harness {
    stores: EngineStores,
    queue: Arc<InMemoryQueue>,
    ingest: TicketIngest,
    gate: ApprovalGate,
    shutdown: watch::Sender<bool>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

fn start(worker_count: usize) -> Harness {
    let stores = EngineStores::in_memory();
    let queue = Arc::new(InMemoryQueue::new(QueueConfig {
        in_flight_timeout_secs: 5,
        max_redeliveries: 10,
        retry_delay_ms: 10,
    }));
    let queue_dyn: Arc<dyn WorkQueue> = queue.clone();
    let executor = Arc::new(SupportPipeline::with_defaults());
    let (tx, rx) = watch::channel(false);

    let workers = (0..worker_count)
        .map(|n| {
            let worker = Worker::new(
                format!("worker-{n}"),
                WorkerConfig::default(),
                stores.clone(),
                Arc::clone(&queue_dyn),
                executor.clone() as Arc<dyn ticketflow::StepExecutor>,
                rx.clone(),
            );
            tokio::spawn(worker.run())
        })
        .collect();

    let ingest = TicketIngest::new(stores.clone(), Arc::clone(&queue_dyn));
    let gate = ApprovalGate::new(stores.clone(), queue_dyn);
    Harness {
        stores,
        queue,
        ingest,
        gate,
        shutdown: tx,
        workers,
    }
}

async fn stop(harness: Harness) {
    let _ = harness.shutdown.send(true);
    harness.queue.close().await;
    for handle in harness.workers {
        let _ = handle.await;
    }
}

async fn wait_for_status(
    stores: &EngineStores,
    id: Uuid,
    status: TicketStatus,
) -> ticketflow::model::Ticket {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(ticket) = stores.tickets.get(id).await.unwrap() {
            if ticket.status == status {
                return ticket;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for status {status}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn refund_intake() -> TicketIntake {
    TicketIntake {
        customer_id: "cust_100".to_string(),
        subject: "Refund for damaged blender".to_string(),
        body: "Order ord_55 arrived shattered. Please refund $89.50.".to_string(),
    }
}

#[tokio::test]
async fn test_refund_suspends_then_approval_completes() {
    let harness = start(1);

    let outcome = harness.ingest.submit(refund_intake()).await.unwrap();
    let id = outcome.ticket.id;

    // pipeline runs until the refund needs a human
    wait_for_status(&harness.stores, id, TicketStatus::AwaitingApproval).await;
    let pending = harness.gate.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    let request = &pending[0];
    assert_eq!(request.ticket_id, id);
    assert_eq!(request.action_type, "process_refund");
    assert_eq!(request.params["order_id"], "ord_55");
    assert_eq!(request.params["amount"], 89.5);

    // nothing executed yet
    let cp = harness.stores.checkpoints.get(id).await.unwrap().unwrap();
    assert_eq!(cp.current_step, "dispatch_tools");
    assert_eq!(cp.state["actions_taken"].as_array().map_or(0, |a| {
        a.iter().filter(|r| r["tool"] == "process_refund").count()
    }), 0);

    let decision = harness
        .gate
        .decide(request.id, true, "agent_smith", Some("valid claim".to_string()))
        .await
        .unwrap();
    assert!(!decision.duplicate);
    assert_eq!(decision.request.status, ApprovalStatus::Approved);

    let done = wait_for_status(&harness.stores, id, TicketStatus::Completed).await;
    let result = done.result.unwrap();
    let response = result["final_response"].as_str().unwrap();
    assert!(response.contains("Refund of $89.50 processed for order ord_55"));
    let refund_runs = result["actions_taken"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|a| a["tool"] == "process_refund")
        .count();
    // approved action executed exactly once
    assert_eq!(refund_runs, 1);

    stop(harness).await;
}

#[tokio::test]
async fn test_rejection_completes_without_claiming_action() {
    let harness = start(1);

    let outcome = harness.ingest.submit(refund_intake()).await.unwrap();
    let id = outcome.ticket.id;

    wait_for_status(&harness.stores, id, TicketStatus::AwaitingApproval).await;
    let request = harness.gate.list_pending().await.unwrap().remove(0);

    harness
        .gate
        .decide(request.id, false, "agent_jones", Some("policy limit".to_string()))
        .await
        .unwrap();

    let done = wait_for_status(&harness.stores, id, TicketStatus::Completed).await;
    let result = done.result.unwrap();
    let response = result["final_response"].as_str().unwrap();
    assert!(response.contains("could not be approved"));
    assert!(!response.contains("Refund of $"));
    let refund_runs = result["actions_taken"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|a| a["tool"] == "process_refund")
        .count();
    assert_eq!(refund_runs, 0);

    stop(harness).await;
}

#[tokio::test]
async fn test_duplicate_decide_returns_original_outcome() {
    let harness = start(1);

    let outcome = harness.ingest.submit(refund_intake()).await.unwrap();
    let id = outcome.ticket.id;

    wait_for_status(&harness.stores, id, TicketStatus::AwaitingApproval).await;
    let request = harness.gate.list_pending().await.unwrap().remove(0);

    let first = harness
        .gate
        .decide(request.id, true, "agent_a", None)
        .await
        .unwrap();
    let second = harness
        .gate
        .decide(request.id, false, "agent_b", Some("changed my mind".to_string()))
        .await
        .unwrap();

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(second.request.status, ApprovalStatus::Approved);
    assert_eq!(second.request.decided_by.as_deref(), Some("agent_a"));

    wait_for_status(&harness.stores, id, TicketStatus::Completed).await;

    // one decision event, despite two decide calls
    let events = harness.stores.events.list_for_ticket(id).await.unwrap();
    let decisions = events
        .iter()
        .filter(|e| e.event_type == EventType::ApprovalDecision)
        .count();
    assert_eq!(decisions, 1);

    stop(harness).await;
}

#[tokio::test]
async fn test_spurious_delivery_does_not_resume_suspended_ticket() {
    let harness = start(1);

    let outcome = harness.ingest.submit(refund_intake()).await.unwrap();
    let id = outcome.ticket.id;

    wait_for_status(&harness.stores, id, TicketStatus::AwaitingApproval).await;

    // a stray message for the suspended ticket must be discarded
    harness.queue.enqueue(id, 9).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let ticket = harness.stores.tickets.get(id).await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::AwaitingApproval);
    let request = harness.gate.list_pending().await.unwrap().remove(0);
    assert_eq!(request.status, ApprovalStatus::Pending);

    // the real resume still works afterwards
    harness
        .gate
        .decide(request.id, true, "agent_smith", None)
        .await
        .unwrap();
    wait_for_status(&harness.stores, id, TicketStatus::Completed).await;

    stop(harness).await;
}

#[tokio::test]
async fn test_approvals_listed_per_ticket_newest_first() {
    let harness = start(0); // no workers; drive stores directly
    let stores = &harness.stores;

    let ticket = stores
        .tickets
        .create(ticketflow::model::NewTicket {
            id: Uuid::new_v4(),
            customer_id: "cust_200".to_string(),
            subject: "s".to_string(),
            body: "b".to_string(),
        })
        .await
        .unwrap();

    let a = stores
        .approvals
        .create(ticket.id, "process_refund", serde_json::json!({}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let b = stores
        .approvals
        .create(ticket.id, "process_refund", serde_json::json!({}))
        .await
        .unwrap();

    let listed = stores.approvals.list_for_ticket(ticket.id).await.unwrap();
    assert_eq!(listed[0].id, b.id);
    assert_eq!(listed[1].id, a.id);

    stop(harness).await;
}
