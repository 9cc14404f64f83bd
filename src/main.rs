use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use ticketflow::config::EngineConfig;
use ticketflow::ingest::{TicketIngest, TicketIntake};
use ticketflow::logging::init_logging;
use ticketflow::queue::{InMemoryQueue, WorkQueue};
use ticketflow::reconciler::Reconciler;
use ticketflow::store::{EngineStores, EventStore, TicketStore};
use ticketflow::worker::Worker;
use ticketflow::workflow::SupportPipeline;
use ticketflow::ApprovalGate;

#[derive(Parser)]
#[command(name = "ticketflow")]
#[command(about = "Durable, resumable ticket processing engine")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run workers and the reconciler until interrupted
    Run {
        /// Number of concurrent workers
        #[arg(short, long, default_value_t = 2)]
        workers: usize,
    },

    /// Submit sample tickets and drive them to completion
    Demo,
}

struct Engine {
    stores: EngineStores,
    queue: Arc<InMemoryQueue>,
    ingest: TicketIngest,
    gate: ApprovalGate,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

/// Wire up stores, queue, workers, and the reconciler.
fn start_engine(config: &EngineConfig, workers: usize) -> Engine {
    let stores = EngineStores::in_memory();
    let queue = Arc::new(InMemoryQueue::new(config.queue.clone()));
    let queue_dyn: Arc<dyn WorkQueue> = queue.clone();
    let executor = Arc::new(SupportPipeline::with_defaults());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();
    for n in 0..workers {
        let worker = Worker::new(
            format!("worker-{n}"),
            config.worker.clone(),
            stores.clone(),
            Arc::clone(&queue_dyn),
            executor.clone() as Arc<dyn ticketflow::StepExecutor>,
            shutdown_rx.clone(),
        );
        handles.push(tokio::spawn(worker.run()));
    }

    let reconciler = Reconciler::new(
        stores.clone(),
        Arc::clone(&queue_dyn),
        config.worker.clone(),
        config.reconciler.clone(),
    );
    handles.push(tokio::spawn(reconciler.run(shutdown_rx)));

    let ingest = TicketIngest::new(stores.clone(), Arc::clone(&queue_dyn));
    let gate = ApprovalGate::new(stores.clone(), queue_dyn);

    Engine {
        stores,
        queue,
        ingest,
        gate,
        shutdown_tx,
        handles,
    }
}

async fn stop_engine(engine: Engine) {
    let _ = engine.shutdown_tx.send(true);
    engine.queue.close().await;
    for handle in engine.handles {
        let _ = handle.await;
    }
}

async fn run(config: EngineConfig, workers: usize) -> Result<()> {
    let engine = start_engine(&config, workers);
    tracing::info!(workers, "engine running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    stop_engine(engine).await;
    Ok(())
}

async fn demo(config: EngineConfig) -> Result<()> {
    let engine = start_engine(&config, 2);

    let samples = [
        TicketIntake {
            customer_id: "cust_1001".to_string(),
            subject: "Refund for damaged headphones".to_string(),
            body: "My order ord_7c31 arrived broken. Please refund $129.99.".to_string(),
        },
        TicketIntake {
            customer_id: "cust_1002".to_string(),
            subject: "Locked out of my account".to_string(),
            body: "I forgot my password and can't sign in. Email: pat@example.com".to_string(),
        },
        TicketIntake {
            customer_id: "cust_1003".to_string(),
            subject: "App crashes on startup".to_string(),
            body: "The app shows an error and crashes every time I open it.".to_string(),
        },
    ];

    let mut ids = Vec::new();
    for intake in samples {
        let outcome = engine.ingest.submit(intake).await?;
        ids.push(outcome.ticket.id);
    }

    // Drive to completion, standing in for the human approver.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        for request in engine.gate.list_pending().await? {
            tracing::info!(
                approval_id = %request.id,
                action_type = %request.action_type,
                "demo supervisor approving"
            );
            engine
                .gate
                .decide(request.id, true, "demo-supervisor", Some("demo".to_string()))
                .await?;
        }

        let mut all_terminal = true;
        for id in &ids {
            let ticket = engine.stores.tickets.get(*id).await?;
            if !ticket.is_some_and(|t| t.status.is_terminal()) {
                all_terminal = false;
            }
        }
        if all_terminal {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("demo tickets did not finish within 30s");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for id in &ids {
        let Some(ticket) = engine.stores.tickets.get(*id).await? else {
            continue;
        };
        println!("\n=== {} [{}] ===", ticket.subject, ticket.status);
        if let Some(result) = &ticket.result {
            if let Some(response) = result["final_response"].as_str() {
                println!("{response}");
            }
        }
        let events = engine.stores.events.list_for_ticket(*id).await?;
        println!(
            "events: {}",
            events
                .iter()
                .map(|e| e.event_type.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
    }

    stop_engine(engine).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;
    let _logging = init_logging(&config.logging, cli.debug)?;

    match cli.command {
        Some(Commands::Run { workers }) => run(config, workers).await,
        Some(Commands::Demo) | None => demo(config).await,
    }
}
