//! Crash-recovery backstop.
//!
//! A worker that dies mid-ticket leaves it in `processing` with a
//! heartbeat that stops advancing. The reconciler sweeps for those and
//! re-enqueues them; the stale-heartbeat check in the claim path lets
//! the next worker take over.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use crate::config::{ReconcilerConfig, WorkerConfig};
use crate::error::EngineError;
use crate::model::TicketStatus;
use crate::queue::WorkQueue;
use crate::store::{EngineStores, EventStore, TicketStore};

pub struct Reconciler {
    stores: EngineStores,
    queue: Arc<dyn WorkQueue>,
    worker_config: WorkerConfig,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        stores: EngineStores,
        queue: Arc<dyn WorkQueue>,
        worker_config: WorkerConfig,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            stores,
            queue,
            worker_config,
            config,
        }
    }

    /// One sweep: re-enqueue every stale processing ticket. Returns how
    /// many were re-enqueued.
    pub async fn run_once(&self) -> Result<u32, EngineError> {
        let threshold = self.worker_config.stale_threshold();
        let now = Utc::now();
        let mut recovered = 0;

        for ticket in self.stores.tickets.list().await? {
            if ticket.status != TicketStatus::Processing {
                continue;
            }
            let stale = match ticket.last_heartbeat {
                Some(hb) => {
                    now.signed_duration_since(hb)
                        .to_std()
                        .unwrap_or_default()
                        > threshold
                }
                None => true,
            };
            if !stale {
                continue;
            }

            tracing::warn!(
                ticket_id = %ticket.id,
                worker_id = ?ticket.worker_id,
                "stale processing ticket, re-enqueueing"
            );
            self.stores
                .events
                .log_retry(ticket.id, ticket.attempt_count, "stale worker heartbeat")
                .await?;
            self.queue.enqueue(ticket.id, ticket.attempt_count + 1).await?;
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!(recovered, "reconciler sweep recovered tickets");
        }
        Ok(recovered)
    }

    /// Sweep on an interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.config.sweep_interval_secs,
            "reconciler started"
        );
        let mut tick = tokio::time::interval(self.config.sweep_interval());
        tick.tick().await; // immediate first tick
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "reconciler sweep failed");
                    }
                }
            }
        }
        tracing::info!("reconciler stopped");
    }
}
