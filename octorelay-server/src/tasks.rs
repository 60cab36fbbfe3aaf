//! Background execution of slow work.
//!
//! The event source expects an acknowledgment within seconds, while the
//! actual work makes API round-trips and reasoning-engine calls that can
//! take minutes. Workers therefore run on a bounded pool off the request
//! path, and the runner owns the one invariant that matters: a claimed
//! record always reaches a terminal status if this process survives.
//! If the process dies mid-work, the claim's staleness window makes the
//! record reclaimable later.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::claim::{ClaimGuard, FinalOutcome};
use crate::records::RecordKind;

/// Observable counters for the query surface.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerStats {
    pub in_flight: usize,
    pub spawned: u64,
    pub max_concurrent: usize,
}

/// Bounded pool of background workers.
#[derive(Clone)]
pub struct TaskRunner {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    spawned: Arc<AtomicU64>,
    max_concurrent: usize,
}

impl TaskRunner {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            spawned: Arc::new(AtomicU64::new(0)),
            max_concurrent,
        }
    }

    /// Schedule the worker for a claimed record.
    ///
    /// The worker finalizes its own record on success (it knows the result
    /// fields). The runner guarantees the failure side: if the worker
    /// returns an error or panics, the record is finalized `failed` here,
    /// so it can never be left in `processing` by a surviving process.
    pub fn spawn_finalizing<F>(
        &self,
        guard: ClaimGuard,
        kind: RecordKind,
        record_id: String,
        task_name: &'static str,
        work: F,
    ) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        // Counted before the spawn so wait_idle cannot observe a gap
        // between "accepted" and "running".
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.spawned.fetch_add(1, Ordering::Relaxed);

        let semaphore = self.semaphore.clone();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // Pool shut down; nothing will run this work.
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            };

            info!(task = task_name, record_id, "Starting background worker");

            // The worker runs on its own task so a panic cannot skip the
            // failure finalization below.
            let joined = tokio::spawn(work).await;
            let failure = match joined {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{:#}", e)),
                Err(join_error) => Some(format!("worker aborted: {}", join_error)),
            };

            if let Some(message) = failure {
                error!(task = task_name, record_id, error = %message, "Background worker failed");
                if let Err(e) =
                    guard.finalize(kind, &record_id, FinalOutcome::Failed(message))
                {
                    error!(task = task_name, record_id, "Failed to finalize failed record: {:#}", e);
                }
            }

            in_flight.fetch_sub(1, Ordering::SeqCst);
        })
    }

    pub fn stats(&self) -> RunnerStats {
        RunnerStats {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            spawned: self.spawned.load(Ordering::Relaxed),
            max_concurrent: self.max_concurrent,
        }
    }

    /// Wait until no workers are in flight. Used by tests and shutdown.
    pub async fn wait_idle(&self) {
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}
