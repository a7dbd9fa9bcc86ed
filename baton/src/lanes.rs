//! Per-key serialization of jobs.
//!
//! [`KeyedLanes`] is a keyed single-worker queue: jobs submitted under one
//! key run strictly one at a time in arrival order, while jobs under
//! distinct keys run fully in parallel. The engine keys lanes by owner so
//! that at most one workflow instance per owner is ever in flight, which is
//! what makes the credit-decrement step race-free without cross-row
//! transactions.
//!
//! This is a scheduling-level admission gate, not a lock: a lane worker is
//! an ordinary task created on first use of its key and stopped by the
//! cancellation token.

use std::future::Future;
use std::pin::Pin;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Keyed single-worker FIFO queues.
pub struct KeyedLanes {
    lanes: DashMap<String, mpsc::UnboundedSender<Job>>,
    cancel: CancellationToken,
}

impl KeyedLanes {
    /// Create an empty lane map. Workers spawned later observe `cancel`
    /// and exit once it fires.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            lanes: DashMap::new(),
            cancel,
        }
    }

    /// Queue a job on the lane for `key`, creating the lane's worker on
    /// first use.
    ///
    /// Jobs on one lane run one at a time, in submission order; a job does
    /// not start until the previous job on its lane has completed. After
    /// cancellation, jobs are dropped.
    pub fn submit<F>(&self, key: &str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self
            .lanes
            .entry(key.to_string())
            .or_insert_with(|| self.spawn_worker(key))
            .clone();

        if sender.send(Box::pin(job)).is_err() {
            tracing::warn!(key = %key, "Lane worker already stopped, dropping job");
        }
    }

    /// Number of lanes that have been created so far.
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    fn spawn_worker(&self, key: &str) -> mpsc::UnboundedSender<Job> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let cancel = self.cancel.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            tracing::debug!(key = %key, "Lane worker started");
            loop {
                // biased: once cancelled, queued jobs must not start
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job.await,
                        None => break,
                    },
                }
            }
            tracing::debug!(key = %key, "Lane worker stopped");
        });

        tx
    }
}
