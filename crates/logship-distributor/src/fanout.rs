//! Replica fan-out: a fixed pool of workers pushing batches to nodes.
//!
//! The push path groups stream trackers by node and enqueues one
//! [`PushTask`] per node. Workers run each node push under its own timeout,
//! detached from the caller, and tally the result into every stream tracker
//! the batch carries.

use crate::client::ClientPool;
use crate::error::{DistributorError, Result};
use crate::metrics::DistributorMetrics;
use crate::ring::InstanceDesc;
use crate::stream::PushRequest;
use crate::tracker::{PushTracker, StreamTracker};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Streams bound for one node within one push.
pub struct PushTask {
    /// Target node.
    pub instance: InstanceDesc,
    /// Streams to write, each with its replica tally.
    pub streams: Vec<Arc<StreamTracker>>,
    /// Tracker of the push the streams belong to.
    pub tracker: Arc<PushTracker>,
}

#[derive(Clone)]
struct Worker {
    clients: Arc<ClientPool>,
    metrics: DistributorMetrics,
    remote_timeout: Duration,
}

/// Fixed-size pool of push workers sharing one task queue.
pub struct PushWorkerPool {
    tx: mpsc::Sender<PushTask>,
    shutdown: CancellationToken,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl PushWorkerPool {
    /// Spawn `workers` workers.
    pub fn start(
        workers: usize,
        clients: Arc<ClientPool>,
        metrics: DistributorMetrics,
        remote_timeout: Duration,
    ) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<PushTask>(workers);
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();
        let worker = Worker {
            clients,
            metrics,
            remote_timeout,
        };

        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|_| {
                let rx = rx.clone();
                let shutdown = shutdown.clone();
                let worker = worker.clone();
                tokio::spawn(async move {
                    loop {
                        let task = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                _ = shutdown.cancelled() => None,
                                task = rx.recv() => task,
                            }
                        };
                        match task {
                            Some(task) => worker.send_streams(task).await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        debug!(workers, "push workers started");
        Self {
            tx,
            shutdown,
            handles: StdMutex::new(handles),
        }
    }

    /// Enqueue a task, waiting for queue space. Gives up without enqueuing if
    /// `cancel` fires first.
    pub async fn submit(&self, task: PushTask, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DistributorError::Cancelled),
            sent = self.tx.send(task) => sent.map_err(|_| DistributorError::Shutdown),
        }
    }

    /// Stop the workers and wait for them. Queued tasks are dropped, which
    /// their pushes observe as [`DistributorError::Shutdown`].
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "push worker panicked");
            }
        }
        debug!("push workers stopped");
    }
}

impl Worker {
    async fn send_streams(&self, task: PushTask) {
        let result = self.send_streams_err(&task).await;

        for stream in &task.streams {
            match &result {
                Ok(()) => {
                    if stream.record_success() {
                        task.tracker.done_with_result(Ok(()));
                    }
                }
                Err(e) => {
                    if stream.record_failure() {
                        task.tracker.done_with_result(Err(e.clone()));
                    }
                }
            }
        }
    }

    async fn send_streams_err(&self, task: &PushTask) -> Result<()> {
        let addr = task.instance.addr.as_str();
        let client = self.clients.get_client_for(addr)?;
        let req = PushRequest::new(
            task.streams
                .iter()
                .map(|s| s.stream.stream.clone())
                .collect(),
        );

        let outcome = tokio::time::timeout(self.remote_timeout, client.push(req)).await;
        self.metrics
            .ingester_appends
            .with_label_values(&[addr])
            .inc();

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!(addr, error = %e, "node push failed");
                Err(e)
            }
            Err(_) => {
                self.metrics
                    .ingester_append_timeouts
                    .with_label_values(&[addr])
                    .inc();
                debug!(addr, "node push timed out");
                Err(DistributorError::NodeTimeout {
                    addr: addr.to_string(),
                    timeout_ms: self.remote_timeout.as_millis() as u64,
                })
            }
        }
    }
}
