//! Serialized deployment queue.
//!
//! Many producers (webhook handlers), one consumer. The consumer runs each job
//! to completion before taking the next, so at most one deployment touches a
//! working copy or an alias at any time.

use crate::errors::EnqueueError;
use crate::provider::DeployRequest;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, info};

/// The work done for one dequeued request.
#[rocket::async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, request: DeployRequest);
}

pub struct QueueEntry {
    pub request: DeployRequest,
    pub enqueued_at: DateTime<Utc>,
}

/// Diagnostics snapshot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    pub capacity: usize,
    pub concurrency: usize,
    pub pending: usize,
    pub running: bool,
    pub accepted: u64,
    pub completed: u64,
    pub rejected: u64,
    pub oldest_pending_since: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    running: AtomicBool,
    accepted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    /// Enqueue times of entries not yet taken by the worker, oldest first.
    pending: Mutex<VecDeque<DateTime<Utc>>>,
}

impl Counters {
    fn pending(&self) -> MutexGuard<'_, VecDeque<DateTime<Utc>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct DeploymentQueue {
    tx: mpsc::Sender<QueueEntry>,
    capacity: usize,
    counters: Arc<Counters>,
}

impl DeploymentQueue {
    /// Create the queue and spawn its worker on the current Tokio runtime.
    ///
    /// `capacity` bounds the entries waiting behind the running job.
    pub fn start(capacity: usize, runner: Arc<dyn JobRunner>) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Arc::new(Counters::default());

        tokio::spawn(work(rx, runner, counters.clone()));

        DeploymentQueue {
            tx,
            capacity,
            counters,
        }
    }

    /// Admit a request without waiting. Fails once `capacity` entries are pending.
    pub fn enqueue(&self, request: DeployRequest) -> Result<(), EnqueueError> {
        let mut pending = self.counters.pending();
        let enqueued_at = Utc::now();

        match self.tx.try_send(QueueEntry {
            request,
            enqueued_at,
        }) {
            Ok(()) => {
                pending.push_back(enqueued_at);
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(EnqueueError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    pub fn state(&self) -> QueueState {
        let pending = self.counters.pending();
        QueueState {
            capacity: self.capacity,
            concurrency: 1,
            pending: pending.len(),
            running: self.counters.running.load(Ordering::SeqCst),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            oldest_pending_since: pending.front().copied(),
        }
    }
}

async fn work(
    mut rx: mpsc::Receiver<QueueEntry>,
    runner: Arc<dyn JobRunner>,
    counters: Arc<Counters>,
) {
    info!("Deployment worker started");

    while let Some(entry) = rx.recv().await {
        counters.pending().pop_front();
        counters.running.store(true, Ordering::SeqCst);

        let waited = Utc::now() - entry.enqueued_at;
        info!(
            repo = entry.request.source_repo_name(),
            waited_ms = waited.num_milliseconds(),
            "Dequeued deployment"
        );

        // Own task, so a panicking job cannot take the worker down with it.
        let runner = runner.clone();
        let job = tokio::spawn(async move { runner.run(entry.request).await });
        if let Err(e) = job.await {
            error!("Deployment job aborted: {}", e);
        }

        counters.running.store(false, Ordering::SeqCst);
        counters.completed.fetch_add(1, Ordering::Relaxed);
    }

    info!("Deployment worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::testing::RecordingReporter;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{Semaphore, mpsc::UnboundedSender};
    use tokio::time::{sleep, timeout};

    fn request(repo: &str, git_ref: &str) -> DeployRequest {
        DeployRequest::for_test(repo, git_ref, "abc123", Arc::new(RecordingReporter::default()))
    }

    /// Records start/finish per job and tracks how many run at once.
    struct Tracking {
        active: AtomicUsize,
        max_active: AtomicUsize,
        started: Mutex<Vec<String>>,
        done: UnboundedSender<String>,
        gate: Option<Arc<Semaphore>>,
    }

    #[rocket::async_trait]
    impl JobRunner for Tracking {
        async fn run(&self, request: DeployRequest) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.started
                .lock()
                .unwrap()
                .push(request.git_ref().to_string());

            if request.git_ref() == "boom" {
                self.active.fetch_sub(1, Ordering::SeqCst);
                panic!("job blew up");
            }
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            sleep(Duration::from_millis(10)).await;

            self.active.fetch_sub(1, Ordering::SeqCst);
            let _ = self.done.send(request.git_ref().to_string());
        }
    }

    fn tracking(gate: Option<Arc<Semaphore>>) -> (Arc<Tracking>, mpsc::UnboundedReceiver<String>) {
        let (done, rx) = mpsc::unbounded_channel();
        let runner = Arc::new(Tracking {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
            done,
            gate,
        });
        (runner, rx)
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<String>, n: usize) -> Vec<String> {
        let mut out = Vec::new();
        while out.len() < n {
            let next = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("job did not finish in time")
                .expect("worker dropped");
            out.push(next);
        }
        out
    }

    async fn wait_until_running(queue: &DeploymentQueue) {
        timeout(Duration::from_secs(5), async {
            while !queue.state().running {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("worker never picked up a job");
    }

    #[tokio::test]
    async fn runs_in_fifo_order_one_at_a_time() {
        let (runner, mut done) = tracking(None);
        let queue = DeploymentQueue::start(10, runner.clone());

        let refs: Vec<String> = (0..6).map(|i| format!("ref-{}", i)).collect();
        for r in &refs {
            queue.enqueue(request("acme/widgets", r)).unwrap();
        }

        assert_eq!(collect(&mut done, refs.len()).await, refs);
        assert_eq!(*runner.started.lock().unwrap(), refs);
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_producers_never_overlap() {
        let (runner, mut done) = tracking(None);
        let queue = DeploymentQueue::start(32, runner.clone());

        let mut handles = Vec::new();
        for i in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.enqueue(request("acme/widgets", &format!("ref-{}", i)))
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        collect(&mut done, 8).await;
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(queue.state().accepted, 8);
    }

    #[tokio::test]
    async fn rejects_beyond_capacity_and_finishes_accepted() {
        let gate = Arc::new(Semaphore::new(0));
        let (runner, mut done) = tracking(Some(gate.clone()));
        let queue = DeploymentQueue::start(2, runner);

        queue.enqueue(request("acme/widgets", "running")).unwrap();
        wait_until_running(&queue).await;

        queue.enqueue(request("acme/widgets", "first")).unwrap();
        queue.enqueue(request("acme/widgets", "second")).unwrap();
        assert_eq!(
            queue.enqueue(request("acme/widgets", "third")),
            Err(EnqueueError::QueueFull { capacity: 2 })
        );

        let state = queue.state();
        assert_eq!(state.pending, 2);
        assert!(state.running);
        assert_eq!(state.rejected, 1);
        assert!(state.oldest_pending_since.is_some());

        gate.add_permits(10);
        assert_eq!(
            collect(&mut done, 3).await,
            vec!["running", "first", "second"]
        );
    }

    #[tokio::test]
    async fn panicking_job_does_not_stop_worker() {
        let (runner, mut done) = tracking(None);
        let queue = DeploymentQueue::start(10, runner);

        queue.enqueue(request("acme/widgets", "boom")).unwrap();
        queue.enqueue(request("acme/widgets", "after")).unwrap();

        assert_eq!(collect(&mut done, 1).await, vec!["after"]);
        timeout(Duration::from_secs(5), async {
            while queue.state().completed < 2 {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }
}
