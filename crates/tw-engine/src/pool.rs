// Worker pool
// Runs trial runners on dedicated OS threads under fractional GPU/CPU
// reservations. Each worker thread serves a bounded number of tasks and is then
// replaced by a fresh one, so per-process state left behind by a training job
// does not leak into the next.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use tw_types::{internal_error, ResourceError, TrialOutcome, TwResult};

/// Tolerance for fractional resource arithmetic.
const EPSILON: f64 = 1e-9;

/// Resource requirement of one task, or a pool's capacity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerResources {
    /// Number of CPUs (fractional ok).
    pub num_cpus: f64,
    /// Number of GPUs (fractional ok, 0 = no GPU).
    pub num_gpus: f64,
}

impl Default for WorkerResources {
    fn default() -> Self {
        Self {
            num_cpus: 1.0,
            num_gpus: 0.0,
        }
    }
}

impl WorkerResources {
    fn fits_within(&self, available: &WorkerResources) -> bool {
        self.num_cpus <= available.num_cpus + EPSILON && self.num_gpus <= available.num_gpus + EPSILON
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Concurrent worker threads.
    pub num_workers: usize,
    /// Total resources tasks may reserve.
    pub capacity: WorkerResources,
}

impl PoolConfig {
    pub fn new(num_workers: usize, num_cpus: f64, num_gpus: f64) -> Self {
        Self {
            num_workers,
            capacity: WorkerResources { num_cpus, num_gpus },
        }
    }
}

// ---------------------------------------------------------------------------
// Resource ledger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ResourceLedger {
    capacity: WorkerResources,
    available: Mutex<WorkerResources>,
}

impl ResourceLedger {
    fn new(capacity: WorkerResources) -> Self {
        Self {
            capacity,
            available: Mutex::new(capacity),
        }
    }

    fn release(&self, amount: WorkerResources) {
        let mut available = self.available.lock();
        available.num_cpus = (available.num_cpus + amount.num_cpus).min(self.capacity.num_cpus);
        available.num_gpus = (available.num_gpus + amount.num_gpus).min(self.capacity.num_gpus);
    }
}

/// Reserve every request or none of them.
fn reserve_all(ledger: &Arc<ResourceLedger>, requests: &[WorkerResources]) -> TwResult<Vec<Reservation>> {
    let total = requests.iter().fold(
        WorkerResources {
            num_cpus: 0.0,
            num_gpus: 0.0,
        },
        |acc, r| WorkerResources {
            num_cpus: acc.num_cpus + r.num_cpus,
            num_gpus: acc.num_gpus + r.num_gpus,
        },
    );

    let mut available = ledger.available.lock();
    if !total.fits_within(&available) {
        return Err(ResourceError::Exhausted {
            requested_gpus: total.num_gpus,
            requested_cpus: total.num_cpus,
            available_gpus: available.num_gpus,
            available_cpus: available.num_cpus,
        }
        .into());
    }
    available.num_cpus = (available.num_cpus - total.num_cpus).max(0.0);
    available.num_gpus = (available.num_gpus - total.num_gpus).max(0.0);
    drop(available);

    Ok(requests
        .iter()
        .map(|amount| Reservation {
            ledger: Arc::clone(ledger),
            amount: *amount,
        })
        .collect())
}

/// A held share of the pool's resources, returned on drop.
#[derive(Debug)]
pub struct Reservation {
    ledger: Arc<ResourceLedger>,
    amount: WorkerResources,
}

impl Reservation {
    pub fn resources(&self) -> WorkerResources {
        self.amount
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.ledger.release(self.amount);
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

struct Job {
    task: Box<dyn FnOnce() + Send + 'static>,
    max_calls: usize,
}

/// Resolves to the outcome of a submitted task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    receiver: oneshot::Receiver<TrialOutcome<T>>,
}

impl<T> TaskHandle<T> {
    pub async fn join(self) -> TrialOutcome<T> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => TrialOutcome::Failed(internal_error!("worker dropped the task before completing it")),
        }
    }
}

/// Await a batch of handles, preserving submission order.
pub async fn join_all<T>(handles: Vec<TaskHandle<T>>) -> Vec<TrialOutcome<T>> {
    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        outcomes.push(handle.join().await);
    }
    outcomes
}

pub struct WorkerPool {
    jobs: Sender<Job>,
    ledger: Arc<ResourceLedger>,
    num_workers: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_workers", &self.num_workers)
            .field("capacity", &self.ledger.capacity)
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> TwResult<Self> {
        if config.num_workers == 0 {
            return Err(tw_types::config_error!("worker pool needs at least one worker"));
        }
        let (jobs, receiver) = unbounded::<Job>();
        for slot in 0..config.num_workers {
            spawn_worker(slot, 0, receiver.clone())?;
        }
        debug!(workers = config.num_workers, capacity = ?config.capacity, "worker pool started");

        Ok(Self {
            jobs,
            ledger: Arc::new(ResourceLedger::new(config.capacity)),
            num_workers: config.num_workers,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Currently unreserved resources.
    pub fn available(&self) -> WorkerResources {
        *self.ledger.available.lock()
    }

    /// Reserve resources for a batch of tasks, all or nothing.
    pub fn reserve_all(&self, requests: &[WorkerResources]) -> TwResult<Vec<Reservation>> {
        reserve_all(&self.ledger, requests)
    }

    /// Queue `task` under an existing reservation, released when the task
    /// ends. The worker that runs it is recycled after `max_calls` tasks.
    pub fn dispatch<T, F>(&self, reservation: Reservation, max_calls: usize, task: F) -> TwResult<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> TrialOutcome<T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let job = Job {
            task: Box::new(move || {
                let outcome = match catch_unwind(AssertUnwindSafe(task)) {
                    Ok(outcome) => outcome,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!(panic = %message, "task panicked");
                        TrialOutcome::Failed(internal_error!("task panicked: {message}"))
                    }
                };
                drop(reservation);
                if sender.send(outcome).is_err() {
                    debug!("task outcome dropped, nobody is waiting");
                }
            }),
            max_calls: max_calls.max(1),
        };
        self.jobs.send(job).map_err(|_| ResourceError::PoolClosed)?;
        Ok(TaskHandle { receiver })
    }

    /// Reserve and queue a single task.
    pub fn submit<T, F>(&self, resources: WorkerResources, max_calls: usize, task: F) -> TwResult<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> TrialOutcome<T> + Send + 'static,
    {
        let mut reservations = self.reserve_all(&[resources])?;
        let reservation = reservations
            .pop()
            .ok_or_else(|| internal_error!("reservation batch came back empty"))?;
        self.dispatch(reservation, max_calls, task)
    }
}

fn spawn_worker(slot: usize, generation: u64, jobs: Receiver<Job>) -> TwResult<()> {
    thread::Builder::new()
        .name(format!("tw-worker-{slot}-{generation}"))
        .spawn(move || {
            let mut served = 0usize;
            loop {
                let Ok(job) = jobs.recv() else {
                    debug!(slot, generation, "worker shutting down");
                    return;
                };
                let limit = job.max_calls;
                (job.task)();
                served += 1;
                if served >= limit {
                    break;
                }
            }
            debug!(slot, generation, served, "recycling worker");
            if let Err(e) = spawn_worker(slot, generation + 1, jobs) {
                error!(slot, error = %e, "failed to replace recycled worker");
            }
        })
        .map(|_| ())
        .map_err(|e| {
            warn!(slot, error = %e, "worker spawn failed");
            ResourceError::SpawnFailed {
                message: e.to_string(),
            }
            .into()
        })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_types::TwError;

    fn gpu(num_gpus: f64) -> WorkerResources {
        WorkerResources {
            num_cpus: 0.0,
            num_gpus,
        }
    }

    fn thread_name() -> String {
        thread::current().name().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn runs_tasks_and_returns_outcomes_in_order() {
        let pool = WorkerPool::new(PoolConfig::new(3, 3.0, 1.0)).unwrap();
        let handles: Vec<_> = (0..3)
            .map(|i| {
                pool.submit(gpu(1.0 / 3.0), 3, move || TrialOutcome::Completed(i * 10))
                    .unwrap()
            })
            .collect();
        let outcomes = join_all(handles).await;
        let values: Vec<i32> = outcomes
            .into_iter()
            .map(|o| match o {
                TrialOutcome::Completed(v) => v,
                other => panic!("unexpected outcome {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn reservations_are_all_or_nothing() {
        let pool = WorkerPool::new(PoolConfig::new(2, 4.0, 1.0)).unwrap();

        let held = pool.reserve_all(&[gpu(0.5), gpu(0.5)]).unwrap();
        let err = pool.reserve_all(&[gpu(0.25)]).unwrap_err();
        assert!(matches!(err, TwError::Resource(ResourceError::Exhausted { .. })));

        drop(held);
        assert_eq!(pool.available().num_gpus, 1.0);

        // Over-subscribing batch reserves nothing.
        assert!(pool.reserve_all(&[gpu(0.75), gpu(0.75)]).is_err());
        assert_eq!(pool.available().num_gpus, 1.0);
    }

    #[tokio::test]
    async fn reservation_released_when_task_finishes() {
        let pool = WorkerPool::new(PoolConfig::new(1, 1.0, 1.0)).unwrap();
        let handle = pool
            .submit(gpu(1.0), 1, || TrialOutcome::Completed(()))
            .unwrap();
        assert!(handle.join().await.is_completed());
        assert_eq!(pool.available().num_gpus, 1.0);
    }

    #[tokio::test]
    async fn panicking_task_fails_without_killing_pool() {
        let pool = WorkerPool::new(PoolConfig::new(1, 1.0, 1.0)).unwrap();
        let handle = pool
            .submit::<(), _>(gpu(1.0), 5, || panic!("diverged"))
            .unwrap();
        match handle.join().await {
            TrialOutcome::Failed(e) => assert!(e.to_string().contains("diverged")),
            other => panic!("expected failure, got {other:?}"),
        }

        assert_eq!(pool.available().num_gpus, 1.0);
        let again = pool
            .submit(gpu(1.0), 5, || TrialOutcome::Completed(7))
            .unwrap();
        assert!(matches!(again.join().await, TrialOutcome::Completed(7)));
    }

    #[tokio::test]
    async fn workers_recycle_after_max_calls() {
        let pool = WorkerPool::new(PoolConfig::new(1, 1.0, 0.0)).unwrap();

        let mut recycled = Vec::new();
        for _ in 0..3 {
            let handle = pool
                .submit(gpu(0.0), 1, || TrialOutcome::Completed(thread_name()))
                .unwrap();
            match handle.join().await {
                TrialOutcome::Completed(name) => recycled.push(name),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(recycled, vec!["tw-worker-0-0", "tw-worker-0-1", "tw-worker-0-2"]);

        let mut reused = Vec::new();
        for _ in 0..2 {
            let handle = pool
                .submit(gpu(0.0), 10, || TrialOutcome::Completed(thread_name()))
                .unwrap();
            if let TrialOutcome::Completed(name) = handle.join().await {
                reused.push(name);
            }
        }
        assert_eq!(reused[0], reused[1]);
        assert_eq!(reused[0], "tw-worker-0-3");
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(WorkerPool::new(PoolConfig::new(0, 1.0, 1.0)).is_err());
    }
}
