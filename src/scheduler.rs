//! Background retry scheduler
//!
//! A single worker task drives provider bootstrap: it pops the earliest-due
//! [`ScheduledTask`], runs it through the [`TaskHandler`], and re-enqueues it
//! with one fewer attempt when the failure was transient. Retry state lives
//! in the task itself (kind, attempts left, delay), so it is inspectable and
//! no closure chains build up across retries.
//!
//! Only [`Error::is_transient`] failures are retried. Any other error fails
//! the task permanently: it is logged and dropped, never escalated into a
//! process crash.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::Result;

/// The work a scheduled task performs, as a closed tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Dynamic client registration for a provider without stored credentials
    Register {
        /// Provider name from the configuration
        provider: String,
    },
    /// Client reconstruction from stored credentials
    Restore {
        /// Provider name from the configuration
        provider: String,
    },
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { provider } => write!(f, "register({provider})"),
            Self::Restore { provider } => write!(f, "restore({provider})"),
        }
    }
}

/// Executes scheduled tasks. Implemented by the provider manager.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Run one task to completion or failure.
    async fn run(&self, kind: &TaskKind) -> Result<()>;
}

/// A queued unit of work with its retry budget.
#[derive(Debug)]
struct ScheduledTask {
    run_at: Instant,
    priority: u8,
    seq: u64,
    kind: TaskKind,
    attempts_left: u32,
    retry_delay: Duration,
}

// BinaryHeap is a max-heap; invert the ordering so the earliest-due,
// lowest-priority-number, first-enqueued task surfaces first.
impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

struct SchedulerState {
    queue: parking_lot::Mutex<BinaryHeap<ScheduledTask>>,
    notify: Notify,
    shutdown: AtomicBool,
    seq: AtomicU64,
}

/// Single-worker retry scheduler.
pub struct RetryScheduler {
    state: Arc<SchedulerState>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RetryScheduler {
    /// Start the scheduler with its single worker task.
    #[must_use]
    pub fn start(handler: Arc<dyn TaskHandler>) -> Self {
        let state = Arc::new(SchedulerState {
            queue: parking_lot::Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        });

        let worker_state = Arc::clone(&state);
        let worker = tokio::spawn(async move {
            worker_loop(worker_state, handler).await;
        });

        Self {
            state,
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    /// Enqueue a task to run after `delay`, with `retries` further attempts
    /// spaced `retry_delay` apart on transient failure.
    pub fn schedule(
        &self,
        delay: Duration,
        priority: u8,
        kind: TaskKind,
        retries: u32,
        retry_delay: Duration,
    ) {
        let seq = self.state.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let task = ScheduledTask {
            run_at: Instant::now() + delay,
            priority,
            seq,
            kind,
            attempts_left: retries,
            retry_delay,
        };
        debug!(task = %task.kind, retries = task.attempts_left, "Scheduled task");
        self.state.queue.lock().push(task);
        self.state.notify.notify_one();
    }

    /// Number of tasks waiting to fire.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.queue.lock().len()
    }

    /// Remove every pending task and wait for the worker to exit.
    ///
    /// After this returns, no task can fire. Called at shutdown before the
    /// credential store is flushed.
    pub async fn cancel_all(&self) {
        let dropped = {
            let mut queue = self.state.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        if dropped > 0 {
            info!(dropped, "Cancelled pending scheduler tasks");
        }

        self.state.shutdown.store(true, AtomicOrdering::SeqCst);
        self.state.notify.notify_one();

        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(state: Arc<SchedulerState>, handler: Arc<dyn TaskHandler>) {
    loop {
        if state.shutdown.load(AtomicOrdering::SeqCst) {
            break;
        }

        let next_due = state.queue.lock().peek().map(|t| t.run_at);

        match next_due {
            None => {
                state.notify.notified().await;
            }
            Some(due) if due > Instant::now() => {
                tokio::select! {
                    () = state.notify.notified() => {}
                    () = tokio::time::sleep_until(due) => {}
                }
            }
            Some(_) => {
                let task = state.queue.lock().pop();
                if let Some(task) = task {
                    run_task(&state, handler.as_ref(), task).await;
                }
            }
        }
    }
    debug!("Scheduler worker exited");
}

async fn run_task(state: &SchedulerState, handler: &dyn TaskHandler, mut task: ScheduledTask) {
    debug!(task = %task.kind, attempts_left = task.attempts_left, "Running task");

    match handler.run(&task.kind).await {
        Ok(()) => {
            debug!(task = %task.kind, "Task succeeded");
        }
        Err(e) if e.is_transient() && task.attempts_left > 0 => {
            debug!(
                task = %task.kind,
                attempts_left = task.attempts_left - 1,
                delay_s = task.retry_delay.as_secs(),
                error = %e,
                "Transient failure, rescheduling"
            );
            task.attempts_left -= 1;
            task.run_at = Instant::now() + task.retry_delay;
            if !state.shutdown.load(AtomicOrdering::SeqCst) {
                state.queue.lock().push(task);
                state.notify.notify_one();
            }
        }
        Err(e) if e.is_transient() => {
            error!(task = %task.kind, error = %e, "Retries exhausted, giving up");
        }
        Err(e) => {
            error!(task = %task.kind, error = %e, "Permanent failure, not retrying");
        }
    }
}
