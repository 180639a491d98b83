//! I/O schedulers for flush and merge operations.
//!
//! Two policies share one contract: `schedule` never drops an operation, and
//! every scheduled operation reaches a terminal state that its ticket reports.
//!
//! - `ImmediateScheduler` runs the operation on the calling thread and returns
//!   once it is terminal.
//! - `SequentialScheduler` appends to a FIFO queue drained by one worker
//!   thread, so operations run one at a time in enqueue order.

use crate::operation::{IndexId, IoOperation, OperationTicket};
use kestrel_common::{KestrelError, Result, SchedulerPolicy};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Executes background I/O operations under a fixed policy.
pub trait IoScheduler: Send + Sync {
    /// Returns the policy this scheduler implements.
    fn policy(&self) -> SchedulerPolicy;

    /// Accepts an operation for execution and returns its ticket.
    fn schedule(&self, op: IoOperation) -> Result<OperationTicket>;

    /// Cancels every queued operation for `index`. Returns how many were cancelled.
    ///
    /// Running operations are not interrupted.
    fn cancel_pending(&self, index: &IndexId) -> usize;

    /// Stops accepting operations and cancels whatever is still queued.
    fn shutdown(&self);
}

/// Builds the scheduler selected by configuration.
pub fn scheduler_for(policy: SchedulerPolicy) -> Result<Arc<dyn IoScheduler>> {
    Ok(match policy {
        SchedulerPolicy::Immediate => Arc::new(ImmediateScheduler::new()),
        SchedulerPolicy::Sequential => Arc::new(SequentialScheduler::new()?),
    })
}

/// Runs each operation synchronously on the scheduling thread.
#[derive(Debug, Default)]
pub struct ImmediateScheduler {
    shut_down: AtomicBool,
}

impl ImmediateScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IoScheduler for ImmediateScheduler {
    fn policy(&self) -> SchedulerPolicy {
        SchedulerPolicy::Immediate
    }

    fn schedule(&self, op: IoOperation) -> Result<OperationTicket> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(KestrelError::SchedulerShutdown);
        }
        let ticket = op.ticket().clone();
        debug!(op = op.id(), kind = %op.kind(), index = %op.index(), "Running operation inline");
        op.run();
        Ok(ticket)
    }

    fn cancel_pending(&self, _index: &IndexId) -> usize {
        0
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
    }
}

struct QueueState {
    pending: VecDeque<IoOperation>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    available: Condvar,
}

/// Runs operations one at a time, in FIFO order, on a dedicated worker thread.
pub struct SequentialScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SequentialScheduler {
    /// Starts the worker thread.
    pub fn new() -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                pending: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("kestrel-io-scheduler".to_string())
            .spawn(move || Self::worker_loop(&worker_shared))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    fn worker_loop(shared: &Shared) {
        loop {
            let op = {
                let mut queue = shared.queue.lock();
                loop {
                    if let Some(op) = queue.pending.pop_front() {
                        break op;
                    }
                    if queue.shutdown {
                        debug!("I/O scheduler worker exiting");
                        return;
                    }
                    shared.available.wait(&mut queue);
                }
            };
            debug!(op = op.id(), kind = %op.kind(), index = %op.index(), "Dequeued operation");
            op.run();
        }
    }

    /// Returns the number of queued operations that have not started.
    pub fn pending_len(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }
}

impl IoScheduler for SequentialScheduler {
    fn policy(&self) -> SchedulerPolicy {
        SchedulerPolicy::Sequential
    }

    fn schedule(&self, op: IoOperation) -> Result<OperationTicket> {
        let ticket = op.ticket().clone();
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return Err(KestrelError::SchedulerShutdown);
            }
            debug!(op = op.id(), kind = %op.kind(), index = %op.index(), queued = queue.pending.len(), "Enqueued operation");
            queue.pending.push_back(op);
        }
        self.shared.available.notify_one();
        Ok(ticket)
    }

    fn cancel_pending(&self, index: &IndexId) -> usize {
        let removed: Vec<IoOperation> = {
            let mut queue = self.shared.queue.lock();
            let (matching, rest): (VecDeque<_>, VecDeque<_>) =
                queue.pending.drain(..).partition(|op| op.index() == index);
            queue.pending = rest;
            matching.into_iter().collect()
        };

        // Targets are notified outside the queue lock; they may schedule again.
        let cancelled = removed.iter().filter(|op| op.cancel()).count();
        if cancelled > 0 {
            warn!(index = %index, cancelled, "Cancelled pending I/O operations");
        }
        cancelled
    }

    fn shutdown(&self) {
        let drained: Vec<IoOperation> = {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
            queue.pending.drain(..).collect()
        };
        self.shared.available.notify_all();

        let cancelled = drained.iter().filter(|op| op.cancel()).count();
        if cancelled > 0 {
            warn!(cancelled, "Cancelled queued I/O operations at shutdown");
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Shutdown requested from an operation callback; the loop exits on its own.
                return;
            }
            if handle.join().is_err() {
                warn!("I/O scheduler worker panicked");
            }
        }
        info!("I/O scheduler shut down");
    }
}

impl Drop for SequentialScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
