//! Background I/O operations and their completion tickets.

use kestrel_common::{KestrelError, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error};

/// Identity of a physical index: its resolved on-disk location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexId(PathBuf);

impl IndexId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Returns the index directory.
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Identifies a disk component by the range of flush generations it covers.
///
/// A flush produces `min == max`; a merge covers the union of its inputs.
/// Components of one index never overlap, so ordering by `max` descending
/// gives newest-first order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    pub min: u64,
    pub max: u64,
}

impl ComponentId {
    /// Component produced by flushing one generation.
    pub const fn flushed(generation: u64) -> Self {
        Self {
            min: generation,
            max: generation,
        }
    }

    /// Component covering all of `inputs`.
    pub fn merged(inputs: &[ComponentId]) -> Option<Self> {
        let min = inputs.iter().map(|c| c.min).min()?;
        let max = inputs.iter().map(|c| c.max).max()?;
        Some(Self { min, max })
    }

    /// Returns true if this component's range covers `other`'s.
    pub fn covers(&self, other: &ComponentId) -> bool {
        self.min <= other.min && other.max <= self.max
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Kind of structural maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoOperationKind {
    /// Write a frozen memory component to a new disk component.
    Flush,
    /// Combine several disk components into one.
    Merge,
}

impl fmt::Display for IoOperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOperationKind::Flush => write!(f, "flush"),
            IoOperationKind::Merge => write!(f, "merge"),
        }
    }
}

/// Lifecycle state of an I/O operation.
///
/// `Pending -> Running -> {Completed, Failed}`, or `Pending -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Cancelled
        )
    }
}

struct TicketState {
    state: OperationState,
    failure: Option<String>,
}

struct TicketInner {
    id: u64,
    kind: IoOperationKind,
    index: IndexId,
    state: Mutex<TicketState>,
    changed: Condvar,
}

/// Shared view of an operation's progress.
///
/// Cloned freely; every clone observes the same state.
#[derive(Clone)]
pub struct OperationTicket {
    inner: Arc<TicketInner>,
}

impl fmt::Debug for OperationTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTicket")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl OperationTicket {
    fn new(id: u64, kind: IoOperationKind, index: IndexId) -> Self {
        Self {
            inner: Arc::new(TicketInner {
                id,
                kind,
                index,
                state: Mutex::new(TicketState {
                    state: OperationState::Pending,
                    failure: None,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Returns the operation id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns the current state.
    pub fn state(&self) -> OperationState {
        self.inner.state.lock().state
    }

    /// Blocks until the operation reaches a terminal state.
    ///
    /// Returns the operation's failure or cancellation as an error.
    pub fn wait(&self) -> Result<()> {
        let mut guard = self.inner.state.lock();
        while !guard.state.is_terminal() {
            self.inner.changed.wait(&mut guard);
        }
        self.outcome(&guard)
    }

    /// Like `wait`, but gives up after `timeout` and returns `None`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let mut guard = self.inner.state.lock();
        if !guard.state.is_terminal() {
            let _ = self
                .inner
                .changed
                .wait_while_for(&mut guard, |s| !s.state.is_terminal(), timeout);
        }
        guard.state.is_terminal().then(|| self.outcome(&guard))
    }

    fn outcome(&self, guard: &TicketState) -> Result<()> {
        match guard.state {
            OperationState::Completed => Ok(()),
            OperationState::Cancelled => Err(KestrelError::OperationCancelled(self.inner.id)),
            _ => Err(KestrelError::IoOperationFailed {
                kind: self.inner.kind.to_string(),
                index: self.inner.index.to_string(),
                reason: guard.failure.clone().unwrap_or_default(),
            }),
        }
    }

    /// Cancels the operation if it has not started. Returns true on success.
    pub fn cancel(&self) -> bool {
        let mut guard = self.inner.state.lock();
        if guard.state != OperationState::Pending {
            return false;
        }
        guard.state = OperationState::Cancelled;
        self.inner.changed.notify_all();
        true
    }

    /// Moves `Pending` to `Running`. Returns false if the operation was cancelled.
    fn start(&self) -> Result<bool> {
        let mut guard = self.inner.state.lock();
        match guard.state {
            OperationState::Pending => {
                guard.state = OperationState::Running;
                Ok(true)
            }
            OperationState::Cancelled => Ok(false),
            other => Err(KestrelError::Internal(format!(
                "operation {} cannot start from {:?}",
                self.inner.id, other
            ))),
        }
    }

    fn finish(&self, result: &Result<()>) -> Result<()> {
        let mut guard = self.inner.state.lock();
        if guard.state != OperationState::Running {
            return Err(KestrelError::Internal(format!(
                "operation {} cannot finish from {:?}",
                self.inner.id, guard.state
            )));
        }
        match result {
            Ok(()) => guard.state = OperationState::Completed,
            Err(e) => {
                guard.state = OperationState::Failed;
                guard.failure = Some(e.to_string());
            }
        }
        self.inner.changed.notify_all();
        Ok(())
    }
}

/// Receiver of the structural work an operation describes.
///
/// Implemented by the LSM index. `on_completion` runs after `execute` and
/// before the ticket turns terminal, so a waiter always observes the index
/// after it has accounted for the outcome.
pub trait IoOperationTarget: Send + Sync {
    /// Performs the operation.
    fn execute(&self, op: &IoOperation) -> Result<()>;

    /// Reports the outcome of `execute`, success or failure.
    fn on_completion(&self, op: &IoOperation, result: &Result<()>);

    /// Reports that the operation was cancelled before it started.
    fn on_cancelled(&self, _op: &IoOperation) {}
}

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// A unit of background maintenance against one index.
pub struct IoOperation {
    id: u64,
    kind: IoOperationKind,
    index: IndexId,
    inputs: Vec<ComponentId>,
    output: ComponentId,
    target: Arc<dyn IoOperationTarget>,
    ticket: OperationTicket,
    cancel_reported: AtomicBool,
}

impl fmt::Debug for IoOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoOperation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("index", &self.index)
            .field("inputs", &self.inputs)
            .field("output", &self.output)
            .finish()
    }
}

impl IoOperation {
    /// Creates a pending operation.
    pub fn new(
        kind: IoOperationKind,
        index: IndexId,
        inputs: Vec<ComponentId>,
        output: ComponentId,
        target: Arc<dyn IoOperationTarget>,
    ) -> Self {
        let id = NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed);
        let ticket = OperationTicket::new(id, kind, index.clone());
        Self {
            id,
            kind,
            index,
            inputs,
            output,
            target,
            ticket,
            cancel_reported: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> IoOperationKind {
        self.kind
    }

    pub fn index(&self) -> &IndexId {
        &self.index
    }

    /// Components consumed by the operation, newest first.
    pub fn inputs(&self) -> &[ComponentId] {
        &self.inputs
    }

    /// Component produced by the operation.
    pub fn output(&self) -> ComponentId {
        self.output
    }

    pub fn ticket(&self) -> &OperationTicket {
        &self.ticket
    }

    /// Runs the operation to a terminal state on the current thread.
    pub(crate) fn run(&self) {
        match self.ticket.start() {
            Ok(true) => {}
            Ok(false) => {
                debug!(op = self.id, kind = %self.kind, index = %self.index, "Skipping cancelled operation");
                self.report_cancelled();
                return;
            }
            Err(e) => {
                error!(op = self.id, error = %e, "Operation in unexpected state");
                return;
            }
        }

        let result = catch_unwind(AssertUnwindSafe(|| self.target.execute(self))).unwrap_or_else(
            |_| {
                Err(KestrelError::Internal(format!(
                    "{} operation {} panicked",
                    self.kind, self.id
                )))
            },
        );
        if let Err(e) = &result {
            error!(op = self.id, kind = %self.kind, index = %self.index, error = %e, "I/O operation failed");
        }

        self.target.on_completion(self, &result);
        if let Err(e) = self.ticket.finish(&result) {
            error!(op = self.id, error = %e, "Failed to record operation outcome");
        }
    }

    /// Cancels a pending operation and notifies its target.
    ///
    /// The target is also notified when the ticket was already cancelled by a
    /// caller, since the operation is being dropped without ever running.
    pub(crate) fn cancel(&self) -> bool {
        let cancelled = self.ticket.cancel();
        if self.ticket.state() == OperationState::Cancelled {
            self.report_cancelled();
        }
        cancelled
    }

    /// Calls `on_cancelled` at most once per operation.
    fn report_cancelled(&self) {
        if !self.cancel_reported.swap(true, Ordering::AcqRel) {
            self.target.on_cancelled(self);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::thread;

    /// Records execution order; fails operations whose output generation is listed.
    #[derive(Default)]
    pub(crate) struct RecordingTarget {
        pub executed: Mutex<Vec<u64>>,
        pub completed: Mutex<Vec<(u64, bool)>>,
        pub cancelled: Mutex<Vec<u64>>,
        pub fail_generations: Vec<u64>,
        pub delay: Option<Duration>,
    }

    impl IoOperationTarget for RecordingTarget {
        fn execute(&self, op: &IoOperation) -> Result<()> {
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            self.executed.lock().push(op.output().max);
            if self.fail_generations.contains(&op.output().max) {
                return Err(KestrelError::Internal("disk full".to_string()));
            }
            Ok(())
        }

        fn on_completion(&self, op: &IoOperation, result: &Result<()>) {
            self.completed.lock().push((op.output().max, result.is_ok()));
        }

        fn on_cancelled(&self, op: &IoOperation) {
            self.cancelled.lock().push(op.output().max);
        }
    }

    pub(crate) fn flush_op(target: &Arc<RecordingTarget>, index: &str, generation: u64) -> IoOperation {
        IoOperation::new(
            IoOperationKind::Flush,
            IndexId::new(index),
            Vec::new(),
            ComponentId::flushed(generation),
            Arc::clone(target) as Arc<dyn IoOperationTarget>,
        )
    }

    #[test]
    fn test_run_completes_ticket_after_callback() {
        let target = Arc::new(RecordingTarget::default());
        let op = flush_op(&target, "idx", 1);
        let ticket = op.ticket().clone();
        assert_eq!(ticket.state(), OperationState::Pending);

        op.run();
        assert_eq!(ticket.state(), OperationState::Completed);
        assert!(ticket.wait().is_ok());
        assert_eq!(*target.completed.lock(), vec![(1, true)]);
    }

    #[test]
    fn test_failure_surfaces_through_ticket_and_callback() {
        let target = Arc::new(RecordingTarget {
            fail_generations: vec![7],
            ..Default::default()
        });
        let op = flush_op(&target, "idx", 7);
        op.run();

        let err = op.ticket().wait().unwrap_err();
        assert!(err.is_io_operation_failure());
        assert!(err.to_string().contains("disk full"));
        assert_eq!(op.ticket().state(), OperationState::Failed);
        assert_eq!(*target.completed.lock(), vec![(7, false)]);
    }

    #[test]
    fn test_cancel_only_from_pending() {
        let target = Arc::new(RecordingTarget::default());
        let op = flush_op(&target, "idx", 2);
        assert!(op.cancel());
        assert!(!op.cancel());
        op.run();
        assert!(target.executed.lock().is_empty());
        assert!(matches!(
            op.ticket().wait(),
            Err(KestrelError::OperationCancelled(_))
        ));

        let done = flush_op(&target, "idx", 3);
        done.run();
        assert!(!done.ticket().cancel());
        assert_eq!(*target.cancelled.lock(), vec![2]);
    }

    #[test]
    fn test_ticket_cancel_reaches_target_once() {
        let target = Arc::new(RecordingTarget::default());
        let op = flush_op(&target, "idx", 5);
        assert!(op.ticket().clone().cancel());
        assert!(target.cancelled.lock().is_empty());

        op.run();
        assert!(!op.cancel());
        op.run();
        assert!(target.executed.lock().is_empty());
        assert!(target.completed.lock().is_empty());
        assert_eq!(*target.cancelled.lock(), vec![5]);
    }

    #[test]
    fn test_wait_timeout_on_pending() {
        let target = Arc::new(RecordingTarget::default());
        let op = flush_op(&target, "idx", 4);
        assert!(op.ticket().wait_timeout(Duration::from_millis(10)).is_none());
        op.run();
        assert!(matches!(
            op.ticket().wait_timeout(Duration::from_millis(10)),
            Some(Ok(()))
        ));
    }

    #[test]
    fn test_component_id_ranges() {
        let merged = ComponentId::merged(&[
            ComponentId::flushed(5),
            ComponentId::flushed(4),
            ComponentId { min: 1, max: 3 },
        ])
        .unwrap();
        assert_eq!(merged, ComponentId { min: 1, max: 5 });
        assert!(merged.covers(&ComponentId::flushed(4)));
        assert!(!merged.covers(&ComponentId::flushed(6)));
        assert_eq!(merged.to_string(), "1-5");
        assert!(ComponentId::merged(&[]).is_none());
    }
}
