//! Boundary between the controller and the command executor worker.
//!
//! The controller only ever submits work and pulls point-in-time result
//! snapshots; the executor drains pending commands and pushes reports back.
//! Completed reports are handed over exactly once per snapshot, while the
//! component health entry always reflects the latest probe.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::messages::{
    CommandReport, ComponentStatusReport, ExecutionCommand, StatusCommand,
};

/// Point-in-time view of executor results. Owning a snapshot shares nothing
/// with the queue.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub reports: Vec<CommandReport>,
    pub component_status: Vec<ComponentStatusReport>,
}

/// A command waiting for the executor.
#[derive(Debug, Clone)]
pub enum QueuedCommand {
    Execution(ExecutionCommand),
    Status(StatusCommand),
}

/// What the controller is allowed to do with the executor.
pub trait ActionQueue: Send + Sync {
    fn submit_executions(&self, commands: Vec<ExecutionCommand>);
    fn submit_statuses(&self, commands: Vec<StatusCommand>);
    fn result_snapshot(&self) -> QueueSnapshot;
    fn is_empty(&self) -> bool;
    fn request_stop(&self);
    fn await_stopped(&self) -> impl std::future::Future<Output = ()> + Send;
}

#[derive(Debug, Default)]
struct QueueInner {
    pending: VecDeque<QueuedCommand>,
    reports: Vec<CommandReport>,
    component_status: Vec<ComponentStatusReport>,
    stop_requested: bool,
}

/// Shared work queue between the controller task and the executor worker.
///
/// The lock is held only for short moves in and out of the inner buffers,
/// never across I/O.
pub struct CommandQueue {
    inner: Mutex<QueueInner>,
    stop: watch::Sender<bool>,
    workers: watch::Sender<usize>,
}

impl CommandQueue {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        let (workers, _) = watch::channel(0);
        Self {
            inner: Mutex::new(QueueInner::default()),
            stop,
            workers,
        }
    }

    // ── executor-side interface ──────────────────────────────────────

    /// Register an executor worker. The returned token must stay alive for as
    /// long as the worker runs; dropping it tells `await_stopped` the worker
    /// has drained.
    pub fn attach_worker(self: &Arc<Self>) -> WorkerToken {
        self.workers.send_modify(|count| *count += 1);
        WorkerToken {
            queue: Arc::clone(self),
        }
    }

    /// Next command to run, oldest first.
    pub fn take_next(&self) -> Option<QueuedCommand> {
        self.inner.lock().pending.pop_front()
    }

    /// Record the outcome of a finished or in-progress command.
    pub fn push_report(&self, report: CommandReport) {
        self.inner.lock().reports.push(report);
    }

    /// Replace the component health entry with the latest probe result.
    pub fn set_component_status(&self, status: ComponentStatusReport) {
        self.inner.lock().component_status = vec![status];
    }

    /// Watch channel flipped to `true` once the controller wants the
    /// executor to drain and stop.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn stop_requested(&self) -> bool {
        self.inner.lock().stop_requested
    }

    fn worker_done(&self) {
        self.workers
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionQueue for CommandQueue {
    fn submit_executions(&self, commands: Vec<ExecutionCommand>) {
        if commands.is_empty() {
            debug!("no execution commands from the server");
            return;
        }
        debug!(count = commands.len(), "queueing execution commands");
        let mut inner = self.inner.lock();
        inner
            .pending
            .extend(commands.into_iter().map(QueuedCommand::Execution));
    }

    fn submit_statuses(&self, commands: Vec<StatusCommand>) {
        if commands.is_empty() {
            debug!("no status commands from the server");
            return;
        }
        debug!(count = commands.len(), "queueing status commands");
        let mut inner = self.inner.lock();
        inner
            .pending
            .extend(commands.into_iter().map(QueuedCommand::Status));
    }

    fn result_snapshot(&self) -> QueueSnapshot {
        let mut inner = self.inner.lock();
        QueueSnapshot {
            reports: std::mem::take(&mut inner.reports),
            component_status: inner.component_status.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

    fn request_stop(&self) {
        self.inner.lock().stop_requested = true;
        // send_replace stores the value even while no receiver exists, so a
        // worker subscribing later still observes the stop.
        self.stop.send_replace(true);
    }

    async fn await_stopped(&self) {
        let mut running = self.workers.subscribe();
        let _ = running.wait_for(|count| *count == 0).await;
    }
}

/// Liveness marker for one executor worker.
pub struct WorkerToken {
    queue: Arc<CommandQueue>,
}

impl Drop for WorkerToken {
    fn drop(&mut self) {
        self.queue.worker_done();
    }
}
