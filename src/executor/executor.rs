//! Worker Pool Implementation
//!
//! A fixed number of workers share one receiver. Each accepted action runs
//! in its own task so that a panicking backend call is reported through the
//! action's slot instead of taking the worker down.
//!
//! ## Responsibilities
//! - **Validation**: untyped `(name, slot, kwargs)` submissions are checked
//!   before anything is queued.
//! - **Execution**: invoking the backend method the action maps to.
//! - **Shutdown**: bounded join, abort of stragglers, shutdown errors for
//!   everything still queued.

use super::ActionBackend;
use super::types::{Action, ActionOutcome, ActionResult, ResultSlot};
use crate::config::MAX_POOL_SIZE;
use crate::error::{PdError, PdResult};

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};

/// Grace period for workers to notice an aborted action.
const ABORT_GRACE: Duration = Duration::from_millis(100);

struct QueuedAction {
    action: Action,
    slot: ResultSlot,
}

pub struct ActionExecutor {
    backend: Arc<dyn ActionBackend>,
    pool_size: usize,
    shutdown_timeout: Duration,
    tx: mpsc::UnboundedSender<QueuedAction>,
    /// Shared by all workers; whoever holds the lock is the next to receive.
    rx: Arc<Mutex<mpsc::UnboundedReceiver<QueuedAction>>>,
    quit: watch::Sender<bool>,
    stopped: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    in_flight: DashMap<u64, AbortHandle>,
    next_task: AtomicU64,
}

impl ActionExecutor {
    pub fn new(
        backend: Arc<dyn ActionBackend>,
        pool_size: usize,
        shutdown_timeout: Duration,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (quit, _) = watch::channel(false);

        Arc::new(Self {
            backend,
            pool_size: pool_size.clamp(1, MAX_POOL_SIZE),
            shutdown_timeout,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            quit,
            stopped: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            in_flight: DashMap::new(),
            next_task: AtomicU64::new(0),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Spawns the workers and returns immediately.
    pub async fn start(self: Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() || self.stopped.load(Ordering::SeqCst) {
            return;
        }

        for worker_id in 0..self.pool_size {
            let executor = self.clone();
            let quit = self.quit.subscribe();
            workers.push(tokio::spawn(async move {
                executor.worker_loop(worker_id, quit).await;
            }));
        }

        tracing::info!(
            "Action executor started with {} workers ({} backend)",
            self.pool_size,
            self.backend.name()
        );
    }

    /// Validates and enqueues an untyped action.
    ///
    /// A rejected action has its slot resolved with the rejection error,
    /// which is also returned; nothing is queued in that case.
    pub fn add_action(&self, action: (&str, ResultSlot, Value)) -> PdResult<()> {
        let (name, slot, kwargs) = action;
        match Action::from_parts(name, kwargs) {
            Ok(action) => self.submit(action, slot),
            Err(e) => {
                tracing::warn!("Rejected action '{}': {}", name, e);
                slot.resolve(Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Enqueues a typed action.
    pub fn submit(&self, action: Action, slot: ResultSlot) -> PdResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            let err = PdError::Shutdown("action executor is stopped".to_string());
            slot.resolve(Err(err.clone()));
            return Err(err);
        }

        tracing::debug!("Queued action {}", action.kind().name());
        self.tx
            .send(QueuedAction { action, slot })
            .map_err(|e| {
                let err = PdError::Shutdown("action queue closed".to_string());
                e.0.slot.resolve(Err(err.clone()));
                err
            })
    }

    /// Submits `action` and waits for its outcome.
    pub async fn execute_action(&self, action: Action) -> ActionOutcome {
        let (slot, result) = ResultSlot::new();
        self.submit(action, slot)?;
        result.wait().await
    }

    /// Submits `action` and hands back the read end of its slot.
    pub fn dispatch(&self, action: Action) -> ActionResult {
        let (slot, result) = ResultSlot::new();
        // Rejection already resolved the slot
        let _ = self.submit(action, slot);
        result
    }

    /// Stops accepting actions, waits for in-flight ones up to the shutdown
    /// timeout and resolves everything left with a shutdown error.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.quit.send_replace(true);

        let mut workers = std::mem::take(&mut *self.workers.lock().await);
        let joined = tokio::time::timeout(self.shutdown_timeout, join_all(&mut workers))
            .await
            .is_ok();

        if !joined {
            tracing::warn!(
                "Action executor did not stop within {:?}, aborting {} in-flight actions",
                self.shutdown_timeout,
                self.in_flight.len()
            );
            for entry in self.in_flight.iter() {
                entry.value().abort();
            }
            let settled = tokio::time::timeout(ABORT_GRACE, join_all(&mut workers))
                .await
                .is_ok();
            if !settled {
                for worker in &workers {
                    worker.abort();
                }
            }
        }

        let mut drained = 0;
        {
            let mut rx = self.rx.lock().await;
            while let Ok(queued) = rx.try_recv() {
                queued.slot.resolve(Err(PdError::Shutdown(format!(
                    "action {} not started before shutdown",
                    queued.action.kind().name()
                ))));
                drained += 1;
            }
        }
        if drained > 0 {
            tracing::info!("Resolved {} queued actions with shutdown errors", drained);
        }

        self.backend.shutdown().await;
        tracing::info!("Action executor stopped");
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut quit: watch::Receiver<bool>) {
        tracing::debug!("Action worker {} started", worker_id);

        loop {
            let queued = tokio::select! {
                biased;
                _ = quit.wait_for(|quit| *quit) => break,
                queued = async { self.rx.lock().await.recv().await } => queued,
            };
            let Some(queued) = queued else {
                break;
            };

            self.run(worker_id, queued).await;
        }

        tracing::debug!("Action worker {} exiting", worker_id);
    }

    async fn run(&self, worker_id: usize, queued: QueuedAction) {
        let QueuedAction { action, slot } = queued;
        let kind = action.kind();
        let task_id = self.next_task.fetch_add(1, Ordering::SeqCst);

        tracing::debug!("Worker {} executing {}", worker_id, kind.name());

        let backend = self.backend.clone();
        let task = tokio::spawn(async move { perform(backend.as_ref(), action).await });
        self.in_flight.insert(task_id, task.abort_handle());

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                tracing::error!("Action {} panicked", kind.name());
                Err(PdError::Action(format!("action {} panicked", kind.name())))
            }
            Err(_) => Err(PdError::Shutdown(format!(
                "action {} aborted during shutdown",
                kind.name()
            ))),
        };
        self.in_flight.remove(&task_id);

        if let Err(e) = &outcome {
            tracing::warn!("Action {} failed: {}", kind.name(), e);
        }
        if !slot.resolve(outcome) {
            tracing::debug!("Result of {} had no reader", kind.name());
        }
    }
}

/// Joins workers back to front. A handle is popped only once joined, so the
/// call can be retried after a timeout cancelled it.
async fn join_all(workers: &mut Vec<JoinHandle<()>>) {
    while let Some(worker) = workers.last_mut() {
        let _ = worker.await;
        workers.pop();
    }
}

/// Maps each action onto its backend method.
async fn perform(backend: &dyn ActionBackend, action: Action) -> ActionOutcome {
    match action {
        Action::SpawnProcess(request) => backend
            .spawn_process(&request)
            .await
            .map(Value::String)
            .map_err(PdError::from),
        Action::TerminateProcess(request) => backend
            .terminate_process(&request)
            .await
            .map(Value::Bool)
            .map_err(PdError::from),
    }
}
