// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The coordination engine.
//!
//! One dispatch task owns the reactive work loop: it watches the replicated
//! queue, claims pending work cooperatively against peer sessions, and runs
//! assigned executions serially.  A small side task watches cancellations so
//! an in-flight execution's abort handle fires while the dispatch task is
//! busy awaiting the handler.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cello_store::{
    Cell, CellType, CompletionStatus, ExecutionQueueEntry, NotebookEvent, QueueStatus, Record,
    Selector, SessionStatus, Store,
};

use crate::context::ExecutionContext;
use crate::handler::{ExecutionHandler, ExecutionOutcome};

/// Hook invoked when a handler fails; receives the error and the context of
/// the failing execution.
pub type ExecutionErrorHook = Arc<dyn Fn(&anyhow::Error, &ExecutionContext) + Send + Sync>;

/// Executions this session is currently responsible for.
///
/// Shared between the dispatch task and the cancellation watcher; all
/// accesses are short lock-compute-unlock sections.
#[derive(Default)]
struct FlightTable {
    /// Queue ids dispatched and not yet observed in a terminal state.
    /// Guards against redundant invocations when the assigned subscription
    /// re-fires with a stale result set.
    in_flight: HashSet<String>,
    /// Abort handle per in-flight execution.
    tokens: HashMap<String, CancellationToken>,
    /// Queue ids observed on the cancelled subscription.  Completion-error
    /// commits are suppressed for these.
    cancelled: HashSet<String>,
}

pub struct CoordinationEngine {
    store: Arc<dyn Store>,
    session_id: String,
    handlers: HashMap<CellType, Arc<dyn ExecutionHandler>>,
    on_execution_error: Option<ExecutionErrorHook>,
    shutdown: CancellationToken,
    flight: Arc<Mutex<FlightTable>>,
}

impl CoordinationEngine {
    pub fn new(store: Arc<dyn Store>, session_id: impl Into<String>, shutdown: CancellationToken) -> Self {
        Self {
            store,
            session_id: session_id.into(),
            handlers: HashMap::new(),
            on_execution_error: None,
            shutdown,
            flight: Arc::new(Mutex::new(FlightTable::default())),
        }
    }

    /// Register the handler invoked for cells of the given kind.
    pub fn register(&mut self, cell_type: CellType, handler: Arc<dyn ExecutionHandler>) {
        self.handlers.insert(cell_type, handler);
    }

    pub fn set_error_hook(&mut self, hook: ExecutionErrorHook) {
        self.on_execution_error = Some(hook);
    }

    /// The shutdown token this engine observes.  The runtime lifecycle owns
    /// cancelling it.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Install the subscriptions and run the work loop until shutdown.
    ///
    /// Everything user-facing flows through handler contexts; this loop only
    /// returns when the shutdown token fires or the store drops every
    /// subscription.
    pub async fn run(&self) {
        let (assigned_tx, mut assigned_rx) = mpsc::unbounded_channel();
        let _assigned_sub = self.store.subscribe(
            Selector::QueueByStatus {
                status: QueueStatus::Assigned,
                assigned_session: Some(self.session_id.clone()),
            },
            assigned_tx,
        );

        let (pending_tx, mut pending_rx) = mpsc::unbounded_channel();
        let _pending_sub = self.store.subscribe(
            Selector::QueueByStatus { status: QueueStatus::Pending, assigned_session: None },
            pending_tx,
        );

        let (completed_tx, mut completed_rx) = mpsc::unbounded_channel();
        let _completed_sub = self.store.subscribe(
            Selector::QueueByStatus { status: QueueStatus::Completed, assigned_session: None },
            completed_tx,
        );

        let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
        let _failed_sub = self.store.subscribe(
            Selector::QueueByStatus { status: QueueStatus::Failed, assigned_session: None },
            failed_tx,
        );

        // The cancellation watcher runs beside the dispatch task so that an
        // abort handle fires even while a handler is being awaited here.
        let (cancelled_tx, cancelled_rx) = mpsc::unbounded_channel();
        let _cancelled_sub = self.store.subscribe(
            Selector::QueueByStatus { status: QueueStatus::Cancelled, assigned_session: None },
            cancelled_tx,
        );
        let watcher = tokio::spawn(watch_cancellations(
            cancelled_rx,
            Arc::clone(&self.flight),
            self.shutdown.clone(),
        ));

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(batch) = assigned_rx.recv() => {
                    for entry in queue_entries(batch) {
                        let fresh = self.flight.lock().unwrap().in_flight.insert(entry.id.clone());
                        if fresh {
                            self.dispatch(entry).await;
                        }
                    }
                }
                Some(batch) = pending_rx.recv() => {
                    self.try_claim(queue_entries(batch)).await;
                }
                Some(batch) = completed_rx.recv() => {
                    self.forget(queue_entries(batch));
                }
                Some(batch) = failed_rx.recv() => {
                    self.forget(queue_entries(batch));
                }
                else => break,
            }
        }

        watcher.abort();
        let _ = watcher.await;
    }

    /// Claim the highest-priority pending entry for this session.
    ///
    /// A rejected commit means a peer won the race; the pending subscription
    /// fires again if work remains, so losing costs nothing.
    async fn try_claim(&self, pending: Vec<ExecutionQueueEntry>) {
        let Some(first) = pending.first() else { return };

        // Until our own session-start event has propagated back, peers would
        // see an assignment from a session that does not exist.  Hold off.
        let sessions = match self.store.query(Selector::ActiveSessions).await {
            Ok(records) => records,
            Err(e) => {
                debug!(error = %e, "active-session query dropped");
                return;
            }
        };
        let me_visible = sessions
            .iter()
            .filter_map(Record::as_session)
            .any(|s| s.session_id == self.session_id);
        if !me_visible {
            return;
        }

        match self
            .store
            .commit(NotebookEvent::ExecutionAssigned {
                queue_id: first.id.clone(),
                session_id: self.session_id.clone(),
            })
            .await
        {
            Ok(()) => debug!(queue_id = %first.id, "claimed execution"),
            Err(e) => debug!(queue_id = %first.id, error = %e, "claim lost"),
        }
    }

    /// Run one assigned execution to completion.
    async fn dispatch(&self, entry: ExecutionQueueEntry) {
        debug!(queue_id = %entry.id, cell_id = %entry.cell_id, "dispatching");

        let cell = match self.load_cell(&entry.cell_id).await {
            Some(cell) => cell,
            None => {
                self.commit_bookkeeping(NotebookEvent::ExecutionCompleted {
                    queue_id: entry.id.clone(),
                    cell_id: entry.cell_id.clone(),
                    status: CompletionStatus::Error,
                    error: Some(format!("Cell {} not found", entry.cell_id)),
                    completed_at: Utc::now(),
                    duration_ms: 0,
                })
                .await;
                return;
            }
        };

        let token = CancellationToken::new();
        {
            let mut flight = self.flight.lock().unwrap();
            // A cancellation may already have been observed between claim
            // and dispatch.
            if flight.cancelled.contains(&entry.id) {
                token.cancel();
            }
            flight.tokens.insert(entry.id.clone(), token.clone());
        }

        let ctx = Arc::new(ExecutionContext::new(
            Arc::clone(&self.store),
            entry.cell_id.clone(),
            entry.id.clone(),
            entry.execution_count,
            self.session_id.clone(),
            token.clone(),
        ));

        self.commit_bookkeeping(NotebookEvent::ExecutionStarted {
            queue_id: entry.id.clone(),
            cell_id: entry.cell_id.clone(),
            session_id: self.session_id.clone(),
            started_at: Utc::now(),
        })
        .await;
        self.set_session_status(SessionStatus::Busy).await;
        ctx.clear(false).await;

        let started = Instant::now();
        let cell_type = cell.cell_type;
        let result = match self.handlers.get(&cell.cell_type) {
            Some(handler) => handler.execute(Arc::clone(&ctx), cell).await,
            None => Ok(ExecutionOutcome::failure(format!(
                "no handler registered for {cell_type} cells"
            ))),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        self.set_session_status(SessionStatus::Ready).await;

        let was_cancelled = {
            let flight = self.flight.lock().unwrap();
            flight.cancelled.contains(&entry.id)
        } || token.is_cancelled();

        match result {
            Ok(outcome) => {
                if outcome.success {
                    if let Some(data) = &outcome.result {
                        ctx.result(data, None).await;
                    }
                    self.commit_bookkeeping(NotebookEvent::ExecutionCompleted {
                        queue_id: entry.id.clone(),
                        cell_id: entry.cell_id.clone(),
                        status: CompletionStatus::Success,
                        error: None,
                        completed_at: Utc::now(),
                        duration_ms,
                    })
                    .await;
                } else if was_cancelled {
                    // The store already reflects status=cancelled; writing a
                    // completion error would resurrect the entry.
                    debug!(queue_id = %entry.id, "cancelled execution, completion suppressed");
                } else {
                    self.record_failure(&entry, outcome.error.as_deref(), duration_ms, &ctx).await;
                }
            }
            Err(err) => {
                if was_cancelled {
                    debug!(queue_id = %entry.id, "cancelled execution failed late, completion suppressed");
                } else {
                    self.record_failure(&entry, Some(&err.to_string()), duration_ms, &ctx).await;
                }
            }
        }

        self.flight.lock().unwrap().tokens.remove(&entry.id);
    }

    async fn record_failure(
        &self,
        entry: &ExecutionQueueEntry,
        error: Option<&str>,
        duration_ms: u64,
        ctx: &ExecutionContext,
    ) {
        let message = error.unwrap_or("execution failed").to_string();
        if let Some(hook) = &self.on_execution_error {
            hook(&anyhow::anyhow!(message.clone()), ctx);
        }
        self.commit_bookkeeping(NotebookEvent::ExecutionCompleted {
            queue_id: entry.id.clone(),
            cell_id: entry.cell_id.clone(),
            status: CompletionStatus::Error,
            error: Some(message),
            completed_at: Utc::now(),
            duration_ms,
        })
        .await;
    }

    async fn load_cell(&self, cell_id: &str) -> Option<Cell> {
        match self.store.query(Selector::CellById { cell_id: cell_id.to_string() }).await {
            Ok(records) => records.into_iter().find_map(|r| match r {
                Record::Cell(c) => Some(c),
                _ => None,
            }),
            Err(e) => {
                debug!(error = %e, cell_id, "cell query dropped");
                None
            }
        }
    }

    /// Drop bookkeeping for entries that reached a terminal state.
    fn forget(&self, terminal: Vec<ExecutionQueueEntry>) {
        let mut flight = self.flight.lock().unwrap();
        for entry in terminal {
            flight.in_flight.remove(&entry.id);
            flight.tokens.remove(&entry.id);
        }
    }

    async fn set_session_status(&self, status: SessionStatus) {
        self.commit_bookkeeping(NotebookEvent::RuntimeSessionStatusChanged {
            session_id: self.session_id.clone(),
            status,
        })
        .await;
    }

    /// A transiently unavailable store must not kill the agent: bookkeeping
    /// commit failures are logged and swallowed.
    async fn commit_bookkeeping(&self, event: NotebookEvent) {
        let name = event.name();
        if let Err(e) = self.store.commit(event).await {
            debug!(event = name, error = %e, "bookkeeping commit dropped");
        }
    }
}

/// Side task: abort in-flight executions whose entries turn up cancelled.
async fn watch_cancellations(
    mut rx: mpsc::UnboundedReceiver<Vec<Record>>,
    flight: Arc<Mutex<FlightTable>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            batch = rx.recv() => {
                let Some(batch) = batch else { break };
                for entry in queue_entries(batch) {
                    let mut flight = flight.lock().unwrap();
                    if flight.cancelled.insert(entry.id.clone()) {
                        debug!(queue_id = %entry.id, "cancellation observed");
                    }
                    flight.in_flight.remove(&entry.id);
                    if let Some(token) = flight.tokens.get(&entry.id) {
                        token.cancel();
                    }
                }
            }
        }
    }
}

fn queue_entries(batch: Vec<Record>) -> Vec<ExecutionQueueEntry> {
    batch
        .into_iter()
        .filter_map(|r| match r {
            Record::Queue(q) => Some(q),
            other => {
                warn!(?other, "non-queue record on queue subscription");
                None
            }
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
