// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-memory reference store.
//!
//! Materializes the event log into the record tables with the same
//! linearization guarantees the replicated backend provides: commits are
//! applied one at a time under a single lock, and a commit that loses a
//! claim race is rejected rather than applied.  Used by the test suites and
//! by the binary when no sync transport is configured.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::{CompletionStatus, NotebookEvent};
use crate::records::{Cell, ExecutionQueueEntry, Output, OutputPayload, QueueStatus, RuntimeSession, SessionStatus};
use crate::store::{Record, Selector, Store, StoreError, StoreResult, Subscription};

#[derive(Default)]
struct Tables {
    cells: HashMap<String, Cell>,
    queue: HashMap<String, ExecutionQueueEntry>,
    sessions: HashMap<String, RuntimeSession>,
    /// Insertion order is preserved so equal positions keep arrival order.
    outputs: Vec<Output>,
}

struct SubEntry {
    id: u64,
    selector: Selector,
    tx: mpsc::UnboundedSender<Vec<Record>>,
    /// Fingerprint of the last delivered result set.
    last: String,
}

#[derive(Default)]
struct Inner {
    tables: Tables,
    subs: Vec<SubEntry>,
    next_sub_id: u64,
    /// Every accepted event, in commit order.
    log: Vec<NotebookEvent>,
}

/// In-memory, linearizing [`Store`] implementation.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event accepted so far, in commit order.  Rejected commits do
    /// not appear.  Test suites assert on this log.
    pub fn committed_events(&self) -> Vec<NotebookEvent> {
        self.inner.lock().unwrap().log.clone()
    }

    /// Convenience: seed a cell directly, as an external producer would.
    pub async fn seed_cell(&self, cell: Cell) {
        let _ = self.commit(NotebookEvent::CellCreated { cell }).await;
    }

    fn evaluate(tables: &Tables, selector: &Selector) -> Vec<Record> {
        match selector {
            Selector::QueueByStatus { status, assigned_session } => {
                let mut entries: Vec<&ExecutionQueueEntry> = tables
                    .queue
                    .values()
                    .filter(|e| {
                        e.status == *status
                            && assigned_session
                                .as_ref()
                                .map(|s| e.assigned_runtime_session.as_deref() == Some(s.as_str()))
                                .unwrap_or(true)
                    })
                    .collect();
                entries.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
                entries.into_iter().cloned().map(Record::Queue).collect()
            }
            Selector::ActiveSessions => {
                let mut sessions: Vec<&RuntimeSession> =
                    tables.sessions.values().filter(|s| s.is_active).collect();
                sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
                sessions.into_iter().cloned().map(Record::Session).collect()
            }
            Selector::CellById { cell_id } => tables
                .cells
                .get(cell_id)
                .cloned()
                .map(Record::Cell)
                .into_iter()
                .collect(),
            Selector::AllCells => {
                let mut cells: Vec<&Cell> = tables.cells.values().collect();
                cells.sort_by(|a, b| {
                    a.position.partial_cmp(&b.position).unwrap_or(Ordering::Equal)
                });
                cells.into_iter().cloned().map(Record::Cell).collect()
            }
            Selector::OutputsForCell { cell_id } => {
                let mut outputs: Vec<&Output> =
                    tables.outputs.iter().filter(|o| &o.cell_id == cell_id).collect();
                outputs.sort_by_key(|o| o.position);
                outputs.into_iter().cloned().map(Record::Output).collect()
            }
        }
    }

    fn fingerprint(records: &[Record]) -> String {
        serde_json::to_string(records).unwrap_or_default()
    }

    /// Apply one event to the tables.  Returns Err only for commits the
    /// backend would reject (currently: claiming a non-pending entry).
    fn apply(tables: &mut Tables, event: &NotebookEvent) -> StoreResult<()> {
        match event {
            NotebookEvent::CellCreated { cell } => {
                tables.cells.insert(cell.id.clone(), cell.clone());
            }
            NotebookEvent::CellSourceChanged { cell_id, source } => {
                if let Some(cell) = tables.cells.get_mut(cell_id) {
                    cell.source = source.clone();
                }
            }
            NotebookEvent::CellOutputsCleared { cell_id, .. } => {
                tables.outputs.retain(|o| &o.cell_id != cell_id);
            }
            NotebookEvent::OutputAdded { output } => {
                tables.outputs.push(output.clone());
            }
            NotebookEvent::TerminalAppended { output_id, text } => {
                if let Some(out) = tables.outputs.iter_mut().find(|o| &o.id == output_id) {
                    if let OutputPayload::Terminal { text: existing, .. } = &mut out.payload {
                        existing.push_str(text);
                    }
                }
            }
            NotebookEvent::MarkdownAppended { output_id, text } => {
                if let Some(out) = tables.outputs.iter_mut().find(|o| &o.id == output_id) {
                    if let OutputPayload::Markdown { text: existing } = &mut out.payload {
                        existing.push_str(text);
                    }
                }
            }
            NotebookEvent::DisplayUpdated { display_id, representations } => {
                // Updates for unknown display ids are ignored.
                let target = tables.outputs.iter_mut().find(|o| {
                    matches!(
                        &o.payload,
                        OutputPayload::MultimediaDisplay { display_id: Some(d), .. } if d == display_id
                    )
                });
                if let Some(out) = target {
                    if let OutputPayload::MultimediaDisplay { representations: reps, .. } =
                        &mut out.payload
                    {
                        *reps = representations.clone();
                    }
                }
            }
            NotebookEvent::ExecutionRequested { entry } => {
                if let Some(cell) = tables.cells.get_mut(&entry.cell_id) {
                    cell.execution_count = cell.execution_count.max(entry.execution_count);
                }
                tables.queue.insert(entry.id.clone(), entry.clone());
            }
            NotebookEvent::ExecutionAssigned { queue_id, session_id } => {
                let entry = tables
                    .queue
                    .get_mut(queue_id)
                    .ok_or_else(|| StoreError::Rejected(format!("unknown queue entry {queue_id}")))?;
                if entry.status != QueueStatus::Pending {
                    return Err(StoreError::Rejected(format!(
                        "queue entry {queue_id} is not pending"
                    )));
                }
                entry.status = QueueStatus::Assigned;
                entry.assigned_runtime_session = Some(session_id.clone());
            }
            NotebookEvent::ExecutionStarted { queue_id, started_at, .. } => {
                if let Some(entry) = tables.queue.get_mut(queue_id) {
                    entry.status = QueueStatus::Executing;
                    entry.started_at = Some(*started_at);
                }
            }
            NotebookEvent::ExecutionCancelled { queue_id } => {
                if let Some(entry) = tables.queue.get_mut(queue_id) {
                    if !entry.status.is_terminal() {
                        entry.status = QueueStatus::Cancelled;
                    }
                }
            }
            NotebookEvent::ExecutionCompleted {
                queue_id,
                status,
                error,
                completed_at,
                duration_ms,
                ..
            } => {
                if let Some(entry) = tables.queue.get_mut(queue_id) {
                    // A completion racing a cancellation loses: the entry
                    // stays cancelled.
                    if entry.status != QueueStatus::Cancelled {
                        entry.status = match status {
                            CompletionStatus::Success => QueueStatus::Completed,
                            CompletionStatus::Error => QueueStatus::Failed,
                        };
                        entry.error = error.clone();
                        entry.completed_at = Some(*completed_at);
                        entry.execution_duration_ms = Some(*duration_ms);
                    }
                }
            }
            NotebookEvent::RuntimeSessionStarted { session } => {
                tables.sessions.insert(session.session_id.clone(), session.clone());
            }
            NotebookEvent::RuntimeSessionStatusChanged { session_id, status } => {
                if let Some(session) = tables.sessions.get_mut(session_id) {
                    session.status = *status;
                }
            }
            NotebookEvent::RuntimeSessionHeartbeat { session_id, at } => {
                if let Some(session) = tables.sessions.get_mut(session_id) {
                    session.last_heartbeat = *at;
                }
            }
            NotebookEvent::RuntimeSessionTerminated { session_id, .. } => {
                if let Some(session) = tables.sessions.get_mut(session_id) {
                    session.status = SessionStatus::Terminated;
                    session.is_active = false;
                }
            }
        }
        Ok(())
    }

    /// Re-evaluate every subscription and deliver changed result sets.
    /// Senders whose receiver is gone are pruned.
    fn notify(inner: &mut Inner) {
        let Inner { tables, subs, .. } = inner;
        subs.retain_mut(|sub| {
            let records = Self::evaluate(tables, &sub.selector);
            let fp = Self::fingerprint(&records);
            if fp == sub.last {
                return true;
            }
            sub.last = fp;
            sub.tx.send(records).is_ok()
        });
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn commit(&self, event: NotebookEvent) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::apply(&mut inner.tables, &event)?;
        debug!(event = event.name(), "committed");
        inner.log.push(event);
        Self::notify(&mut inner);
        Ok(())
    }

    async fn query(&self, selector: Selector) -> StoreResult<Vec<Record>> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::evaluate(&inner.tables, &selector))
    }

    fn subscribe(&self, selector: Selector, tx: mpsc::UnboundedSender<Vec<Record>>) -> Subscription {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;

        // Initial delivery of the current result set.
        let records = Self::evaluate(&inner.tables, &selector);
        let last = Self::fingerprint(&records);
        let _ = tx.send(records);

        inner.subs.push(SubEntry { id, selector, tx, last });

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(strong) = weak.upgrade() {
                strong.lock().unwrap().subs.retain(|s| s.id != id);
            }
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
