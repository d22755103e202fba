// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::events::NotebookEvent;
use crate::records::{Cell, ExecutionQueueEntry, Output, QueueStatus, RuntimeSession};

/// Errors surfaced by a store backend.
///
/// `Rejected` is an expected part of normal operation: it is how claim
/// races are lost.  `Unavailable` covers transient transport failure; per
/// the error-handling policy callers log it at debug and drop the operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("commit rejected: {0}")]
    Rejected(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A point-in-time read over one of the notebook's record tables.
///
/// Each selector fixes the table, the filter and the ordering, so a
/// subscription callback receives exactly the rows it asked for and nothing
/// about the schema leaks into call sites.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// Queue entries with the given status, optionally restricted to one
    /// assigned session.  Ordered by priority descending.
    QueueByStatus {
        status: QueueStatus,
        assigned_session: Option<String>,
    },
    /// Sessions with `is_active = true`.
    ActiveSessions,
    /// A single cell by id.
    CellById { cell_id: String },
    /// All cells, ordered by position ascending.
    AllCells,
    /// Outputs of one cell, ordered by position ascending.
    OutputsForCell { cell_id: String },
}

/// One row returned by [`Store::query`].
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Record {
    Cell(Cell),
    Queue(ExecutionQueueEntry),
    Session(RuntimeSession),
    Output(Output),
}

impl Record {
    pub fn as_cell(&self) -> Option<&Cell> {
        match self {
            Self::Cell(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_queue(&self) -> Option<&ExecutionQueueEntry> {
        match self {
            Self::Queue(q) => Some(q),
            _ => None,
        }
    }

    pub fn as_session(&self) -> Option<&RuntimeSession> {
        match self {
            Self::Session(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_output(&self) -> Option<&Output> {
        match self {
            Self::Output(o) => Some(o),
            _ => None,
        }
    }
}

/// Guard for a live subscription.  Dropping it unsubscribes.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self { unsubscribe: Some(Box::new(unsubscribe)) }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

/// The replicated notebook log, as seen by the agent.
///
/// Three primitives and nothing else: append an event, read a table, watch a
/// query.  The store linearizes commits; the agent holds no read-modify-write
/// invariants across them and performs no explicit transactions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append one event.  A rejected commit (e.g. a lost claim race) returns
    /// [`StoreError::Rejected`].
    async fn commit(&self, event: NotebookEvent) -> StoreResult<()>;

    /// Point-in-time read of the selector's current result set.
    async fn query(&self, selector: Selector) -> StoreResult<Vec<Record>>;

    /// Live delivery of the selector's result set: the current rows are sent
    /// immediately, then again whenever the result set changes.  Delivery
    /// stops when the returned guard is dropped.
    fn subscribe(&self, selector: Selector, tx: mpsc::UnboundedSender<Vec<Record>>) -> Subscription;
}
