// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::records::{Cell, ExecutionQueueEntry, Output, RepresentationMap, RuntimeSession, SessionStatus};

/// Why a runtime session was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationReason {
    /// A newer session took over the notebook.
    Displaced,
    /// The agent shut down cleanly.
    Shutdown,
}

/// Terminal status of a finished execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Success,
    Error,
}

/// The event vocabulary of the replicated notebook log.
///
/// The agent only ever appends these; materialization into the record tables
/// is the store's job.  The wire shape is the notebook schema's camelCase
/// tagged form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NotebookEvent {
    // ── Cells ────────────────────────────────────────────────────────────────
    CellCreated {
        cell: Cell,
    },
    CellSourceChanged {
        cell_id: String,
        source: String,
    },
    /// Remove all outputs of a cell.  `wait` records that the producer
    /// deferred the clear until its next emission; by the time the event is
    /// committed the clear is unconditional.
    CellOutputsCleared {
        cell_id: String,
        #[serde(default)]
        wait: bool,
        cleared_by: String,
    },

    // ── Outputs ──────────────────────────────────────────────────────────────
    OutputAdded {
        output: Output,
    },
    /// Append text to an existing terminal output.
    TerminalAppended {
        output_id: String,
        text: String,
    },
    /// Append text to an existing markdown output.
    MarkdownAppended {
        output_id: String,
        text: String,
    },
    /// Replace the representations of the display output previously created
    /// with this `display_id`.  Ignored when no such display exists.
    DisplayUpdated {
        display_id: String,
        representations: RepresentationMap,
    },

    // ── Execution queue ──────────────────────────────────────────────────────
    ExecutionRequested {
        entry: ExecutionQueueEntry,
    },
    /// Claim a pending entry for a session.  The store rejects the commit
    /// when the entry is no longer pending; that rejection is how claim
    /// races between peer sessions are decided.
    ExecutionAssigned {
        queue_id: String,
        session_id: String,
    },
    ExecutionStarted {
        queue_id: String,
        cell_id: String,
        session_id: String,
        started_at: DateTime<Utc>,
    },
    ExecutionCancelled {
        queue_id: String,
    },
    ExecutionCompleted {
        queue_id: String,
        cell_id: String,
        status: CompletionStatus,
        #[serde(default)]
        error: Option<String>,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
    },

    // ── Runtime sessions ─────────────────────────────────────────────────────
    RuntimeSessionStarted {
        session: RuntimeSession,
    },
    RuntimeSessionStatusChanged {
        session_id: String,
        status: SessionStatus,
    },
    RuntimeSessionHeartbeat {
        session_id: String,
        at: DateTime<Utc>,
    },
    RuntimeSessionTerminated {
        session_id: String,
        reason: TerminationReason,
    },
}

impl NotebookEvent {
    /// Short event name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CellCreated { .. } => "cellCreated",
            Self::CellSourceChanged { .. } => "cellSourceChanged",
            Self::CellOutputsCleared { .. } => "cellOutputsCleared",
            Self::OutputAdded { .. } => "outputAdded",
            Self::TerminalAppended { .. } => "terminalAppended",
            Self::MarkdownAppended { .. } => "markdownAppended",
            Self::DisplayUpdated { .. } => "displayUpdated",
            Self::ExecutionRequested { .. } => "executionRequested",
            Self::ExecutionAssigned { .. } => "executionAssigned",
            Self::ExecutionStarted { .. } => "executionStarted",
            Self::ExecutionCancelled { .. } => "executionCancelled",
            Self::ExecutionCompleted { .. } => "executionCompleted",
            Self::RuntimeSessionStarted { .. } => "runtimeSessionStarted",
            Self::RuntimeSessionStatusChanged { .. } => "runtimeSessionStatusChanged",
            Self::RuntimeSessionHeartbeat { .. } => "runtimeSessionHeartbeat",
            Self::RuntimeSessionTerminated { .. } => "runtimeSessionTerminated",
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
