// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Cells ────────────────────────────────────────────────────────────────────

/// The kind of a notebook cell.  Determines which execution handler is
/// invoked when the cell is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
    Sql,
    Ai,
}

impl std::fmt::Display for CellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Code => "code",
            Self::Markdown => "markdown",
            Self::Raw => "raw",
            Self::Sql => "sql",
            Self::Ai => "ai",
        };
        write!(f, "{s}")
    }
}

/// A notebook cell.  Identity is immutable; source is mutable.
///
/// `position` is a floating-point ordering key: new cells insert between
/// neighbours without renumbering the rest of the notebook.  Positions define
/// the strict total order used for display and for AI-context assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    pub id: String,
    pub cell_type: CellType,
    pub source: String,
    pub position: f64,
    /// When `false` the cell is excluded from AI conversation context.
    #[serde(default = "default_true")]
    pub ai_context_visible: bool,
    /// Monotonic per-cell execution counter.
    #[serde(default)]
    pub execution_count: u64,
}

fn default_true() -> bool {
    true
}

impl Cell {
    pub fn new(id: impl Into<String>, cell_type: CellType, source: impl Into<String>, position: f64) -> Self {
        Self {
            id: id.into(),
            cell_type,
            source: source.into(),
            position,
            ai_context_visible: true,
            execution_count: 0,
        }
    }
}

// ─── Execution queue ──────────────────────────────────────────────────────────

/// Lifecycle state of an execution request.
///
/// pending → assigned → executing → (completed | failed | cancelled).
/// Only the pending → assigned transition may be raced by peer sessions;
/// the winner performs all later transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Assigned,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    /// True for the three states an entry can never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One requested execution of a cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionQueueEntry {
    pub id: String,
    pub cell_id: String,
    pub execution_count: u64,
    pub requested_by: String,
    /// Higher values are claimed first.
    #[serde(default)]
    pub priority: i32,
    pub status: QueueStatus,
    #[serde(default)]
    pub assigned_runtime_session: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_duration_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

// ─── Runtime sessions ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Ready,
    Busy,
    Terminated,
}

/// What a runtime session can execute, advertised at session start so the
/// notebook UI can route work appropriately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCapabilities {
    pub can_execute_code: bool,
    pub can_execute_sql: bool,
    pub can_execute_ai: bool,
    #[serde(default)]
    pub available_ai_models: Vec<String>,
}

/// One agent instance attached to a notebook.
///
/// At most one session per notebook has `is_active = true`; a newly starting
/// session displaces the existing ones before announcing itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSession {
    pub session_id: String,
    pub runtime_id: String,
    pub runtime_type: String,
    pub capabilities: RuntimeCapabilities,
    pub status: SessionStatus,
    pub is_active: bool,
    pub last_heartbeat: DateTime<Utc>,
}

// ─── Outputs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepresentationKind {
    Inline,
    Reference,
}

/// One MIME-typed payload variant of a multimedia output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representation {
    pub kind: RepresentationKind,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Representation {
    pub fn inline(data: Value) -> Self {
        Self { kind: RepresentationKind::Inline, data, metadata: None }
    }

    pub fn inline_with_metadata(data: Value, metadata: Option<Value>) -> Self {
        Self { kind: RepresentationKind::Inline, data, metadata }
    }
}

/// MIME type → representation, ordered so serialization is deterministic.
pub type RepresentationMap = BTreeMap<String, Representation>;

/// MIME type → raw (un-normalized) value, as supplied by a handler.
pub type RawMediaMap = BTreeMap<String, Value>;

/// The variant-specific payload of an output record.
///
/// Modelled as a tagged union so that which fields exist for which output
/// kind is checked by the compiler rather than by convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outputType", rename_all = "snake_case")]
pub enum OutputPayload {
    /// Appendable stdout/stderr text.
    Terminal { stream: StreamName, text: String },
    /// Rich display data; `display_id` enables later in-place updates.
    MultimediaDisplay {
        representations: RepresentationMap,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_id: Option<String>,
    },
    /// Rich execution result, tied to the execution counter of its request.
    MultimediaResult {
        representations: RepresentationMap,
        execution_count: u64,
    },
    /// Appendable markdown text (streamed assistant responses).
    Markdown { text: String },
    /// A structured execution error.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

/// One emitted output, owned by its cell.
///
/// `position` is 0-based within the cell's current output sequence, i.e.
/// since the last clear; appends and display updates mutate an existing
/// record and never allocate a new position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    pub id: String,
    pub cell_id: String,
    pub position: u64,
    #[serde(flatten)]
    pub payload: OutputPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
