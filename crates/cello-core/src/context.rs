// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The execution context: the sole conduit by which handlers emit
//! observable results into the replicated log.
//!
//! The position counter lives here, not on the engine: each context counts
//! its own cell's outputs from 0, resets on an immediate clear, and never
//! advances for appends or display updates.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use cello_store::{
    NotebookEvent, Output, OutputPayload, RawMediaMap, Store, StreamName,
};

use crate::media::normalize_media;

/// Raised by [`ExecutionContext::check_cancellation`] when the execution's
/// abort handle has been triggered.
#[derive(Debug, Error)]
#[error("Execution cancelled")]
pub struct ExecutionCancelled;

struct EmitterState {
    position: u64,
    /// Set by `clear(wait = true)`: the clear is committed immediately
    /// before the next emission instead of now, and the position counter is
    /// left alone.
    pending_clear: bool,
}

/// Per-execution emitter handed to handlers.
///
/// All store failures inside the context follow the transport policy: they
/// are logged at debug and the operation is dropped; nothing propagates back
/// into the handler.
pub struct ExecutionContext {
    store: Arc<dyn Store>,
    cell_id: String,
    queue_id: String,
    execution_count: u64,
    session_id: String,
    cancel: CancellationToken,
    state: Mutex<EmitterState>,
}

impl ExecutionContext {
    pub fn new(
        store: Arc<dyn Store>,
        cell_id: impl Into<String>,
        queue_id: impl Into<String>,
        execution_count: u64,
        session_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            cell_id: cell_id.into(),
            queue_id: queue_id.into(),
            execution_count,
            session_id: session_id.into(),
            cancel,
            state: Mutex::new(EmitterState { position: 0, pending_clear: false }),
        }
    }

    pub fn cell_id(&self) -> &str {
        &self.cell_id
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    // ── Cancellation ─────────────────────────────────────────────────────────

    /// The abort handle for this execution.  Handlers observe it at their
    /// natural yield points.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancellation(&self) -> Result<(), ExecutionCancelled> {
        if self.cancel.is_cancelled() {
            Err(ExecutionCancelled)
        } else {
            Ok(())
        }
    }

    // ── Terminal streams ─────────────────────────────────────────────────────

    /// Append a stdout record.  Whitespace-only text emits nothing.
    pub async fn stdout(&self, text: &str) -> Option<String> {
        self.terminal(StreamName::Stdout, text).await
    }

    /// Append a stderr record.  Whitespace-only text emits nothing.
    pub async fn stderr(&self, text: &str) -> Option<String> {
        self.terminal(StreamName::Stderr, text).await
    }

    async fn terminal(&self, stream: StreamName, text: &str) -> Option<String> {
        if text.trim().is_empty() {
            return None;
        }
        let id = self
            .emit(
                OutputPayload::Terminal { stream, text: text.to_string() },
                None,
            )
            .await;
        Some(id)
    }

    /// Append text to an existing terminal output.  Does not advance the
    /// position counter: streaming workers use this to coalesce chunks into
    /// one record.
    pub async fn append_terminal(&self, output_id: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        self.commit(NotebookEvent::TerminalAppended {
            output_id: output_id.to_string(),
            text: text.to_string(),
        })
        .await;
    }

    // ── Rich outputs ─────────────────────────────────────────────────────────

    /// Emit a new `multimedia_display` output.  When `display_id` is given,
    /// later [`update_display`](Self::update_display) calls can replace this
    /// output in place.
    pub async fn display(
        &self,
        data: &RawMediaMap,
        metadata: Option<&Value>,
        display_id: Option<&str>,
    ) -> String {
        let representations = normalize_media(data, metadata);
        self.emit(
            OutputPayload::MultimediaDisplay {
                representations,
                display_id: display_id.map(str::to_string),
            },
            None,
        )
        .await
    }

    /// Replace the representations of a previously created display.  Never
    /// creates a new output and never advances the position counter; the
    /// store ignores updates for unknown display ids.
    pub async fn update_display(&self, display_id: &str, data: &RawMediaMap, metadata: Option<&Value>) {
        let representations = normalize_media(data, metadata);
        self.commit(NotebookEvent::DisplayUpdated {
            display_id: display_id.to_string(),
            representations,
        })
        .await;
    }

    /// Emit a `multimedia_result` output carrying this execution's counter.
    pub async fn result(&self, data: &RawMediaMap, metadata: Option<&Value>) -> String {
        let representations = normalize_media(data, metadata);
        self.emit(
            OutputPayload::MultimediaResult {
                representations,
                execution_count: self.execution_count,
            },
            None,
        )
        .await
    }

    /// Emit a structured error output.
    pub async fn error(&self, ename: &str, evalue: &str, traceback: &[String]) -> String {
        self.emit(
            OutputPayload::Error {
                ename: ename.to_string(),
                evalue: evalue.to_string(),
                traceback: traceback.to_vec(),
            },
            None,
        )
        .await
    }

    // ── Markdown streaming ───────────────────────────────────────────────────

    /// Emit a new appendable markdown output and return its id.
    pub async fn markdown(&self, content: &str, metadata: Option<Value>) -> String {
        self.emit(OutputPayload::Markdown { text: content.to_string() }, metadata)
            .await
    }

    /// Append text to a markdown output (token-by-token assistant
    /// streaming).  Does not advance the position counter.
    pub async fn append_markdown(&self, output_id: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        self.commit(NotebookEvent::MarkdownAppended {
            output_id: output_id.to_string(),
            text: text.to_string(),
        })
        .await;
    }

    // ── Clearing ─────────────────────────────────────────────────────────────

    /// Clear all current outputs for this cell.
    ///
    /// `wait = false` clears immediately and resets the position counter to
    /// 0.  `wait = true` defers: the old outputs are replaced atomically
    /// when the next output arrives, and the counter is *not* reset.
    pub async fn clear(&self, wait: bool) {
        if wait {
            self.state.lock().unwrap().pending_clear = true;
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            state.position = 0;
            state.pending_clear = false;
        }
        self.commit(NotebookEvent::CellOutputsCleared {
            cell_id: self.cell_id.clone(),
            wait: false,
            cleared_by: self.session_id.clone(),
        })
        .await;
    }

    // ── Internals ────────────────────────────────────────────────────────────

    async fn emit(&self, payload: OutputPayload, metadata: Option<Value>) -> String {
        let (flush_clear, position) = {
            let mut state = self.state.lock().unwrap();
            let flush = state.pending_clear;
            state.pending_clear = false;
            let pos = state.position;
            state.position += 1;
            (flush, pos)
        };
        if flush_clear {
            self.commit(NotebookEvent::CellOutputsCleared {
                cell_id: self.cell_id.clone(),
                wait: true,
                cleared_by: self.session_id.clone(),
            })
            .await;
        }

        let id = Uuid::new_v4().to_string();
        self.commit(NotebookEvent::OutputAdded {
            output: Output {
                id: id.clone(),
                cell_id: self.cell_id.clone(),
                position,
                payload,
                metadata,
            },
        })
        .await;
        id
    }

    async fn commit(&self, event: NotebookEvent) {
        if let Err(e) = self.store.commit(event).await {
            debug!(error = %e, "output commit dropped");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cello_store::{MemoryStore, Record, Selector};
    use serde_json::json;

    fn ctx(store: &MemoryStore) -> ExecutionContext {
        ExecutionContext::new(
            Arc::new(store.clone()),
            "c1",
            "q1",
            3,
            "sess-1",
            CancellationToken::new(),
        )
    }

    async fn outputs(store: &MemoryStore) -> Vec<Output> {
        store
            .query(Selector::OutputsForCell { cell_id: "c1".into() })
            .await
            .unwrap()
            .into_iter()
            .filter_map(|r| match r {
                Record::Output(o) => Some(o),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn positions_increase_strictly_from_zero() {
        let store = MemoryStore::new();
        let ctx = ctx(&store);

        ctx.stdout("a\n").await;
        ctx.display(&[("text/plain".to_string(), json!("x"))].into_iter().collect(), None, None)
            .await;
        ctx.error("E", "boom", &[]).await;

        let outs = outputs(&store).await;
        let positions: Vec<u64> = outs.iter().map(|o| o.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn whitespace_only_terminal_text_is_suppressed() {
        let store = MemoryStore::new();
        let ctx = ctx(&store);

        assert!(ctx.stdout("").await.is_none());
        assert!(ctx.stdout("   ").await.is_none());
        assert!(ctx.stdout("\n\n").await.is_none());
        assert!(ctx.stderr("\t").await.is_none());
        assert!(outputs(&store).await.is_empty());
    }

    #[tokio::test]
    async fn immediate_clear_resets_position_counter() {
        let store = MemoryStore::new();
        let ctx = ctx(&store);

        ctx.stdout("one\n").await;
        ctx.stdout("two\n").await;
        ctx.clear(false).await;
        ctx.stdout("three\n").await;

        let outs = outputs(&store).await;
        assert_eq!(outs.len(), 1, "clear removes prior outputs");
        assert_eq!(outs[0].position, 0, "counter resets after immediate clear");
    }

    #[tokio::test]
    async fn deferred_clear_applies_on_next_emission_without_reset() {
        let store = MemoryStore::new();
        let ctx = ctx(&store);

        ctx.stdout("one\n").await;
        ctx.stdout("two\n").await;
        ctx.clear(true).await;
        // Nothing cleared yet.
        assert_eq!(outputs(&store).await.len(), 2);

        ctx.stdout("three\n").await;
        let outs = outputs(&store).await;
        assert_eq!(outs.len(), 1, "old outputs replaced when the next output arrived");
        assert_eq!(outs[0].position, 2, "counter not reset by deferred clear");
    }

    #[tokio::test]
    async fn update_display_does_not_advance_position() {
        let store = MemoryStore::new();
        let ctx = ctx(&store);

        let data: RawMediaMap = [("text/plain".to_string(), json!("v1"))].into_iter().collect();
        ctx.display(&data, None, Some("d1")).await;

        let updated: RawMediaMap = [("text/plain".to_string(), json!("v2"))].into_iter().collect();
        ctx.update_display("d1", &updated, None).await;
        ctx.stdout("after\n").await;

        let outs = outputs(&store).await;
        assert_eq!(outs.len(), 2);
        assert_eq!(outs[1].position, 1, "update consumed no position");
        match &outs[0].payload {
            OutputPayload::MultimediaDisplay { representations, .. } => {
                assert_eq!(representations["text/plain"].data, json!("v2"));
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn result_carries_execution_count() {
        let store = MemoryStore::new();
        let ctx = ctx(&store);

        let data: RawMediaMap = [("text/plain".to_string(), json!(21))].into_iter().collect();
        ctx.result(&data, None).await;

        let outs = outputs(&store).await;
        match &outs[0].payload {
            OutputPayload::MultimediaResult { execution_count, representations } => {
                assert_eq!(*execution_count, 3);
                assert_eq!(representations["text/plain"].data, json!("21"));
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn markdown_append_coalesces_tokens() {
        let store = MemoryStore::new();
        let ctx = ctx(&store);

        let id = ctx.markdown("Hello", None).await;
        ctx.append_markdown(&id, ", world").await;
        ctx.append_markdown(&id, "!").await;

        let outs = outputs(&store).await;
        assert_eq!(outs.len(), 1);
        match &outs[0].payload {
            OutputPayload::Markdown { text } => assert_eq!(text, "Hello, world!"),
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn check_cancellation_raises_after_cancel() {
        let store = MemoryStore::new();
        let ctx = ctx(&store);
        assert!(ctx.check_cancellation().is_ok());
        ctx.cancel_token().cancel();
        assert!(ctx.check_cancellation().is_err());
    }
}
