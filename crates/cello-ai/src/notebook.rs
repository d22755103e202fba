// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation assembly from the notebook.
//!
//! Before the first model turn, the driver gathers every cell above the AI
//! cell (in position order, skipping cells hidden from AI context) together
//! with its ordered outputs.  Plain cells are folded into one structured
//! user message; prior AI cells are replayed as the assistant/tool turns
//! they originally were, so multi-cell sessions stay coherent.

use serde_json::{json, Value};
use tracing::debug;

use cello_core::media::MIME_JSON;
use cello_model::Message;
use cello_store::{Cell, CellType, Output, OutputPayload, Record, Selector, Store};

use crate::media::{bundle_text, strip_ansi};

/// Marker values used in the `application/json` trace displays the driver
/// emits around tool calls.  Reconstruction keys on them.
pub const TRACE_TOOL_CALL: &str = "tool_call";
pub const TRACE_TOOL_RESULT: &str = "tool_result";

pub const SYSTEM_PROMPT: &str = "\
You are an AI assistant embedded in a collaborative notebook.  You see the \
cells above your own, including their outputs, and you act on the notebook \
through tool calls.  Prefer creating or modifying cells over describing code \
in prose: when the user asks for code, create a code cell.  Reference cells \
by their cell IDs.  Keep written responses short and use markdown.";

/// Build the message list for an AI cell's first turn.
pub async fn assemble_messages(store: &dyn Store, current: &Cell) -> Vec<Message> {
    let mut messages = vec![Message::system(SYSTEM_PROMPT)];

    let cells = match store.query(Selector::AllCells).await {
        Ok(records) => records,
        Err(e) => {
            debug!(error = %e, "cell query dropped, assembling without context");
            Vec::new()
        }
    };

    // Accumulates consecutive non-AI cells into one structured dump, flushed
    // whenever an AI cell interleaves its own conversation turns.
    let mut dump = String::new();

    for cell in cells.iter().filter_map(Record::as_cell) {
        if cell.position >= current.position || !cell.ai_context_visible {
            continue;
        }
        let outputs = load_outputs(store, &cell.id).await;
        if cell.cell_type == CellType::Ai {
            flush_dump(&mut dump, &mut messages);
            replay_ai_cell(cell, &outputs, &mut messages);
        } else {
            render_cell(cell, &outputs, &mut dump);
        }
    }
    flush_dump(&mut dump, &mut messages);

    messages.push(Message::user(current.source.clone()));
    messages
}

async fn load_outputs(store: &dyn Store, cell_id: &str) -> Vec<Output> {
    match store.query(Selector::OutputsForCell { cell_id: cell_id.to_string() }).await {
        Ok(records) => records
            .into_iter()
            .filter_map(|r| match r {
                Record::Output(o) => Some(o),
                _ => None,
            })
            .collect(),
        Err(e) => {
            debug!(error = %e, cell_id, "output query dropped");
            Vec::new()
        }
    }
}

fn flush_dump(dump: &mut String, messages: &mut Vec<Message>) {
    if dump.trim().is_empty() {
        dump.clear();
        return;
    }
    messages.push(Message::user(format!("Notebook context:\n\n{}", dump.trim_end())));
    dump.clear();
}

/// Render one non-AI cell (source + outputs) into the context dump.
fn render_cell(cell: &Cell, outputs: &[Output], dump: &mut String) {
    dump.push_str(&format!("## Cell {} ({})\n{}\n", cell.id, cell.cell_type, cell.source));
    if outputs.is_empty() {
        dump.push('\n');
        return;
    }
    dump.push_str("Outputs:\n");
    for output in outputs {
        match &output.payload {
            OutputPayload::Terminal { stream, text } => {
                let name = match stream {
                    cello_store::StreamName::Stdout => "stdout",
                    cello_store::StreamName::Stderr => "stderr",
                };
                dump.push_str(&format!("[{name}] {}\n", strip_ansi(text)));
            }
            OutputPayload::Markdown { text } => {
                dump.push_str(text);
                dump.push('\n');
            }
            OutputPayload::Error { ename, evalue, .. } => {
                dump.push_str(&format!("[error] {ename}: {evalue}\n"));
            }
            OutputPayload::MultimediaDisplay { representations, .. }
            | OutputPayload::MultimediaResult { representations, .. } => {
                if let Some(text) = bundle_text(representations) {
                    dump.push_str(&text);
                    dump.push('\n');
                }
            }
        }
    }
    dump.push('\n');
}

/// Replay a prior AI cell's conversation: its prompt as a user turn, its
/// markdown as assistant turns, and its tool-call trace displays as the
/// assistant/tool message pairs they record.
fn replay_ai_cell(cell: &Cell, outputs: &[Output], messages: &mut Vec<Message>) {
    messages.push(Message::user(cell.source.clone()));
    for output in outputs {
        match &output.payload {
            OutputPayload::Markdown { text } => {
                messages.push(Message::assistant(text.clone()));
            }
            OutputPayload::MultimediaDisplay { representations, .. } => {
                let Some(trace) = representations.get(MIME_JSON).map(|r| &r.data) else {
                    continue;
                };
                match trace.get("type").and_then(Value::as_str) {
                    Some(TRACE_TOOL_CALL) => {
                        let id = trace_str(trace, "tool_call_id");
                        let name = trace_str(trace, "tool_name");
                        let args = trace.get("arguments").cloned().unwrap_or(json!({}));
                        messages.push(Message::tool_call(id, name, args.to_string()));
                    }
                    Some(TRACE_TOOL_RESULT) => {
                        let id = trace_str(trace, "tool_call_id");
                        let result = trace_str(trace, "result");
                        messages.push(Message::tool_result(id, result));
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

fn trace_str(trace: &Value, key: &str) -> String {
    trace.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
