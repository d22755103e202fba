// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The AI cell driver: a multi-turn model ↔ tool loop.
//!
//! Each turn streams the assistant's markdown token-by-token into one
//! appendable output, collects tool-call fragments, dispatches the calls
//! against the notebook, and feeds the results back as conversation turns.
//! The loop ends when the model stops calling tools or the turn cap hits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use cello_core::{ExecutionContext, ExecutionHandler, ExecutionOutcome};
use cello_model::{
    CompletionRequest, Message, ModelClient, ResponseEvent, ToolChoice,
};
use cello_store::{Cell, RawMediaMap, Store};

use crate::notebook::{assemble_messages, TRACE_TOOL_CALL, TRACE_TOOL_RESULT};
use crate::tools::NotebookTools;

const CANCELLED_STDERR: &str = "Execution was cancelled\n";

const DEFAULT_MAX_ITERATIONS: usize = 10;

const SETUP_INSTRUCTIONS: &str = "\
**AI cells are not configured.**\n\n\
Set `CELLO_AI_API_KEY` (and optionally `CELLO_AI_BASE_URL` / \
`CELLO_AI_MODEL` for OpenAI-compatible endpoints) in the runtime's \
environment, then restart the agent.";

pub struct AiDriver {
    store: Arc<dyn Store>,
    model: Option<Arc<dyn ModelClient>>,
    tools: NotebookTools,
    max_iterations: usize,
}

impl AiDriver {
    /// `model = None` is the supported "provider not configured" state: AI
    /// cells then complete with setup instructions instead of failing.
    pub fn new(
        store: Arc<dyn Store>,
        session_id: impl Into<String>,
        model: Option<Arc<dyn ModelClient>>,
    ) -> Self {
        let session_id = session_id.into();
        Self {
            tools: NotebookTools::new(Arc::clone(&store), session_id),
            store,
            model,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub async fn run(
        &self,
        ctx: Arc<ExecutionContext>,
        cell: Cell,
    ) -> anyhow::Result<ExecutionOutcome> {
        if cell.source.trim().is_empty() {
            return Ok(ExecutionOutcome::success());
        }

        let Some(model) = &self.model else {
            ctx.markdown(SETUP_INSTRUCTIONS, None).await;
            return Ok(ExecutionOutcome::success());
        };

        let mut messages = assemble_messages(self.store.as_ref(), &cell).await;
        let token = ctx.cancel_token();

        for _turn in 0..self.max_iterations {
            if token.is_cancelled() {
                ctx.stderr(CANCELLED_STDERR).await;
                return Ok(ExecutionOutcome::cancelled());
            }

            let req = CompletionRequest {
                messages: messages.clone(),
                tools: NotebookTools::schemas(),
                tool_choice: ToolChoice::Auto,
            };
            let stream = model.generate_stream(req).await?;
            let turn = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                turn = self.stream_one_turn(stream, &ctx) => Some(turn?),
            };
            // A cancelled select drops the stream, which tears down the
            // in-flight HTTP response.
            let Some((text, tool_calls)) = turn else {
                ctx.stderr(CANCELLED_STDERR).await;
                return Ok(ExecutionOutcome::cancelled());
            };

            if !text.is_empty() {
                messages.push(Message::assistant(&text));
            }

            if tool_calls.is_empty() {
                return Ok(ExecutionOutcome::success());
            }

            for call in tool_calls {
                if token.is_cancelled() {
                    ctx.stderr(CANCELLED_STDERR).await;
                    return Ok(ExecutionOutcome::cancelled());
                }
                self.run_tool_call(&ctx, &cell, call, &mut messages).await;
            }
        }

        let data: RawMediaMap = [(
            "text/markdown".to_string(),
            json!(format!("Maximum iterations ({}) reached.", self.max_iterations)),
        )]
        .into_iter()
        .collect();
        ctx.display(&data, None, None).await;
        Ok(ExecutionOutcome::success())
    }

    /// Drive one streamed model turn.  Returns the accumulated text and the
    /// reassembled tool calls.
    async fn stream_one_turn(
        &self,
        mut stream: cello_model::ResponseStream,
        ctx: &Arc<ExecutionContext>,
    ) -> anyhow::Result<(String, Vec<AssembledToolCall>)> {
        let mut text = String::new();
        let mut markdown_id: Option<String> = None;
        // Keyed by the provider's parallel-tool-call index; fragments for
        // one call accumulate under its index.
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();

        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    text.push_str(&delta);
                    match &markdown_id {
                        None => markdown_id = Some(ctx.markdown(&delta, None).await),
                        Some(id) => ctx.append_markdown(id, &delta).await,
                    }
                }
                ResponseEvent::TextDelta(_) => {}
                ResponseEvent::ToolCall { index, id, name, arguments } => {
                    let slot = pending.entry(index).or_default();
                    if !id.is_empty() {
                        slot.id = id;
                    }
                    if !name.is_empty() {
                        slot.name = name;
                    }
                    slot.args_buf.push_str(&arguments);
                }
                ResponseEvent::Done => break,
                ResponseEvent::Error(e) => warn!("model stream error: {e}"),
            }
        }

        // Flush accumulated calls ordered by index.  Nameless calls cannot
        // be dispatched and are dropped; an absent id gets a synthetic one
        // so the result can still be threaded back.
        let mut calls: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        calls.sort_by_key(|(index, _)| *index);
        let mut assembled = Vec::new();
        for (i, (_, call)) in calls.into_iter().enumerate() {
            if call.name.is_empty() {
                warn!(tool_call_id = %call.id, "dropping tool call with empty name");
                continue;
            }
            let id = if call.id.is_empty() { format!("call-synthetic-{i}") } else { call.id };
            assembled.push(AssembledToolCall { id, name: call.name, args_buf: call.args_buf });
        }
        Ok((text, assembled))
    }

    /// Parse, trace, dispatch and record one tool call.
    async fn run_tool_call(
        &self,
        ctx: &Arc<ExecutionContext>,
        cell: &Cell,
        call: AssembledToolCall,
        messages: &mut Vec<Message>,
    ) {
        let args: Value = if call.args_buf.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(&call.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    // Malformed arguments from the model: explain and move
                    // on with the loop rather than failing the cell.
                    warn!(tool = %call.name, error = %e, "tool arguments failed to parse");
                    let data: RawMediaMap = [(
                        "application/json".to_string(),
                        json!({
                            "type": "tool_error",
                            "tool_name": call.name,
                            "message": format!("arguments were not valid JSON: {e}"),
                        }),
                    )]
                    .into_iter()
                    .collect();
                    ctx.display(&data, None, None).await;
                    return;
                }
            }
        };

        // Compact invocation trace for the UI (and for conversation
        // reconstruction by later AI cells).
        let invocation: RawMediaMap = [(
            "application/json".to_string(),
            json!({
                "type": TRACE_TOOL_CALL,
                "tool_call_id": call.id,
                "tool_name": call.name,
                "arguments": args,
            }),
        )]
        .into_iter()
        .collect();
        ctx.display(&invocation, None, None).await;

        let result = match self.tools.dispatch(cell, &call.name, &args).await {
            Ok(status) => status,
            Err(e) => {
                debug!(tool = %call.name, error = %e, "tool execution failed");
                format!("Error: {e}")
            }
        };

        let trace: RawMediaMap = [(
            "application/json".to_string(),
            json!({
                "type": TRACE_TOOL_RESULT,
                "tool_call_id": call.id,
                "result": result,
            }),
        )]
        .into_iter()
        .collect();
        ctx.display(&trace, None, None).await;

        messages.push(Message::tool_call(&call.id, &call.name, args.to_string()));
        messages.push(Message::tool_result(&call.id, &result));
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

struct AssembledToolCall {
    id: String,
    name: String,
    args_buf: String,
}

/// Execution handler for ai cells.
pub struct AiCellHandler {
    driver: AiDriver,
}

impl AiCellHandler {
    pub fn new(driver: AiDriver) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl ExecutionHandler for AiCellHandler {
    async fn execute(
        &self,
        ctx: Arc<ExecutionContext>,
        cell: Cell,
    ) -> anyhow::Result<ExecutionOutcome> {
        self.driver.run(ctx, cell).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
