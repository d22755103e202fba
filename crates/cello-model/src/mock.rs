// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::client::{ModelClient, ResponseStream};
use crate::types::{CompletionRequest, ResponseEvent};

/// A pre-scripted mock client.  Each call to `generate_stream` pops the next
/// response script from the front of the queue.  This lets tests specify
/// exact event sequences – including tool calls – without network access.
pub struct ScriptedMockClient {
    scripts: Arc<Mutex<Vec<Vec<ResponseEvent>>>>,
    /// Requests seen so far.  Written on each `generate_stream` call so
    /// tests can inspect what was sent per turn.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedMockClient {
    /// Build a client from a list of response scripts.  The outer `Vec` is
    /// the ordered list of turns; the inner `Vec` is the event sequence
    /// emitted for that turn.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: client that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![ResponseEvent::TextDelta(reply.into()), ResponseEvent::Done]])
    }

    /// Convenience: client that returns a tool call, then a text reply on
    /// the following turn.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            // Turn 1 – model emits a tool call
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                ResponseEvent::Done,
            ],
            // Turn 2 – model responds after the tool result
            vec![ResponseEvent::TextDelta(final_text.into()), ResponseEvent::Done],
        ])
    }

    /// Number of turns performed so far.
    pub fn turns(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedMockClient {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn generate_stream(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        self.requests.lock().unwrap().push(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                vec![ResponseEvent::TextDelta("[no more scripts]".into()), ResponseEvent::Done]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<ResponseEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

/// A client whose stream never produces an event.  Used to exercise
/// cancellation of an in-flight model turn.
#[derive(Default)]
pub struct HangingMockClient;

#[async_trait]
impl ModelClient for HangingMockClient {
    fn name(&self) -> &str {
        "hanging-mock"
    }

    fn model_name(&self) -> &str {
        "hanging-mock-model"
    }

    async fn generate_stream(&self, _req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        Ok(Box::pin(stream::pending()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
