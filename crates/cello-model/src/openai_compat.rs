// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-compatible streaming chat-completion client.
//!
//! Speaks the `/chat/completions` wire format with `stream: true` and parses
//! the SSE response incrementally.  Works against any endpoint that accepts
//! the OpenAI schema (hosted or local).

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::client::{ModelClient, ResponseStream};
use crate::types::{CompletionRequest, Message, MessageContent, ResponseEvent, Role, ToolChoice};

/// Environment variables consulted by [`OpenAiCompatClient::from_env`].
const ENV_API_KEY: &str = "CELLO_AI_API_KEY";
const ENV_BASE_URL: &str = "CELLO_AI_BASE_URL";
const ENV_MODEL: &str = "CELLO_AI_MODEL";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiCompatClient {
    client: reqwest::Client,
    chat_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        let base = base_url.into();
        Self {
            client: reqwest::Client::new(),
            chat_url: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key,
            model: model.into(),
        }
    }

    /// Build a client from the environment.  Returns `None` when no API key
    /// is configured, which is the unconfigured state the AI driver
    /// reports to the user instead of failing.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var(ENV_API_KEY).ok().filter(|k| !k.is_empty())?;
        let base_url =
            std::env::var(ENV_BASE_URL).ok().unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = std::env::var(ENV_MODEL).ok().unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Some(Self::new(base_url, Some(api_key), model))
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        "openai-compat"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate_stream(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let mut body = json!({
            "model": self.model,
            "messages": to_wire_messages(&req.messages),
            "stream": true,
        });
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(
                req.tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
            body["tool_choice"] = match req.tool_choice {
                ToolChoice::Auto => json!("auto"),
                ToolChoice::None => json!("none"),
            };
        }

        debug!(
            model = %self.model,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            http_req = http_req.bearer_auth(key);
        }
        let resp = http_req.send().await.context("completion request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("model backend error {status}: {text}");
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across multiple TCP packets.  Maintain a
        // line buffer across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Serialize the conversation into the OpenAI wire shape.
fn to_wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Text(text) => json!({
                "role": role_str(&m.role),
                "content": text,
            }),
            MessageContent::ToolCall { tool_call_id, function } => json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": [{
                    "id": tool_call_id,
                    "type": "function",
                    "function": {
                        "name": function.name,
                        "arguments": function.arguments,
                    }
                }],
            }),
            MessageContent::ToolResult { tool_call_id, content } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content,
            }),
        })
        .collect()
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by
/// the next TCP chunk.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<ResponseEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    parse_sse_chunk(&v)
}

/// Extract the delta carried by one parsed SSE chunk.
///
/// A chunk may carry a content delta, one or more tool-call fragments, or
/// nothing of interest (role announcements, finish markers).  Tool-call
/// fragments keep their provider `index` so parallel calls interleaved by
/// index can be reassembled by the consumer.
fn parse_sse_chunk(v: &Value) -> Option<anyhow::Result<ResponseEvent>> {
    let delta = v.get("choices")?.get(0)?.get("delta")?;

    if let Some(fragments) = delta.get("tool_calls").and_then(Value::as_array) {
        // One event per fragment; almost always exactly one.
        let frag = fragments.first()?;
        let index = frag.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
        let id = frag.get("id").and_then(Value::as_str).unwrap_or("").to_string();
        let function = frag.get("function");
        let name = function
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let arguments = function
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        return Some(Ok(ResponseEvent::ToolCall { index, id, name, arguments }));
    }

    let content = delta.get("content").and_then(Value::as_str)?;
    if content.is_empty() {
        return None;
    }
    Some(Ok(ResponseEvent::TextDelta(content.to_string())))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
