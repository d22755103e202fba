// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire protocol between the agent and the sandboxed interpreter worker.
//!
//! Newline-delimited JSON over the worker's stdio.  Control messages carry
//! an `id` and are answered exactly once; stream messages are unsolicited
//! and omit the `id`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A control request sent to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub id: u64,
    #[serde(flatten)]
    pub body: ControlBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ControlBody {
    /// Must be the first request.  The worker maps the interrupt file and
    /// pre-loads the listed packages before answering.
    Init {
        interrupt_path: PathBuf,
        packages: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        package_cache_dir: Option<PathBuf>,
    },
    /// Run one block of code.  Stream messages flow while this request is
    /// outstanding; the response ends the execution.
    Execute { code: String },
}

/// The worker's answer to one control request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub id: u64,
    /// Present on failure; the body is formatted by the interpreter and
    /// parsed by [`crate::traceback`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Final value of the executed code as a MIME → value map, when the
    /// code produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ControlResponse {
    pub fn ok(id: u64) -> Self {
        Self { id, error: None, result: None }
    }

    pub fn ok_with_result(id: u64, result: Value) -> Self {
        Self { id, error: None, result: Some(result) }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self { id, error: Some(error.into()), result: None }
    }
}

/// An unsolicited message from the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Worker-side diagnostics, forwarded to the agent log.
    Log { level: String, message: String },
    /// One output produced by the running code.
    StreamOutput(WorkerOutput),
}

/// Output variants a worker may stream during an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(rename_all_fields = "camelCase")]
pub enum WorkerOutput {
    Stdout {
        text: String,
    },
    Stderr {
        text: String,
    },
    DisplayData {
        data: BTreeMap<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transient: Option<Transient>,
    },
    UpdateDisplayData {
        data: BTreeMap<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transient: Option<Transient>,
    },
    ExecuteResult {
        data: BTreeMap<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
    ClearOutput {
        #[serde(default)]
        wait: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_id: Option<String>,
}

/// Any line read from the worker: a control response when it carries an
/// `id`, otherwise a stream message.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Incoming {
    Response(ControlResponse),
    Stream(StreamMessage),
}

/// Encode one message as a wire line (no trailing newline).
pub fn encode_line<T: Serialize>(msg: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Decode one wire line.
pub fn decode_line(line: &str) -> anyhow::Result<Incoming> {
    Ok(serde_json::from_str(line)?)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
