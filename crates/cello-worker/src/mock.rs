// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Deterministic scripted worker transport.
//!
//! Plays the role of the interpreter process in tests and hermetic embeds:
//! each execute request pops the next scripted reply.  The transport honours
//! the interrupt file exactly like a real worker, so cancellation paths are
//! exercised end to end without an interpreter.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::interrupt::INTERRUPT_SIGINT;
use crate::protocol::{
    ControlBody, ControlRequest, ControlResponse, Incoming, StreamMessage, WorkerOutput,
};
use crate::transport::{TransportEvent, WorkerTransport};

/// One scripted answer to an execute request.
pub enum ScriptedReply {
    /// Stream the given outputs, then answer with an optional final result.
    Outputs { stream: Vec<WorkerOutput>, result: Option<Value> },
    /// Answer with a control-channel error body.
    Failure { error: String },
    /// Behave like a blocked interpreter: answer `KeyboardInterrupt` once
    /// the interrupt byte is set.
    HangUntilInterrupt,
    /// Emit a crash event instead of answering.
    Crash { reason: String },
}

#[derive(Default)]
struct Shared {
    replies: VecDeque<ScriptedReply>,
    tx: Option<mpsc::UnboundedSender<TransportEvent>>,
    interrupt_path: Option<PathBuf>,
}

/// Scripted in-process [`WorkerTransport`].  Clones share the same script
/// queue, so a transport factory can hand the bridge fresh "processes" that
/// consume one common script.
#[derive(Clone, Default)]
pub struct ScriptedWorkerTransport {
    shared: Arc<Mutex<Shared>>,
    starts: Arc<AtomicUsize>,
}

impl ScriptedWorkerTransport {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                replies: replies.into(),
                ..Default::default()
            })),
            starts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue another reply after construction.
    pub fn push_reply(&self, reply: ScriptedReply) {
        self.shared.lock().unwrap().replies.push_back(reply);
    }

    /// How many times a worker "process" was started.  Each start expects a
    /// fresh init handshake, so this counts initializations.
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = &self.shared.lock().unwrap().tx {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl WorkerTransport for ScriptedWorkerTransport {
    async fn start(&self) -> anyhow::Result<mpsc::UnboundedReceiver<TransportEvent>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().unwrap().tx = Some(tx);
        Ok(rx)
    }

    async fn send(&self, req: &ControlRequest) -> anyhow::Result<()> {
        match &req.body {
            ControlBody::Init { interrupt_path, .. } => {
                self.shared.lock().unwrap().interrupt_path = Some(interrupt_path.clone());
                self.emit(TransportEvent::Message(Incoming::Response(ControlResponse::ok(
                    req.id,
                ))));
            }
            ControlBody::Execute { .. } => {
                let reply = self.shared.lock().unwrap().replies.pop_front();
                match reply {
                    None => {
                        self.emit(TransportEvent::Message(Incoming::Response(
                            ControlResponse::ok(req.id),
                        )));
                    }
                    Some(ScriptedReply::Outputs { stream, result }) => {
                        for output in stream {
                            self.emit(TransportEvent::Message(Incoming::Stream(
                                StreamMessage::StreamOutput(output),
                            )));
                        }
                        let resp = match result {
                            Some(value) => ControlResponse::ok_with_result(req.id, value),
                            None => ControlResponse::ok(req.id),
                        };
                        self.emit(TransportEvent::Message(Incoming::Response(resp)));
                    }
                    Some(ScriptedReply::Failure { error }) => {
                        self.emit(TransportEvent::Message(Incoming::Response(
                            ControlResponse::err(req.id, error),
                        )));
                    }
                    Some(ScriptedReply::HangUntilInterrupt) => {
                        let path = self.shared.lock().unwrap().interrupt_path.clone();
                        let this = self.clone();
                        let id = req.id;
                        tokio::spawn(async move {
                            // Poll the shared byte like an interpreter's
                            // safe-point check would.
                            loop {
                                if let Some(path) = &path {
                                    let byte = std::fs::read(path)
                                        .ok()
                                        .and_then(|b| b.first().copied())
                                        .unwrap_or(0);
                                    if byte == INTERRUPT_SIGINT {
                                        this.emit(TransportEvent::Message(Incoming::Response(
                                            ControlResponse::err(id, "KeyboardInterrupt"),
                                        )));
                                        return;
                                    }
                                }
                                tokio::time::sleep(Duration::from_millis(5)).await;
                            }
                        });
                    }
                    Some(ScriptedReply::Crash { reason }) => {
                        self.emit(TransportEvent::Crashed(reason));
                    }
                }
            }
        }
        Ok(())
    }

    async fn terminate(&self) {
        self.shared.lock().unwrap().tx = None;
    }
}
