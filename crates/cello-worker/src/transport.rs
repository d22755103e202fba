// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Worker transports.
//!
//! The bridge is written against [`WorkerTransport`] so the concrete
//! interpreter embedding stays pluggable; [`ProcessTransport`] speaks
//! newline-delimited JSON to a spawned worker process.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::protocol::{decode_line, encode_line, ControlRequest, Incoming};

/// One delivery from the worker side.
#[derive(Debug)]
pub enum TransportEvent {
    Message(Incoming),
    /// The worker is gone or unintelligible.  The bridge treats every
    /// variant of this the same way: drain, terminate, re-init on next use.
    Crashed(String),
}

#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Launch the worker and return its incoming message stream.
    async fn start(&self) -> anyhow::Result<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Send one control request.
    async fn send(&self, req: &ControlRequest) -> anyhow::Result<()>;

    /// Kill the worker.  Idempotent.
    async fn terminate(&self);
}

struct ProcessState {
    child: Child,
    stdin: ChildStdin,
}

/// Transport over a spawned interpreter process (stdio pipes).
pub struct ProcessTransport {
    program: String,
    args: Vec<String>,
    state: Mutex<Option<ProcessState>>,
}

impl ProcessTransport {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Arc<Self> {
        Arc::new(Self { program: program.into(), args, state: Mutex::new(None) })
    }
}

#[async_trait]
impl WorkerTransport for ProcessTransport {
    async fn start(&self) -> anyhow::Result<mpsc::UnboundedReceiver<TransportEvent>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Worker stderr passes through for debugging.
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn worker '{}': {e}", self.program))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("worker stdout unavailable"))?;

        *self.state.lock().await = Some(ProcessState { child, stdin });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match decode_line(&line) {
                            Ok(msg) => {
                                if tx.send(TransportEvent::Message(msg)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                // An unintelligible message is a crash, not
                                // something to paper over.
                                let _ = tx.send(TransportEvent::Crashed(format!(
                                    "undecodable worker message: {e}"
                                )));
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(TransportEvent::Crashed("worker exited".to_string()));
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(TransportEvent::Crashed(format!("worker read error: {e}")));
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn send(&self, req: &ControlRequest) -> anyhow::Result<()> {
        let line = encode_line(req)?;
        let mut state = self.state.lock().await;
        let state = state.as_mut().ok_or_else(|| anyhow::anyhow!("worker not started"))?;
        state.stdin.write_all(line.as_bytes()).await?;
        state.stdin.write_all(b"\n").await?;
        state.stdin.flush().await?;
        Ok(())
    }

    async fn terminate(&self) {
        if let Some(mut state) = self.state.lock().await.take() {
            if let Err(e) = state.child.kill().await {
                debug!(error = %e, "worker kill failed");
            }
        }
    }
}
