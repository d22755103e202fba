// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The code-worker bridge.
//!
//! Owns exclusive access to one sandboxed interpreter.  Executions enter a
//! FIFO queue and a single pump task drains them one at a time, so stream
//! output never interleaves and the context's position ordering holds.  Any
//! control-channel failure is a crash: everything pending and queued is
//! rejected, the worker is terminated, and the next execute re-initializes.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use cello_core::{ExecutionContext, ExecutionHandler, ExecutionOutcome};
use cello_store::Cell;

use crate::interrupt::InterruptRegion;
use crate::protocol::{ControlBody, ControlRequest, ControlResponse, Incoming, StreamMessage, WorkerOutput};
use crate::traceback::{classify_worker_error, WorkerFailure};
use crate::transport::{TransportEvent, WorkerTransport};
use crate::value::{media_map_from_value, plain_media_map};

pub const CANCELLED_STDERR: &str = "Execution was cancelled\n";

#[derive(Debug, Clone, Error)]
#[error("Worker crashed: {0}")]
pub struct WorkerCrashed(pub String);

/// Produces a fresh transport for each worker (re)start.
pub type TransportFactory = Box<dyn Fn() -> Arc<dyn WorkerTransport> + Send + Sync>;

/// Packages and cache location forwarded in the init request.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub packages: Vec<String>,
    pub package_cache_dir: Option<PathBuf>,
}

struct ExecuteCommand {
    ctx: Arc<ExecutionContext>,
    code: String,
    resolve: oneshot::Sender<anyhow::Result<ExecutionOutcome>>,
}

pub struct WorkerBridge {
    cmd_tx: mpsc::UnboundedSender<ExecuteCommand>,
}

impl WorkerBridge {
    pub fn new(factory: TransportFactory, config: WorkerConfig) -> anyhow::Result<Self> {
        let interrupt = Arc::new(InterruptRegion::new()?);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let pump = Pump {
            factory,
            config,
            interrupt,
            transport: None,
            incoming: None,
            next_id: 0,
        };
        tokio::spawn(pump.run(cmd_rx));
        Ok(Self { cmd_tx })
    }

    /// Queue one execution and await its outcome.  Serialized with every
    /// other execution on this bridge.
    pub async fn execute(
        &self,
        ctx: Arc<ExecutionContext>,
        code: impl Into<String>,
    ) -> anyhow::Result<ExecutionOutcome> {
        let (resolve, rx) = oneshot::channel();
        self.cmd_tx
            .send(ExecuteCommand { ctx, code: code.into(), resolve })
            .map_err(|_| WorkerCrashed("bridge task gone".into()))?;
        rx.await.map_err(|_| WorkerCrashed("bridge task gone".into()))?
    }
}

struct Pump {
    factory: TransportFactory,
    config: WorkerConfig,
    interrupt: Arc<InterruptRegion>,
    transport: Option<Arc<dyn WorkerTransport>>,
    incoming: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    next_id: u64,
}

impl Pump {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ExecuteCommand>) {
        while let Some(cmd) = rx.recv().await {
            let result = self.run_one(&cmd.ctx, &cmd.code).await;
            let crash = result
                .as_ref()
                .err()
                .and_then(|e| e.downcast_ref::<WorkerCrashed>())
                .cloned();
            let _ = cmd.resolve.send(result);

            // A crash rejects everything queued behind the failed execution.
            if let Some(crash) = crash {
                while let Ok(queued) = rx.try_recv() {
                    let _ = queued.resolve.send(Err(crash.clone().into()));
                }
            }
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Tear down the worker and report the crash.  The next execution will
    /// re-initialize from the factory.
    async fn crash(&mut self, reason: impl Into<String>) -> WorkerCrashed {
        let reason = reason.into();
        warn!(reason = %reason, "worker crashed");
        if let Some(transport) = self.transport.take() {
            transport.terminate().await;
        }
        self.incoming = None;
        WorkerCrashed(reason)
    }

    async fn ensure_initialized(&mut self) -> Result<(), WorkerCrashed> {
        if self.transport.is_some() {
            return Ok(());
        }

        let transport = (self.factory)();
        let mut incoming = match transport.start().await {
            Ok(incoming) => incoming,
            Err(e) => return Err(WorkerCrashed(format!("spawn failed: {e}"))),
        };

        let id = self.next_id();
        let init = ControlRequest {
            id,
            body: ControlBody::Init {
                interrupt_path: self.interrupt.path().to_path_buf(),
                packages: self.config.packages.clone(),
                package_cache_dir: self.config.package_cache_dir.clone(),
            },
        };
        if let Err(e) = transport.send(&init).await {
            transport.terminate().await;
            return Err(WorkerCrashed(format!("init send failed: {e}")));
        }

        // Drain until the init response; pre-init stream messages are
        // worker boot noise.
        loop {
            match incoming.recv().await {
                None => {
                    transport.terminate().await;
                    return Err(WorkerCrashed("worker channel closed during init".into()));
                }
                Some(TransportEvent::Crashed(reason)) => {
                    transport.terminate().await;
                    return Err(WorkerCrashed(reason));
                }
                Some(TransportEvent::Message(Incoming::Response(resp))) if resp.id == id => {
                    if let Some(error) = resp.error {
                        transport.terminate().await;
                        return Err(WorkerCrashed(format!("init failed: {error}")));
                    }
                    break;
                }
                Some(TransportEvent::Message(Incoming::Stream(StreamMessage::Log {
                    level,
                    message,
                }))) => {
                    debug!(worker_level = %level, "{message}");
                }
                Some(other) => {
                    debug!(?other, "dropping pre-init worker message");
                }
            }
        }

        debug!("worker initialized");
        self.transport = Some(transport);
        self.incoming = Some(incoming);
        Ok(())
    }

    async fn run_one(
        &mut self,
        ctx: &Arc<ExecutionContext>,
        code: &str,
    ) -> anyhow::Result<ExecutionOutcome> {
        if ctx.is_cancelled() {
            ctx.stderr(CANCELLED_STDERR).await;
            return Ok(ExecutionOutcome::cancelled());
        }

        self.ensure_initialized().await?;

        // While the request is outstanding, an abort flips the shared
        // interrupt byte; the worker observes it at its next safe point.
        let token = ctx.cancel_token();
        let abort_listener = tokio::spawn({
            let token = token.clone();
            let region = Arc::clone(&self.interrupt);
            async move {
                token.cancelled().await;
                region.set();
            }
        });

        let id = self.next_id();
        let request = ControlRequest { id, body: ControlBody::Execute { code: code.to_string() } };
        let send_result = self.transport.as_ref().expect("initialized above").send(&request).await;

        let response = if let Err(e) = send_result {
            Err(self.crash(format!("send failed: {e}")).await)
        } else {
            self.pump_until_response(id, ctx).await
        };

        abort_listener.abort();
        let _ = abort_listener.await;
        self.interrupt.clear();

        let resp = response?;
        if let Some(error) = resp.error {
            return Ok(match classify_worker_error(&error, token.is_cancelled()) {
                WorkerFailure::Cancelled => {
                    ctx.stderr(CANCELLED_STDERR).await;
                    ExecutionOutcome::cancelled()
                }
                WorkerFailure::Error { ename, evalue, traceback } => {
                    ctx.error(&ename, &evalue, &traceback).await;
                    ExecutionOutcome::failure(format!("{ename}: {evalue}"))
                }
            });
        }

        if let Some(result) = &resp.result {
            if !result.is_null() {
                ctx.result(&media_map_from_value(result), None).await;
            }
        }
        Ok(ExecutionOutcome::success())
    }

    /// Route stream traffic into the context until the matching control
    /// response arrives.
    async fn pump_until_response(
        &mut self,
        id: u64,
        ctx: &Arc<ExecutionContext>,
    ) -> Result<ControlResponse, WorkerCrashed> {
        loop {
            let event = self.incoming.as_mut().expect("initialized above").recv().await;
            match event {
                None => return Err(self.crash("worker channel closed").await),
                Some(TransportEvent::Crashed(reason)) => return Err(self.crash(reason).await),
                Some(TransportEvent::Message(Incoming::Response(resp))) if resp.id == id => {
                    return Ok(resp);
                }
                Some(TransportEvent::Message(Incoming::Response(resp))) => {
                    debug!(stale_id = resp.id, "dropping stale control response");
                }
                Some(TransportEvent::Message(Incoming::Stream(msg))) => {
                    self.route_stream(msg, ctx).await;
                }
            }
        }
    }

    async fn route_stream(&self, msg: StreamMessage, ctx: &Arc<ExecutionContext>) {
        match msg {
            StreamMessage::Log { level, message } => {
                debug!(worker_level = %level, "{message}");
            }
            StreamMessage::StreamOutput(output) => match output {
                WorkerOutput::Stdout { text } => {
                    ctx.stdout(&text).await;
                }
                WorkerOutput::Stderr { text } => {
                    ctx.stderr(&text).await;
                }
                WorkerOutput::DisplayData { data, metadata, transient } => {
                    let display_id = transient.and_then(|t| t.display_id);
                    ctx.display(&plain_media_map(&data), metadata.as_ref(), display_id.as_deref())
                        .await;
                }
                WorkerOutput::UpdateDisplayData { data, metadata, transient } => {
                    match transient.and_then(|t| t.display_id) {
                        Some(display_id) => {
                            ctx.update_display(&display_id, &plain_media_map(&data), metadata.as_ref())
                                .await;
                        }
                        None => warn!("update_display_data without display_id dropped"),
                    }
                }
                WorkerOutput::ExecuteResult { data, metadata } => {
                    ctx.result(&plain_media_map(&data), metadata.as_ref()).await;
                }
                WorkerOutput::Error { ename, evalue, traceback } => {
                    ctx.error(&ename, &evalue, &traceback).await;
                }
                WorkerOutput::ClearOutput { wait } => {
                    ctx.clear(wait).await;
                }
            },
        }
    }
}

/// Execution handler for code cells: hand the source to the worker bridge.
pub struct CodeCellHandler {
    bridge: Arc<WorkerBridge>,
}

impl CodeCellHandler {
    pub fn new(bridge: Arc<WorkerBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl ExecutionHandler for CodeCellHandler {
    async fn execute(
        &self,
        ctx: Arc<ExecutionContext>,
        cell: Cell,
    ) -> anyhow::Result<ExecutionOutcome> {
        self.bridge.execute(ctx, cell.source).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use cello_store::{MemoryStore, Output, OutputPayload, Record, Selector, Store, StreamName};

    use crate::mock::{ScriptedReply, ScriptedWorkerTransport};

    use super::*;

    fn context(store: &MemoryStore, token: CancellationToken) -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(
            Arc::new(store.clone()),
            "c1",
            "q1",
            1,
            "sess",
            token,
        ))
    }

    fn bridge_over(transport: ScriptedWorkerTransport) -> WorkerBridge {
        let factory: TransportFactory = Box::new(move || Arc::new(transport.clone()));
        WorkerBridge::new(factory, WorkerConfig::default()).unwrap()
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
    async fn final_result_is_emitted_through_the_context() {
        let transport = ScriptedWorkerTransport::new(vec![ScriptedReply::Outputs {
            stream: vec![],
            result: Some(json!({"text/plain": "21"})),
        }]);
        let bridge = bridge_over(transport);
        let store = MemoryStore::new();
        let ctx = context(&store, CancellationToken::new());

        let outcome = bridge.execute(ctx, "3 * 7").await.unwrap();
        assert!(outcome.success);

        let outs = outputs(&store).await;
        assert_eq!(outs.len(), 1);
        match &outs[0].payload {
            OutputPayload::MultimediaResult { representations, execution_count } => {
                assert_eq!(representations["text/plain"].data, json!("21"));
                assert_eq!(*execution_count, 1);
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_outputs_arrive_in_order_before_the_response() {
        let stream = (0..10)
            .map(|i| WorkerOutput::Stdout { text: format!("{i}\n") })
            .collect();
        let transport =
            ScriptedWorkerTransport::new(vec![ScriptedReply::Outputs { stream, result: None }]);
        let bridge = bridge_over(transport);
        let store = MemoryStore::new();
        let ctx = context(&store, CancellationToken::new());

        bridge.execute(ctx, "for i in range(10): print(i)").await.unwrap();

        let outs = outputs(&store).await;
        assert_eq!(outs.len(), 10);
        for (i, out) in outs.iter().enumerate() {
            assert_eq!(out.position, i as u64);
            match &out.payload {
                OutputPayload::Terminal { stream: StreamName::Stdout, text } => {
                    assert_eq!(text, &format!("{i}\n"));
                }
                other => panic!("wrong payload: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn worker_error_becomes_structured_error_output() {
        let transport = ScriptedWorkerTransport::new(vec![ScriptedReply::Failure {
            error: "Traceback (most recent call last):\n  File \"<cell>\", line 1\nValueError: test"
                .into(),
        }]);
        let bridge = bridge_over(transport);
        let store = MemoryStore::new();
        let ctx = context(&store, CancellationToken::new());

        let outcome = bridge.execute(ctx, "raise ValueError('test')").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("ValueError: test"));

        let outs = outputs(&store).await;
        match &outs[0].payload {
            OutputPayload::Error { ename, evalue, .. } => {
                assert_eq!(ename, "ValueError");
                assert!(evalue.contains("test"));
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn already_cancelled_execution_short_circuits() {
        let transport = ScriptedWorkerTransport::new(vec![]);
        let bridge = bridge_over(transport.clone());
        let store = MemoryStore::new();
        let token = CancellationToken::new();
        token.cancel();
        let ctx = context(&store, token);

        let outcome = bridge.execute(ctx, "1 + 1").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(transport.start_count(), 0, "worker must not be started");

        let outs = outputs(&store).await;
        assert_eq!(outs.len(), 1);
        assert!(matches!(
            &outs[0].payload,
            OutputPayload::Terminal { stream: StreamName::Stderr, .. }
        ));
    }

    #[tokio::test]
    async fn interrupt_byte_cancels_a_hanging_execution() {
        let transport = ScriptedWorkerTransport::new(vec![ScriptedReply::HangUntilInterrupt]);
        let bridge = bridge_over(transport);
        let store = MemoryStore::new();
        let token = CancellationToken::new();
        let ctx = context(&store, token.clone());

        let cancel = tokio::spawn({
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                token.cancel();
            }
        });

        let outcome = bridge.execute(ctx, "while True: pass").await.unwrap();
        cancel.await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Execution cancelled"));
        let outs = outputs(&store).await;
        assert_eq!(outs.len(), 1, "exactly one cancellation stderr line");
        match &outs[0].payload {
            OutputPayload::Terminal { stream: StreamName::Stderr, text } => {
                assert!(text.contains("cancelled"));
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn crash_rejects_queued_executions_and_reinitializes() {
        let transport = ScriptedWorkerTransport::new(vec![
            ScriptedReply::Crash { reason: "segfault".into() },
            ScriptedReply::Outputs { stream: vec![], result: Some(json!({"text/plain": "2"})) },
        ]);
        let starts = Arc::new(AtomicUsize::new(0));
        let factory: TransportFactory = Box::new({
            let transport = transport.clone();
            let starts = Arc::clone(&starts);
            move || {
                starts.fetch_add(1, Ordering::SeqCst);
                Arc::new(transport.clone())
            }
        });
        let bridge = Arc::new(WorkerBridge::new(factory, WorkerConfig::default()).unwrap());
        let store = MemoryStore::new();

        // Queue two executions back to back; the first crashes the worker.
        let first = {
            let bridge = Arc::clone(&bridge);
            let ctx = context(&store, CancellationToken::new());
            tokio::spawn(async move { bridge.execute(ctx, "boom").await })
        };
        let second = {
            let bridge = Arc::clone(&bridge);
            let ctx = context(&store, CancellationToken::new());
            tokio::spawn(async move { bridge.execute(ctx, "queued").await })
        };

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        let first_err = first.unwrap_err().to_string();
        assert!(first_err.contains("Worker crashed"), "got: {first_err}");
        // The queued execution may be drained by the crash or, if it arrived
        // after the drain, served by a fresh worker.
        let reinit_ok = match second {
            Err(e) => {
                assert!(e.to_string().contains("Worker crashed"));
                false
            }
            Ok(outcome) => outcome.success,
        };

        // A third execution must always be served by a re-initialized worker.
        if !reinit_ok {
            let ctx = context(&store, CancellationToken::new());
            let outcome = bridge.execute(ctx, "1 + 1").await.unwrap();
            assert!(outcome.success);
        }
        assert!(starts.load(Ordering::SeqCst) >= 2, "worker must have been re-spawned");
    }

    #[tokio::test]
    async fn clear_output_resets_positions() {
        let transport = ScriptedWorkerTransport::new(vec![ScriptedReply::Outputs {
            stream: vec![
                WorkerOutput::Stdout { text: "first\n".into() },
                WorkerOutput::ClearOutput { wait: false },
                WorkerOutput::Stdout { text: "second\n".into() },
            ],
            result: None,
        }]);
        let bridge = bridge_over(transport);
        let store = MemoryStore::new();
        let ctx = context(&store, CancellationToken::new());

        bridge.execute(ctx, "...").await.unwrap();

        let outs = outputs(&store).await;
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0].position, 0);
        match &outs[0].payload {
            OutputPayload::Terminal { text, .. } => assert_eq!(text, "second\n"),
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn display_id_updates_replace_in_place() {
        let transport = ScriptedWorkerTransport::new(vec![ScriptedReply::Outputs {
            stream: vec![
                WorkerOutput::DisplayData {
                    data: [("text/plain".to_string(), json!("0%"))].into_iter().collect(),
                    metadata: None,
                    transient: Some(crate::protocol::Transient { display_id: Some("bar".into()) }),
                },
                WorkerOutput::UpdateDisplayData {
                    data: [("text/plain".to_string(), json!("100%"))].into_iter().collect(),
                    metadata: None,
                    transient: Some(crate::protocol::Transient { display_id: Some("bar".into()) }),
                },
            ],
            result: None,
        }]);
        let bridge = bridge_over(transport);
        let store = MemoryStore::new();
        let ctx = context(&store, CancellationToken::new());

        bridge.execute(ctx, "progress()").await.unwrap();

        let outs = outputs(&store).await;
        assert_eq!(outs.len(), 1, "update must not create a second output");
        match &outs[0].payload {
            OutputPayload::MultimediaDisplay { representations, display_id } => {
                assert_eq!(display_id.as_deref(), Some("bar"));
                assert_eq!(representations["text/plain"].data, json!("100%"));
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }
}
