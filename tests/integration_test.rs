// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end scenarios: a full runtime (engine + handlers) against the
//! in-memory store, with scripted worker transports and model clients in
//! place of the interpreter process and the model API.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use cello_ai::{AiCellHandler, AiDriver};
use cello_core::{
    new_session_id, CoordinationEngine, MarkupCellHandler, Runtime, RuntimeConfig, SqlCellHandler,
};
use cello_model::{ModelClient, ScriptedMockClient};
use cello_store::{
    Cell, CellType, ExecutionQueueEntry, MemoryStore, NotebookEvent, Output, OutputPayload,
    QueueStatus, Record, Selector, Store, StreamName,
};
use cello_worker::protocol::WorkerOutput;
use cello_worker::{
    CodeCellHandler, ScriptedReply, ScriptedWorkerTransport, TransportFactory, WorkerBridge,
    WorkerConfig,
};

fn worker_bridge(transport: ScriptedWorkerTransport) -> Arc<WorkerBridge> {
    let factory: TransportFactory =
        Box::new(move || -> Arc<dyn cello_worker::WorkerTransport> {
            Arc::new(transport.clone())
        });
    Arc::new(WorkerBridge::new(factory, WorkerConfig::default()).unwrap())
}

struct TestRuntime {
    store: MemoryStore,
    runtime: Arc<Runtime>,
}

/// Bring up a full runtime with the given worker script and model client.
async fn start_runtime(
    store: MemoryStore,
    worker: Option<ScriptedWorkerTransport>,
    model: Option<Arc<dyn ModelClient>>,
) -> TestRuntime {
    let session_id = new_session_id();
    let shutdown = CancellationToken::new();
    let shared: Arc<dyn Store> = Arc::new(store.clone());

    let mut engine = CoordinationEngine::new(Arc::clone(&shared), session_id.clone(), shutdown);
    engine.register(CellType::Markdown, Arc::new(MarkupCellHandler));
    engine.register(CellType::Raw, Arc::new(MarkupCellHandler));
    engine.register(CellType::Sql, Arc::new(SqlCellHandler));
    if let Some(worker) = worker {
        engine.register(CellType::Code, Arc::new(CodeCellHandler::new(worker_bridge(worker))));
    }
    engine.register(
        CellType::Ai,
        Arc::new(AiCellHandler::new(AiDriver::new(
            Arc::clone(&shared),
            session_id.clone(),
            model,
        ))),
    );

    let mut config = RuntimeConfig::new("nb-test", "token");
    config.heartbeat_interval_ms = 60_000;
    let runtime = Runtime::start(shared, config, engine, session_id).await.unwrap();
    TestRuntime { store, runtime }
}

fn request(queue_id: &str, cell_id: &str) -> NotebookEvent {
    NotebookEvent::ExecutionRequested {
        entry: ExecutionQueueEntry {
            id: queue_id.into(),
            cell_id: cell_id.into(),
            execution_count: 1,
            requested_by: "user".into(),
            priority: 0,
            status: QueueStatus::Pending,
            assigned_runtime_session: None,
            started_at: None,
            completed_at: None,
            execution_duration_ms: None,
            error: None,
        },
    }
}

async fn wait_for(store: &MemoryStore, queue_id: &str, status: QueueStatus) -> ExecutionQueueEntry {
    for _ in 0..400 {
        let records = store
            .query(Selector::QueueByStatus { status, assigned_session: None })
            .await
            .unwrap();
        if let Some(entry) =
            records.iter().filter_map(Record::as_queue).find(|q| q.id == queue_id)
        {
            return entry.clone();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("queue entry {queue_id} never reached {status:?}");
}

async fn outputs_of(store: &MemoryStore, cell_id: &str) -> Vec<Output> {
    store
        .query(Selector::OutputsForCell { cell_id: cell_id.into() })
        .await
        .unwrap()
        .into_iter()
        .filter_map(|r| match r {
            Record::Output(o) => Some(o),
            _ => None,
        })
        .collect()
}

// ── S1: arithmetic code cell ─────────────────────────────────────────────────

#[tokio::test]
async fn s1_arithmetic_code_cell_produces_one_result() {
    let store = MemoryStore::new();
    store.seed_cell(Cell::new("c1", CellType::Code, "3 * 7", 1.0)).await;

    let worker = ScriptedWorkerTransport::new(vec![ScriptedReply::Outputs {
        stream: vec![],
        result: Some(json!({"text/plain": "21"})),
    }]);
    let rt = start_runtime(store, Some(worker), None).await;

    rt.store.commit(request("q1", "c1")).await.unwrap();
    let entry = wait_for(&rt.store, "q1", QueueStatus::Completed).await;
    assert!(entry.execution_duration_ms.is_some());

    let outs = outputs_of(&rt.store, "c1").await;
    assert_eq!(outs.len(), 1, "exactly one output expected");
    match &outs[0].payload {
        OutputPayload::MultimediaResult { representations, .. } => {
            assert_eq!(representations["text/plain"].data, json!("21"));
        }
        other => panic!("wrong payload: {other:?}"),
    }

    rt.runtime.shutdown().await;
}

// ── S2: stdout ordering ──────────────────────────────────────────────────────

#[tokio::test]
async fn s2_ten_prints_keep_their_order_and_positions() {
    let store = MemoryStore::new();
    store
        .seed_cell(Cell::new("c1", CellType::Code, "for i in range(10): print(i)", 1.0))
        .await;

    let stream: Vec<WorkerOutput> =
        (0..10).map(|i| WorkerOutput::Stdout { text: format!("{i}\n") }).collect();
    let worker =
        ScriptedWorkerTransport::new(vec![ScriptedReply::Outputs { stream, result: None }]);
    let rt = start_runtime(store, Some(worker), None).await;

    rt.store.commit(request("q1", "c1")).await.unwrap();
    wait_for(&rt.store, "q1", QueueStatus::Completed).await;

    let outs = outputs_of(&rt.store, "c1").await;
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

    rt.runtime.shutdown().await;
}

// ── S3: error cell ───────────────────────────────────────────────────────────

#[tokio::test]
async fn s3_raised_error_becomes_structured_error_output() {
    let store = MemoryStore::new();
    store.seed_cell(Cell::new("c1", CellType::Code, "raise ValueError(\"test\")", 1.0)).await;

    let worker = ScriptedWorkerTransport::new(vec![ScriptedReply::Failure {
        error: "Traceback (most recent call last):\n  File \"<cell>\", line 1, in <module>\nValueError: test"
            .into(),
    }]);
    let rt = start_runtime(store, Some(worker), None).await;

    rt.store.commit(request("q1", "c1")).await.unwrap();
    let entry = wait_for(&rt.store, "q1", QueueStatus::Failed).await;
    assert!(entry.error.as_deref().unwrap_or_default().contains("ValueError"));

    let outs = outputs_of(&rt.store, "c1").await;
    assert_eq!(outs.len(), 1);
    match &outs[0].payload {
        OutputPayload::Error { ename, evalue, .. } => {
            assert_eq!(ename, "ValueError");
            assert!(evalue.contains("test"));
        }
        other => panic!("wrong payload: {other:?}"),
    }

    rt.runtime.shutdown().await;
}

// ── S4: cancellation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn s4_cancellation_interrupts_worker_and_suppresses_error_commit() {
    let store = MemoryStore::new();
    store.seed_cell(Cell::new("c1", CellType::Code, "while True: pass", 1.0)).await;
    store.seed_cell(Cell::new("c2", CellType::Code, "1 + 1", 2.0)).await;

    let worker = ScriptedWorkerTransport::new(vec![
        ScriptedReply::HangUntilInterrupt,
        ScriptedReply::Outputs { stream: vec![], result: Some(json!({"text/plain": "2"})) },
    ]);
    let rt = start_runtime(store, Some(worker), None).await;

    rt.store.commit(request("q1", "c1")).await.unwrap();
    wait_for(&rt.store, "q1", QueueStatus::Executing).await;

    rt.store.commit(NotebookEvent::ExecutionCancelled { queue_id: "q1".into() }).await.unwrap();
    wait_for(&rt.store, "q1", QueueStatus::Cancelled).await;

    // The bridge must be free for the next execution.
    rt.store.commit(request("q2", "c2")).await.unwrap();
    wait_for(&rt.store, "q2", QueueStatus::Completed).await;

    // A single stderr line on the cancelled cell.
    let outs = outputs_of(&rt.store, "c1").await;
    assert_eq!(outs.len(), 1);
    match &outs[0].payload {
        OutputPayload::Terminal { stream: StreamName::Stderr, text } => {
            assert!(text.to_lowercase().contains("cancelled"));
        }
        other => panic!("wrong payload: {other:?}"),
    }

    // No completion of any kind was committed for the cancelled entry.
    let log = rt.store.committed_events();
    assert!(
        !log.iter()
            .any(|e| matches!(e, NotebookEvent::ExecutionCompleted { queue_id, .. } if queue_id == "q1")),
        "no executionCompleted may be committed for a cancelled entry"
    );

    rt.runtime.shutdown().await;
}

// ── S5: AI tool call ─────────────────────────────────────────────────────────

#[tokio::test]
async fn s5_ai_cell_creates_code_cell_then_finishes_in_two_turns() {
    let store = MemoryStore::new();
    store
        .seed_cell(Cell::new("ai-1", CellType::Ai, "Create a code cell that prints hello", 3.0))
        .await;

    let model = ScriptedMockClient::tool_then_text(
        "call-1",
        "create_cell",
        r#"{"cellType":"code","content":"print('hello')","position":"after_current"}"#,
        "Done.",
    );
    let requests = Arc::clone(&model.requests);
    let rt = start_runtime(store, None, Some(Arc::new(model))).await;

    rt.store.commit(request("q1", "ai-1")).await.unwrap();
    wait_for(&rt.store, "q1", QueueStatus::Completed).await;

    // (a) a new code cell with the requested source at position + 0.1
    let cells = rt.store.query(Selector::AllCells).await.unwrap();
    let created = cells
        .iter()
        .filter_map(Record::as_cell)
        .find(|c| c.source == "print('hello')")
        .expect("tool call must create the cell");
    assert_eq!(created.cell_type, CellType::Code);
    assert!((created.position - 3.1).abs() < 1e-9);

    // (b) a markdown output containing the final text
    let outs = outputs_of(&rt.store, "ai-1").await;
    assert!(outs.iter().any(
        |o| matches!(&o.payload, OutputPayload::Markdown { text } if text.contains("Done."))
    ));

    // (c) exactly two model turns
    assert_eq!(requests.lock().unwrap().len(), 2);

    rt.runtime.shutdown().await;
}

// ── S6: session displacement ─────────────────────────────────────────────────

#[tokio::test]
async fn s6_second_session_displaces_the_first_before_starting() {
    let store = MemoryStore::new();
    let first = start_runtime(store.clone(), None, None).await;
    let first_id = first.runtime.session_id().to_string();

    let second = start_runtime(store.clone(), None, None).await;

    let log = store.committed_events();
    let displaced_at = log
        .iter()
        .position(|e| matches!(
            e,
            NotebookEvent::RuntimeSessionTerminated {
                session_id,
                reason: cello_store::TerminationReason::Displaced,
            } if session_id == &first_id
        ))
        .expect("first session must be displaced");
    let second_start_at = log
        .iter()
        .position(|e| matches!(
            e,
            NotebookEvent::RuntimeSessionStarted { session }
                if session.session_id == second.runtime.session_id()
        ))
        .expect("second session must start");
    assert!(displaced_at < second_start_at, "displacement precedes the new session start");

    let active = store.query(Selector::ActiveSessions).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].as_session().unwrap().session_id, second.runtime.session_id());

    second.runtime.shutdown().await;
    first.runtime.shutdown().await;
}

// ── Markdown / sql cells keep the queue moving ───────────────────────────────

#[tokio::test]
async fn markdown_cell_completes_and_sql_cell_fails_gracefully() {
    let store = MemoryStore::new();
    store.seed_cell(Cell::new("m1", CellType::Markdown, "# title", 1.0)).await;
    store.seed_cell(Cell::new("s1", CellType::Sql, "select 1", 2.0)).await;
    let rt = start_runtime(store, None, None).await;

    rt.store.commit(request("q1", "m1")).await.unwrap();
    wait_for(&rt.store, "q1", QueueStatus::Completed).await;
    assert!(outputs_of(&rt.store, "m1").await.is_empty());

    rt.store.commit(request("q2", "s1")).await.unwrap();
    let entry = wait_for(&rt.store, "q2", QueueStatus::Failed).await;
    assert!(entry.error.as_deref().unwrap_or_default().contains("SQL"));

    rt.runtime.shutdown().await;
}
