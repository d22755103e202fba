// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Runtime lifecycle: session handshake, heartbeat, shutdown.
//!
//! Process-global concerns (signal handlers) are wired by the binary around
//! [`Runtime::shutdown`]; everything here is per-instance and idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cello_store::{
    NotebookEvent, Record, RuntimeSession, Selector, SessionStatus, Store, TerminationReason,
};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::engine::CoordinationEngine;

/// A started runtime agent: one session attached to one notebook.
pub struct Runtime {
    store: Arc<dyn Store>,
    session_id: String,
    shutdown_token: CancellationToken,
    engine_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Runtime {
    /// Start a runtime session.
    ///
    /// Displaces every currently active session, announces this one, brings
    /// the engine up, and flips the session to ready.  The engine owns the
    /// store subscriptions; they are dropped when its task ends.
    pub async fn start(
        store: Arc<dyn Store>,
        config: RuntimeConfig,
        engine: CoordinationEngine,
        session_id: String,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        // The engine was built against the shutdown token that this runtime
        // will own; cancelling it stops both.
        let shutdown_token = engine.shutdown_handle();

        // Displace peers: at most one active session per notebook.
        let active = store.query(Selector::ActiveSessions).await.unwrap_or_default();
        for session in active.iter().filter_map(Record::as_session) {
            info!(displaced = %session.session_id, "displacing active session");
            if let Err(e) = store
                .commit(NotebookEvent::RuntimeSessionTerminated {
                    session_id: session.session_id.clone(),
                    reason: TerminationReason::Displaced,
                })
                .await
            {
                warn!(error = %e, "displacement commit failed");
            }
        }

        store
            .commit(NotebookEvent::RuntimeSessionStarted {
                session: RuntimeSession {
                    session_id: session_id.clone(),
                    runtime_id: config.runtime_id.clone(),
                    runtime_type: config.runtime_type.clone(),
                    capabilities: config.capabilities.clone(),
                    status: SessionStatus::Starting,
                    is_active: true,
                    last_heartbeat: Utc::now(),
                },
            })
            .await
            .map_err(|e| anyhow::anyhow!("session start commit failed: {e}"))?;

        let engine = Arc::new(engine);
        let engine_task = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run().await }
        });

        if let Err(e) = store
            .commit(NotebookEvent::RuntimeSessionStatusChanged {
                session_id: session_id.clone(),
                status: SessionStatus::Ready,
            })
            .await
        {
            warn!(error = %e, "ready status commit failed");
        }

        let heartbeat_task = tokio::spawn(heartbeat_loop(
            Arc::clone(&store),
            session_id.clone(),
            config.heartbeat_interval_ms,
            shutdown_token.clone(),
        ));

        info!(session_id = %session_id, notebook = %config.notebook_id, "runtime session ready");

        Ok(Arc::new(Self {
            store,
            session_id,
            shutdown_token,
            engine_task: Mutex::new(Some(engine_task)),
            heartbeat_task: Mutex::new(Some(heartbeat_task)),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Token cancelled when shutdown begins.  Engines constructed for this
    /// runtime should share it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Block until shutdown is requested and the engine task has drained.
    pub async fn wait(&self) {
        self.shutdown_token.cancelled().await;
        if let Some(task) = self.engine_task.lock().await.take() {
            let _ = task.await;
        }
    }

    /// Tear the session down.  Idempotent; store failures during shutdown
    /// are logged and swallowed.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = %self.session_id, "shutting down");

        self.shutdown_token.cancel();
        if let Some(task) = self.engine_task.lock().await.take() {
            let _ = task.await;
        }
        if let Some(task) = self.heartbeat_task.lock().await.take() {
            let _ = task.await;
        }

        if let Err(e) = self
            .store
            .commit(NotebookEvent::RuntimeSessionTerminated {
                session_id: self.session_id.clone(),
                reason: TerminationReason::Shutdown,
            })
            .await
        {
            debug!(error = %e, "termination commit dropped");
        }
    }
}

/// Generate the opaque session id for a new runtime instance.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

async fn heartbeat_loop(
    store: Arc<dyn Store>,
    session_id: String,
    interval_ms: u64,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    // The first tick fires immediately; skip it, the start handshake just
    // wrote a fresh timestamp.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let event = NotebookEvent::RuntimeSessionHeartbeat {
                    session_id: session_id.clone(),
                    at: Utc::now(),
                };
                if let Err(e) = store.commit(event).await {
                    debug!(error = %e, "heartbeat commit dropped");
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
