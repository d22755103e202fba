// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;

use cello_store::{Cell, RawMediaMap};

use crate::context::ExecutionContext;

/// What a handler reports back to the engine when it returns normally.
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// Final data payload; the engine emits it as a `multimedia_result`
    /// through the context when present.
    pub result: Option<RawMediaMap>,
}

impl ExecutionOutcome {
    pub fn success() -> Self {
        Self { success: true, error: None, result: None }
    }

    pub fn success_with_result(result: RawMediaMap) -> Self {
        Self { success: true, error: None, result: Some(result) }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), result: None }
    }

    /// The failure reported when an execution was cooperatively cancelled.
    pub fn cancelled() -> Self {
        Self::failure("Execution cancelled")
    }
}

/// An execution handler for one kind of cell.
///
/// Handlers emit everything user-visible through the context; the returned
/// outcome only drives queue bookkeeping.  A returned `Err` is a handler
/// *crash*: the engine records it and keeps running.
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    async fn execute(
        &self,
        ctx: Arc<ExecutionContext>,
        cell: Cell,
    ) -> anyhow::Result<ExecutionOutcome>;
}

/// Handler for markdown and raw cells.  There is nothing to run; the entry
/// completes immediately so it never wedges the queue.
pub struct MarkupCellHandler;

#[async_trait]
impl ExecutionHandler for MarkupCellHandler {
    async fn execute(
        &self,
        _ctx: Arc<ExecutionContext>,
        _cell: Cell,
    ) -> anyhow::Result<ExecutionOutcome> {
        Ok(ExecutionOutcome::success())
    }
}

/// Handler for sql cells on a runtime without SQL capability.  Reports a
/// structured error instead of leaving the entry assigned forever.
pub struct SqlCellHandler;

#[async_trait]
impl ExecutionHandler for SqlCellHandler {
    async fn execute(
        &self,
        ctx: Arc<ExecutionContext>,
        _cell: Cell,
    ) -> anyhow::Result<ExecutionOutcome> {
        ctx.error(
            "CapabilityError",
            "this runtime cannot execute SQL cells",
            &[],
        )
        .await;
        Ok(ExecutionOutcome::failure("this runtime cannot execute SQL cells"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
