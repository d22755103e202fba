// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod config;
mod context;
mod engine;
mod handler;
mod lifecycle;
pub mod media;

pub use config::RuntimeConfig;
pub use context::{ExecutionCancelled, ExecutionContext};
pub use engine::{CoordinationEngine, ExecutionErrorHook};
pub use handler::{ExecutionHandler, ExecutionOutcome, MarkupCellHandler, SqlCellHandler};
pub use lifecycle::{new_session_id, Runtime};
