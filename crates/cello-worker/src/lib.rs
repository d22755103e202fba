// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod bridge;
mod interrupt;
mod mock;
pub mod protocol;
mod traceback;
mod transport;
pub mod value;

pub use bridge::{CodeCellHandler, TransportFactory, WorkerBridge, WorkerConfig, WorkerCrashed, CANCELLED_STDERR};
pub use interrupt::{InterruptRegion, INTERRUPT_SIGINT};
pub use mock::{ScriptedReply, ScriptedWorkerTransport};
pub use traceback::{classify_worker_error, WorkerFailure};
pub use transport::{ProcessTransport, TransportEvent, WorkerTransport};
