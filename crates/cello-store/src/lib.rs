// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod events;
mod memory;
mod records;
mod store;

pub use events::{CompletionStatus, NotebookEvent, TerminationReason};
pub use memory::MemoryStore;
pub use records::{
    Cell, CellType, ExecutionQueueEntry, Output, OutputPayload, QueueStatus, RawMediaMap,
    Representation, RepresentationKind, RepresentationMap, RuntimeCapabilities, RuntimeSession,
    SessionStatus, StreamName,
};
pub use store::{Record, Selector, Store, StoreError, StoreResult, Subscription};
