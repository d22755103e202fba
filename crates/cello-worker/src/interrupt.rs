// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The shared interrupt byte.
//!
//! One byte of file-backed shared memory between the agent and the worker.
//! Only the agent writes a non-zero value (the platform SIGINT number); the
//! worker observes it at safe points and clears it on execution exit.

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};

use memmap2::MmapMut;
use tempfile::NamedTempFile;

/// Value written to request cooperative preemption.
pub const INTERRUPT_SIGINT: u8 = libc::SIGINT as u8;

pub struct InterruptRegion {
    map: MmapMut,
    file: NamedTempFile,
}

impl InterruptRegion {
    /// Create the backing file and map its single byte.
    pub fn new() -> std::io::Result<Self> {
        let file = NamedTempFile::new()?;
        file.as_file().set_len(1)?;
        // SAFETY: the file is owned by this struct and lives as long as the
        // mapping; no other mapping of it is created in this process.
        let map = unsafe { MmapMut::map_mut(file.as_file())? };
        Ok(Self { map, file })
    }

    /// Path handed to the worker in the init request.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    fn byte(&self) -> &AtomicU8 {
        // SAFETY: the mapping is at least one byte long and u8 atomics have
        // no alignment requirement beyond a single byte.
        unsafe { &*(self.map.as_ptr() as *const AtomicU8) }
    }

    /// Request an interrupt.
    pub fn set(&self) {
        self.byte().store(INTERRUPT_SIGINT, Ordering::SeqCst);
    }

    /// Reset after an execution finishes.
    pub fn clear(&self) {
        self.byte().store(0, Ordering::SeqCst);
    }

    pub fn value(&self) -> u8 {
        self.byte().load(Ordering::SeqCst)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
