// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::Parser;

use cello_core::RuntimeConfig;

/// Runtime agent for collaborative notebooks.
///
/// Attaches to a notebook document, claims queued executions cooperatively
/// with peer agents, and runs code and AI cells on behalf of remote users.
#[derive(Parser, Debug)]
#[command(name = "cello", version)]
pub struct Cli {
    /// Notebook document to attach to.
    #[arg(long, env = "CELLO_NOTEBOOK")]
    pub notebook: String,

    /// Token presented to the sync backend.
    #[arg(long, env = "CELLO_AUTH_TOKEN")]
    pub auth_token: String,

    /// Sync endpoint URL.  Omitted: the agent runs against its in-process
    /// store (useful for local notebooks and tests).
    #[arg(long, env = "CELLO_SYNC_URL")]
    pub sync_url: Option<String>,

    /// Stable runtime identifier.  Generated when omitted.
    #[arg(long, env = "CELLO_RUNTIME_ID")]
    pub runtime_id: Option<String>,

    /// Advertised runtime kind.
    #[arg(long, env = "CELLO_RUNTIME_TYPE", default_value = "python3")]
    pub runtime_type: String,

    /// Heartbeat cadence in milliseconds.
    #[arg(long, env = "CELLO_HEARTBEAT_INTERVAL", default_value_t = 15_000)]
    pub heartbeat_interval: u64,

    /// Command that launches the sandboxed interpreter worker.  Code cells
    /// are refused when no worker is configured.
    #[arg(long, env = "CELLO_WORKER_CMD")]
    pub worker_cmd: Option<String>,

    /// Packages pre-loaded into the interpreter (comma separated).
    #[arg(long, env = "CELLO_PRELOAD_PACKAGES", value_delimiter = ',')]
    pub preload_packages: Vec<String>,

    /// On-disk package cache directory handed to the worker.
    #[arg(long, env = "CELLO_PACKAGE_CACHE_DIR")]
    pub package_cache_dir: Option<PathBuf>,
}

impl Cli {
    pub fn runtime_config(&self, ai_models: Vec<String>, can_execute_code: bool) -> RuntimeConfig {
        let mut config = RuntimeConfig::new(self.notebook.clone(), self.auth_token.clone());
        config.sync_url = self.sync_url.clone();
        if let Some(runtime_id) = &self.runtime_id {
            config.runtime_id = runtime_id.clone();
        }
        config.runtime_type = self.runtime_type.clone();
        config.heartbeat_interval_ms = self.heartbeat_interval;
        config.capabilities.can_execute_code = can_execute_code;
        config.capabilities.can_execute_sql = false;
        config.capabilities.can_execute_ai = !ai_models.is_empty();
        config.capabilities.available_ai_models = ai_models;
        config
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
