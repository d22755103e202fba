// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use cello_store::RuntimeCapabilities;
use uuid::Uuid;

/// Resolved runtime configuration.
///
/// The binary builds this from CLI flags and their environment fallbacks;
/// embedders construct it directly.  Validation happens before the runtime
/// starts; an invalid configuration is the only fatal error class.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// The notebook document this agent attaches to.
    pub notebook_id: String,
    /// Token presented to the sync backend.
    pub auth_token: String,
    /// Sync endpoint; `None` runs against the in-process store.
    pub sync_url: Option<String>,
    /// Stable identifier of this runtime installation.
    pub runtime_id: String,
    /// Advertised runtime kind, e.g. `"python3"`.
    pub runtime_type: String,
    /// Heartbeat cadence in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Capabilities advertised in the session record.
    pub capabilities: RuntimeCapabilities,
}

impl RuntimeConfig {
    pub fn new(notebook_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            notebook_id: notebook_id.into(),
            auth_token: auth_token.into(),
            sync_url: None,
            runtime_id: Uuid::new_v4().to_string(),
            runtime_type: "python3".to_string(),
            heartbeat_interval_ms: 15_000,
            capabilities: RuntimeCapabilities::default(),
        }
    }

    /// Reject configurations the runtime cannot start with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.notebook_id.trim().is_empty() {
            anyhow::bail!("notebook id must not be empty");
        }
        if self.auth_token.trim().is_empty() {
            anyhow::bail!("auth token must not be empty");
        }
        if self.heartbeat_interval_ms == 0 {
            anyhow::bail!("heartbeat interval must be positive");
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
