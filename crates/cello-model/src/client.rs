// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, ResponseEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// A streaming chat-completion backend.
///
/// Cancellation is expressed by dropping the returned stream: the caller
/// races the stream against its abort handle and drops it when cancelled,
/// which tears down the underlying HTTP response.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Human-readable backend name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn generate_stream(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;
}
