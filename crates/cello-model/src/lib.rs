// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod client;
mod mock;
mod openai_compat;
mod types;

pub use client::{ModelClient, ResponseStream};
pub use mock::{HangingMockClient, ScriptedMockClient};
pub use openai_compat::OpenAiCompatClient;
pub use types::*;
