// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The unified tool interface.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use magpie_core::{MagpieError, ToolDefinition};

/// Per-invocation context handed to every tool call.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Channel of the message that triggered this call.
    pub channel: String,
    /// Chat the reply will go to.
    pub chat_id: String,
    /// Cancelled when the surrounding message handler is cancelled; tools
    /// honor it at their next yield point.
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(channel: &str, chat_id: &str, cancel: CancellationToken) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            cancel,
        }
    }
}

/// A tool the LLM can invoke.
///
/// Implementations provide a name, description, and a JSON Schema for the
/// parameters; the registry handles everything around `execute`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name (the registry refuses duplicates).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema describing the input parameters.
    fn parameters_schema(&self) -> Value;

    /// Whether the output is a pure function of the arguments, eligible
    /// for LRU+TTL caching and concurrent-call deduplication.
    fn cacheable(&self) -> bool {
        false
    }

    /// Cache TTL override; `None` uses the registry default.
    fn cache_ttl(&self) -> Option<Duration> {
        None
    }

    /// Transient failures retried beyond the first attempt.
    fn max_retries(&self) -> u32 {
        0
    }

    /// Per-call timeout override; `None` uses the registry default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> Result<String, MagpieError>;

    /// Definition in the provider's function-call convention.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}
