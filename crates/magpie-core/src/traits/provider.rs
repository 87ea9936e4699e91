// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! LLM provider trait consumed by the agent loop and subagents.
//!
//! Providers translate the kernel's chat shape to a concrete API (Anthropic,
//! OpenRouter, a local server). The kernel only depends on this trait; it
//! never constructs HTTP clients itself.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MagpieError;
use crate::types::TokenUsage;

/// One message in a provider conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// "system", "user", "assistant", or "tool".
    pub role: String,
    pub content: ChatContent,
    /// Tool calls issued by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// For role "tool": the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For role "tool": the tool name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Message content: plain text or multimodal parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl ChatContent {
    /// Flatten to text (image parts are dropped).
    pub fn as_text(&self) -> String {
        match self {
            ChatContent::Text(t) => t.clone(),
            ChatContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn char_len(&self) -> usize {
        match self {
            ChatContent::Text(t) => t.len(),
            ChatContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::Image { .. } => 0,
                })
                .sum(),
        }
    }
}

/// One part of a multimodal message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Base64-encoded image in the provider's multimodal shape.
    Image { media_type: String, data: String },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text("assistant", content)
    }

    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: ChatContent::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// An assistant turn that carries tool calls.
    pub fn assistant_with_calls(content: Option<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: ChatContent::Text(content.unwrap_or_default()),
            tool_calls: calls,
            tool_call_id: None,
            name: None,
        }
    }

    /// A tool-result turn answering `call_id`.
    pub fn tool_result(call_id: &str, tool_name: &str, result: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: ChatContent::Text(result.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.to_string()),
            name: Some(tool_name.to_string()),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A tool definition in the provider's function-call convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool's parameters.
    pub parameters: Value,
}

/// A complete chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A complete chat response.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: TokenUsage,
    pub stop_reason: Option<String>,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Retry policy for provider calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Jittered exponential backoff delay for the given attempt (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .as_secs_f64()
            .mul_add(2f64.powi(attempt as i32), fastrand::f64() * 0.25);
        Duration::from_secs_f64(exp.min(self.max_delay.as_secs_f64()))
    }
}

/// Adapter for LLM provider integrations.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat request and return the full response.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, MagpieError>;

    /// The model used when a session has no override.
    fn default_model(&self) -> &str;

    /// Transcribe audio bytes to text. Optional; the default reports the
    /// capability as unavailable.
    async fn transcribe(&self, _bytes: &[u8], _mime: &str) -> Result<String, MagpieError> {
        Err(MagpieError::Provider {
            kind: crate::error::ProviderErrorKind::BadRequest,
            message: "transcription not supported by this provider".to_string(),
        })
    }

    /// `chat` with retries on transient/rate-limited failures.
    async fn chat_with_retry(
        &self,
        request: ChatRequest,
        retry: RetryConfig,
    ) -> Result<ChatResponse, MagpieError> {
        let mut attempt = 0u32;
        loop {
            match self.chat(request.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() && attempt < retry.max_retries => {
                    let delay = retry.delay_for(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
