// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mock LLM provider with scripted responses.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use magpie_core::{
    ChatRequest, ChatResponse, LlmProvider, MagpieError, TokenUsage, ToolCallRequest,
};

/// A mock provider that pops pre-configured responses from a FIFO queue.
///
/// When the queue is empty, a default text response is returned. Every
/// request is recorded for later inspection.
pub struct MockProvider {
    responses: Arc<Mutex<VecDeque<ChatResponse>>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Pre-load plain text responses.
    pub fn with_texts(texts: Vec<&str>) -> Self {
        let queue: VecDeque<ChatResponse> =
            texts.into_iter().map(Self::text_response).collect();
        Self {
            responses: Arc::new(Mutex::new(queue)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a plain text response.
    pub async fn push_text(&self, text: &str) {
        self.responses
            .lock()
            .await
            .push_back(Self::text_response(text));
    }

    /// Queue a response that calls one tool.
    pub async fn push_tool_call(&self, tool: &str, arguments: serde_json::Value) {
        self.push_tool_calls(vec![(tool.to_string(), arguments)]).await;
    }

    /// Queue a response that calls several tools at once.
    pub async fn push_tool_calls(&self, calls: Vec<(String, serde_json::Value)>) {
        let tool_calls = calls
            .into_iter()
            .map(|(name, arguments)| ToolCallRequest {
                id: format!("call-{}", uuid::Uuid::new_v4()),
                name,
                arguments,
            })
            .collect();
        self.responses.lock().await.push_back(ChatResponse {
            content: None,
            tool_calls,
            usage: Self::usage(),
            stop_reason: Some("tool_use".to_string()),
        });
    }

    /// Queue a raw response.
    pub async fn push_response(&self, response: ChatResponse) {
        self.responses.lock().await.push_back(response);
    }

    /// Every request received so far, in order.
    pub async fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }

    fn text_response(text: &str) -> ChatResponse {
        ChatResponse {
            content: Some(text.to_string()),
            tool_calls: Vec::new(),
            usage: Self::usage(),
            stop_reason: Some("end_turn".to_string()),
        }
    }

    fn usage() -> TokenUsage {
        TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, MagpieError> {
        self.requests.lock().await.push(request);
        let response = self
            .responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Self::text_response("mock response"));
        Ok(response)
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }
}
