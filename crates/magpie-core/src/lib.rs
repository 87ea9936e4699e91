// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core types, errors, and adapter traits for the Magpie agent kernel.
//!
//! Everything the subsystem crates share lives here: the message shapes
//! that flow through the bus, the session record types, the error enum,
//! and the [`LlmProvider`] trait the agent loop calls into.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{MagpieError, ProviderErrorKind};
pub use traits::provider::{
    ChatContent, ChatMessage, ChatRequest, ChatResponse, ContentPart, LlmProvider, RetryConfig,
    ToolCallRequest, ToolDefinition,
};
pub use types::{
    InboundMessage, MediaDescriptor, MessageRole, OutboundMessage, SessionSettings, TokenUsage,
    Turn, TurnRole, Verbosity,
};
