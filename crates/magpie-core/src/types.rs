// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types shared across the Magpie agent kernel.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Role of an inbound message entering the kernel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// A message from a human on a chat channel.
    #[default]
    User,
    /// A kernel-internal message (subagent report) routed to a session.
    System,
}

/// Role of a persisted conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

/// A media attachment referenced by path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    /// Workspace-relative when possible; absolute paths outside the
    /// workspace are preserved verbatim.
    pub path: String,
    /// MIME type, e.g. "image/png".
    pub mime: String,
    /// Whether the attachment should be rendered inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<bool>,
}

/// An inbound message received from a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Stable message identifier.
    pub id: String,
    /// Name of the originating channel ("telegram", "webui", ...).
    pub channel: String,
    /// Sender identifier within the channel.
    pub sender_id: String,
    /// Chat/conversation identifier within the channel.
    pub chat_id: String,
    #[serde(default)]
    pub role: MessageRole,
    /// Text content.
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaDescriptor>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InboundMessage {
    /// Create a plain user message with a fresh id.
    pub fn user(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            id: uuid_string(),
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            role: MessageRole::User,
            content: content.to_string(),
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Derive the session key used for ordering and persistence.
    ///
    /// A `session_key` metadata override is honored only when the channel
    /// is flagged trusted; otherwise the key is `<channel>:<chat_id>`.
    pub fn session_key(&self, trusted: bool) -> String {
        if trusted
            && let Some(v) = self.metadata.get("session_key")
            && let Some(key) = v.as_str()
            && !key.is_empty()
        {
            return key.to_string();
        }
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// An outbound message to be delivered by a channel adapter.
///
/// Emitted only through the message bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OutboundMessage {
    pub fn new(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            metadata: HashMap::new(),
        }
    }

    /// A progress update (`metadata.type = "status"`); channels may render
    /// these as ephemeral indicators instead of chat messages.
    pub fn status(channel: &str, chat_id: &str, content: &str) -> Self {
        let mut msg = Self::new(channel, chat_id, content);
        msg.metadata
            .insert("type".to_string(), serde_json::Value::from("status"));
        msg
    }

    pub fn is_status(&self) -> bool {
        self.metadata.get("type").and_then(|v| v.as_str()) == Some("status")
    }
}

/// One persisted conversation turn (a session record line).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    /// UTC ISO-8601 timestamp.
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaDescriptor>,
}

impl Turn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            ts: Utc::now(),
            media: Vec::new(),
        }
    }

    pub fn with_media(mut self, media: Vec<MediaDescriptor>) -> Self {
        self.media = media;
        self
    }
}

/// Status-update cadence for a session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Low,
    #[default]
    Normal,
    High,
}

impl Verbosity {
    /// Minimum seconds between status outbounds at this verbosity.
    pub fn status_interval_secs(self) -> f64 {
        match self {
            Verbosity::Low => 5.0,
            Verbosity::Normal => 2.0,
            Verbosity::High => 0.8,
        }
    }
}

/// Mutable per-session settings, persisted last-writer-wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    /// Model override for this conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub verbosity: Verbosity,
    /// Whether tools may touch paths outside the workspace. Changing this
    /// is gated by admin config; see the agent loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrict_workspace: Option<bool>,
    /// Sender that last interacted with the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

fn uuid_string() -> String {
    // uuid is not a magpie-core dependency; derive a unique-enough id from
    // the clock and a random suffix. Callers that need real UUIDs set `id`
    // themselves.
    format!(
        "{}-{:08x}",
        Utc::now().timestamp_micros(),
        fastrand::u32(..)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_defaults_to_channel_and_chat() {
        let msg = InboundMessage::user("telegram", "alice", "42", "hi");
        assert_eq!(msg.session_key(false), "telegram:42");
        assert_eq!(msg.session_key(true), "telegram:42");
    }

    #[test]
    fn session_key_override_requires_trust() {
        let mut msg = InboundMessage::user("webui", "local", "main", "hi");
        msg.metadata.insert(
            "session_key".to_string(),
            serde_json::Value::from("webui:pinned"),
        );
        assert_eq!(msg.session_key(true), "webui:pinned");
        assert_eq!(msg.session_key(false), "webui:main");
    }

    #[test]
    fn empty_override_is_ignored() {
        let mut msg = InboundMessage::user("webui", "local", "main", "hi");
        msg.metadata
            .insert("session_key".to_string(), serde_json::Value::from(""));
        assert_eq!(msg.session_key(true), "webui:main");
    }

    #[test]
    fn status_metadata_round_trip() {
        let msg = OutboundMessage::status("telegram", "42", "Working on it...");
        assert!(msg.is_status());
        let plain = OutboundMessage::new("telegram", "42", "done");
        assert!(!plain.is_status());
    }

    #[test]
    fn turn_serializes_without_empty_media() {
        let turn = Turn::new(TurnRole::User, "hello");
        let json = serde_json::to_string(&turn).unwrap();
        assert!(json.contains(r#""role":"user""#));
        assert!(!json.contains("media"));
    }

    #[test]
    fn verbosity_intervals_are_ordered() {
        assert!(
            Verbosity::High.status_interval_secs() < Verbosity::Normal.status_interval_secs()
        );
        assert!(
            Verbosity::Normal.status_interval_secs() < Verbosity::Low.status_interval_secs()
        );
    }
}
