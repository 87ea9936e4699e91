// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Assembles the message list for each LLM call.
//!
//! The system prompt is built from an identity section, workspace
//! bootstrap files, retrieved memory, and the skills summary -- each
//! bounded by its own character budget. History is truncated from the
//! front (never reordered); the current message carries any media that
//! passes the size cap.

pub mod media;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use chrono::Utc;
use tracing::debug;

use magpie_config::ContextConfig;
use magpie_core::{
    ChatContent, ChatMessage, ContentPart, MagpieError, MediaDescriptor, Turn, TurnRole,
};
use magpie_memory::{MemoryIndex, MemoryScope, NoteStore};
use magpie_skill::SkillsRegistry;

pub use media::attach_media;

/// Workspace files folded into the system prompt, in order.
const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];

/// Memory results per scope when several scopes are searched.
const PER_SCOPE_HITS_SHARED: usize = 6;
/// Memory results when only one scope is searched.
const PER_SCOPE_HITS_SINGLE: usize = 10;
/// Retrieved chunks are flattened to single lines capped at this length.
const MEMORY_LINE_MAX_CHARS: usize = 400;

pub struct ContextBuilder {
    workspace: PathBuf,
    notes: NoteStore,
    index: MemoryIndex,
    skills: Arc<SkillsRegistry>,
    config: ContextConfig,
    agent_name: String,
    bootstrap_cache: Mutex<Option<(Vec<(PathBuf, Option<SystemTime>)>, String)>>,
}

impl ContextBuilder {
    /// `skills` is shared with the `use_skill` tool, which loads full
    /// skill bodies on demand while this builder only lists them.
    pub fn new(
        workspace: impl Into<PathBuf>,
        notes: NoteStore,
        index: MemoryIndex,
        skills: Arc<SkillsRegistry>,
        config: ContextConfig,
        agent_name: &str,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            notes,
            index,
            skills,
            config,
            agent_name: agent_name.to_string(),
            bootstrap_cache: Mutex::new(None),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn notes(&self) -> &NoteStore {
        &self.notes
    }

    /// Build the full message list: system prompt, trimmed history, and
    /// the current message with media attached.
    pub async fn build_messages(
        &self,
        history: &[Turn],
        current_text: &str,
        media: &[MediaDescriptor],
        scope: &MemoryScope,
    ) -> Result<Vec<ChatMessage>, MagpieError> {
        let mut messages = Vec::new();

        let system = self.build_system_prompt(current_text, history, scope).await?;
        messages.push(ChatMessage::system(system));

        messages.extend(self.trim_history(history));

        let (content, notes) = attach_media(
            &self.workspace,
            current_text,
            media,
            self.config.media_max_bytes,
        );
        let text = if notes.is_empty() {
            current_text.to_string()
        } else {
            format!("{current_text}\n{}", notes.join("\n"))
        };
        messages.push(match content {
            Some(parts) => ChatMessage {
                role: "user".to_string(),
                content: ChatContent::Parts(
                    std::iter::once(ContentPart::Text { text })
                        .chain(parts)
                        .collect(),
                ),
                tool_calls: Vec::new(),
                tool_call_id: None,
                name: None,
            },
            None => ChatMessage::user(text),
        });

        Ok(messages)
    }

    async fn build_system_prompt(
        &self,
        current_text: &str,
        history: &[Turn],
        scope: &MemoryScope,
    ) -> Result<String, MagpieError> {
        let mut parts = vec![self.identity_section(scope)];

        let bootstrap = self.bootstrap_section();
        if !bootstrap.is_empty() {
            parts.push(bootstrap);
        }

        let memory = self.memory_section(current_text, history, scope).await?;
        if !memory.is_empty() {
            parts.push(memory);
        }

        let skills = self.skills_section();
        if !skills.is_empty() {
            parts.push(skills);
        }

        Ok(parts.join("\n\n---\n\n"))
    }

    fn identity_section(&self, scope: &MemoryScope) -> String {
        let now = Utc::now().format("%Y-%m-%d %H:%M (%A)");
        let workspace = self.workspace.display();
        let memory_file = self.notes.memory_file(scope);
        let today_file = self.notes.today_file(scope);
        format!(
            "# {name}\n\n\
             You are {name}, an autonomous personal assistant. When a user asks you to \
             do something, use your tools to do it directly; report results, not \
             procedures. Be concise.\n\n\
             For work that needs more than a couple of tool calls, delegate with the \
             `spawn` tool and reply immediately; the background task reports back when \
             it finishes.\n\n\
             ## Current Time\n{now}\n\n\
             ## Workspace\n\
             Your workspace is at: {workspace}\n\
             - Active memory scope: {scope_label}\n\
             - Memory file: {memory_file}\n\
             - Daily notes: {today_file}\n\n\
             ## Memory\n\
             When remembering something important, write to the memory file above.",
            name = self.agent_name,
            scope_label = scope.label(),
            memory_file = memory_file.display(),
            today_file = today_file.display(),
        )
    }

    /// Bootstrap files, head-truncated, cached by mtime signature.
    fn bootstrap_section(&self) -> String {
        let signature: Vec<(PathBuf, Option<SystemTime>)> = BOOTSTRAP_FILES
            .iter()
            .map(|f| {
                let path = self.workspace.join(f);
                let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
                (path, mtime)
            })
            .collect();

        {
            let cache = self.bootstrap_cache.lock().expect("bootstrap cache poisoned");
            if let Some((cached_sig, text)) = cache.as_ref()
                && *cached_sig == signature
            {
                return text.clone();
            }
        }

        let mut parts = Vec::new();
        for filename in BOOTSTRAP_FILES {
            let path = self.workspace.join(filename);
            if let Ok(content) = std::fs::read_to_string(&path) {
                parts.push(format!("## {filename}\n\n{content}"));
            }
        }
        // Keep the head: critical instructions live at the top of these
        // files and must not fall off as they grow.
        let text = truncate_head(
            &parts.join("\n\n"),
            self.config.bootstrap_max_chars,
            "bootstrap",
        );

        *self.bootstrap_cache.lock().expect("bootstrap cache poisoned") =
            Some((signature, text.clone()));
        text
    }

    /// Retrieved memory for the active scope plus global, de-duplicated.
    async fn memory_section(
        &self,
        current_text: &str,
        history: &[Turn],
        scope: &MemoryScope,
    ) -> Result<String, MagpieError> {
        // Query from the current message and recent user turns.
        let mut query_parts = vec![current_text.to_string()];
        for turn in history.iter().rev().take(10) {
            if turn.role == TurnRole::User && !turn.content.is_empty() {
                query_parts.push(turn.content.clone());
            }
        }
        let query = query_parts.join("\n");
        if query.trim().is_empty() {
            return Ok(String::new());
        }

        let mut scopes = vec![MemoryScope::Global];
        if *scope != MemoryScope::Global {
            scopes.push(scope.clone());
        }
        let k = if scopes.len() > 1 {
            PER_SCOPE_HITS_SHARED
        } else {
            PER_SCOPE_HITS_SINGLE
        };

        let mut hits = Vec::new();
        for s in &scopes {
            hits.extend(self.index.retrieve(&self.notes, s, &query, k).await?);
        }

        let mut seen = std::collections::HashSet::new();
        let mut lines = Vec::new();
        for hit in hits {
            let flattened = hit.content.trim().replace('\n', " ");
            if flattened.is_empty() || !seen.insert(flattened.clone()) {
                continue;
            }
            let capped: String = flattened.chars().take(MEMORY_LINE_MAX_CHARS).collect();
            lines.push(format!("- {capped}"));
        }

        if lines.is_empty() {
            debug!("memory retrieval: no hits");
            return Ok(String::new());
        }
        debug!(hits = lines.len(), "memory retrieval");

        let text = format!("# Memory (Retrieved)\n\n{}", lines.join("\n"));
        Ok(truncate_tail(&text, self.config.memory_max_chars, "memory"))
    }

    fn skills_section(&self) -> String {
        let summary = self.skills.summary();
        if summary.is_empty() {
            return String::new();
        }
        let text = format!(
            "# Skills\n\nThe following skills extend your capabilities. To use one, \
             load its full instructions with the use_skill tool.\n\n{summary}"
        );
        truncate_tail(&text, self.config.skills_max_chars, "skills")
    }

    /// Drop the oldest turns until the concatenated size fits the history
    /// budget. Order is never changed; a synthetic note records the drop.
    fn trim_history(&self, history: &[Turn]) -> Vec<ChatMessage> {
        let budget = self.config.history_max_chars;
        let mut total: usize = history.iter().map(|t| t.content.len()).sum();

        let mut start = 0;
        while start < history.len() && total > budget {
            total -= history[start].content.len();
            start += 1;
        }

        let mut messages = Vec::new();
        if start > 0 {
            debug!(dropped = start, remaining = history.len() - start, "history trimmed");
            messages.push(ChatMessage::user(format!(
                "[System note: {start} earlier message(s) were omitted because the \
                 conversation exceeded the context budget. Focus on the remaining \
                 messages.]"
            )));
        }
        for turn in &history[start..] {
            messages.push(match turn.role {
                TurnRole::User => ChatMessage::user(turn.content.clone()),
                TurnRole::Assistant => ChatMessage::assistant(turn.content.clone()),
                TurnRole::System => ChatMessage::system(turn.content.clone()),
            });
        }
        messages
    }
}

fn truncate_head(text: &str, max_chars: usize, label: &str) -> String {
    if max_chars == 0 {
        return String::new();
    }
    if text.len() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("[truncated {label} to first {max_chars} chars]\n{kept}")
}

fn truncate_tail(text: &str, max_chars: usize, label: &str) -> String {
    if max_chars == 0 {
        return String::new();
    }
    if text.len() <= max_chars {
        return text.to_string();
    }
    let chars: Vec<char> = text.chars().collect();
    let kept: String = chars[chars.len().saturating_sub(max_chars)..].iter().collect();
    format!("[truncated {label} to last {max_chars} chars]\n{kept}")
}
