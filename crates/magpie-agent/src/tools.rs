// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Orchestration tools the kernel registers itself: `spawn`,
//! `subagent_control`, `message`, and `use_skill`.
//!
//! Concrete work tools (files, shell, web) live outside the kernel and
//! are registered by the host.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use magpie_bus::MessageBus;
use magpie_core::{MagpieError, OutboundMessage};
use magpie_skill::SkillsRegistry;
use magpie_tools::{ExecutionContext, Tool};

use crate::subagent::{Origin, SubagentManager};

/// Delegates a task to a background subagent.
pub struct SpawnTool {
    manager: Arc<SubagentManager>,
}

impl SpawnTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Delegate a task to a background subagent. The subagent runs independently \
         and reports back when it completes."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Description of the task for the subagent"
                },
                "label": {
                    "type": "string",
                    "description": "Short display label for progress updates"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> Result<String, MagpieError> {
        let task = args["task"]
            .as_str()
            .ok_or_else(|| MagpieError::Validation("spawn: missing 'task'".to_string()))?;
        let label = args["label"].as_str();

        let origin = Origin {
            channel: ctx.channel.clone(),
            chat_id: ctx.chat_id.clone(),
        };
        match self.manager.spawn(task, label, origin) {
            Ok(id) => Ok(format!(
                "Background task started (id: {id}). You'll be notified when it completes."
            )),
            // A full pool is a user-visible refusal, not a tool crash.
            Err(MagpieError::Resource(msg)) => Ok(format!("Error: {msg}")),
            Err(e) => Err(e),
        }
    }
}

/// Lists or cancels background subagents.
pub struct SubagentControlTool {
    manager: Arc<SubagentManager>,
}

impl SubagentControlTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SubagentControlTool {
    fn name(&self) -> &str {
        "subagent_control"
    }

    fn description(&self) -> &str {
        "List running background tasks or cancel one by id."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "description": "Either 'list' or 'cancel'"
                },
                "task_id": {
                    "type": "string",
                    "description": "Task id to cancel (required for 'cancel')"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> Result<String, MagpieError> {
        let action = args["action"].as_str().unwrap_or_default();
        match action {
            "list" => {
                let tasks = self.manager.list();
                if tasks.is_empty() {
                    return Ok("No background tasks are running.".to_string());
                }
                let lines: Vec<String> = tasks
                    .iter()
                    .map(|t| {
                        format!(
                            "- [{}] {} ({}, started {})",
                            t.id,
                            t.label,
                            t.status.as_str(),
                            t.started_at.format("%H:%M:%S")
                        )
                    })
                    .collect();
                Ok(lines.join("\n"))
            }
            "cancel" => {
                let task_id = args["task_id"].as_str().ok_or_else(|| {
                    MagpieError::Validation("subagent_control: 'cancel' requires 'task_id'".to_string())
                })?;
                if self.manager.cancel(task_id) {
                    Ok(format!("Cancelled background task {task_id}."))
                } else {
                    Ok(format!("Error: no running task with id {task_id}."))
                }
            }
            other => Err(MagpieError::Validation(format!(
                "subagent_control: unknown action '{other}'"
            ))),
        }
    }
}

/// Sends a message to a chat channel through the bus.
///
/// Channel and chat default to where the triggering message came from.
pub struct MessageTool {
    bus: MessageBus,
}

impl MessageTool {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to a chat channel. Defaults to the current conversation; \
         set 'channel' and 'chat_id' to reach a different one."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "Message text" },
                "channel": { "type": "string", "description": "Target channel name" },
                "chat_id": { "type": "string", "description": "Target chat id" }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> Result<String, MagpieError> {
        let content = args["content"]
            .as_str()
            .ok_or_else(|| MagpieError::Validation("message: missing 'content'".to_string()))?;
        let channel = args["channel"].as_str().unwrap_or(&ctx.channel);
        let chat_id = args["chat_id"].as_str().unwrap_or(&ctx.chat_id);

        self.bus
            .publish_outbound(OutboundMessage::new(channel, chat_id, content))
            .await?;
        Ok(format!("Message sent to {channel}:{chat_id}."))
    }
}

/// Loads a skill's full instructions into the conversation.
///
/// The system prompt only carries the skills summary; when the model
/// decides a skill applies, this tool discloses the complete SKILL.md
/// body as a tool result.
pub struct UseSkillTool {
    skills: Arc<SkillsRegistry>,
}

impl UseSkillTool {
    pub fn new(skills: Arc<SkillsRegistry>) -> Self {
        Self { skills }
    }
}

#[async_trait]
impl Tool for UseSkillTool {
    fn name(&self) -> &str {
        "use_skill"
    }

    fn description(&self) -> &str {
        "Load the full instructions of a skill by name. Use this before \
         performing a task a listed skill covers."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Skill name from the skills listing"
                }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> Result<String, MagpieError> {
        let name = args["name"]
            .as_str()
            .ok_or_else(|| MagpieError::Validation("use_skill: missing 'name'".to_string()))?;

        match self.skills.load(name) {
            Ok(body) => Ok(format!("## Skill: {name}\n\n{body}")),
            Err(_) => {
                let available: Vec<String> =
                    self.skills.list().into_iter().map(|s| s.name).collect();
                Ok(format!(
                    "Error: unknown skill '{name}'. Available skills: {}",
                    if available.is_empty() {
                        "(none installed)".to_string()
                    } else {
                        available.join(", ")
                    }
                ))
            }
        }
    }
}
