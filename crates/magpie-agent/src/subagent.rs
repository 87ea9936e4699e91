// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Background subagent execution.
//!
//! Subagents are bounded background agent loops spawned by the `spawn`
//! tool. Each one runs with its own tool registry (no `spawn` -- a single
//! level of delegation), an iteration cap, and a wall-clock timeout. On
//! finish it posts a `role = system` inbound message carrying a truncated
//! result; the main agent summarizes that for the origin chat.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use magpie_bus::MessageBus;
use magpie_config::SubagentConfig;
use magpie_core::{
    ChatMessage, ChatRequest, InboundMessage, LlmProvider, MagpieError, MessageRole,
    OutboundMessage, RetryConfig,
};
use magpie_tools::{ExecutionContext, ToolRegistry, is_tool_error};

/// Where a subagent's report goes.
#[derive(Debug, Clone)]
pub struct Origin {
    pub channel: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentStatus {
    Running,
    Done,
    Failed,
    Cancelled,
}

impl SubagentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubagentStatus::Running => "running",
            SubagentStatus::Done => "done",
            SubagentStatus::Failed => "failed",
            SubagentStatus::Cancelled => "cancelled",
        }
    }
}

/// Metadata for one background task.
#[derive(Debug, Clone)]
pub struct SubagentTask {
    pub id: String,
    pub label: String,
    pub prompt: String,
    pub origin_channel: String,
    pub origin_chat_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SubagentStatus,
    pub result: Option<String>,
}

/// Completed task metadata kept for inspection before pruning.
const MAX_COMPLETED_TASKS: usize = 50;
/// Consecutive fully-failed tool batches a subagent tolerates.
const TOOL_ERROR_BACKOFF: u32 = 3;

struct RunningHandle {
    cancel: CancellationToken,
}

/// Bounded pool of background agent loops.
pub struct SubagentManager {
    provider: Arc<dyn LlmProvider>,
    bus: MessageBus,
    tools: Arc<ToolRegistry>,
    config: SubagentConfig,
    model: String,
    max_tokens: u32,
    running: DashMap<String, RunningHandle>,
    meta: Mutex<HashMap<String, SubagentTask>>,
    tracker: TaskTracker,
}

impl SubagentManager {
    /// `tools` is the subagent-facing registry: the caller builds it
    /// without the `spawn` tool so delegation stays single-level.
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        bus: MessageBus,
        tools: Arc<ToolRegistry>,
        config: SubagentConfig,
        model: String,
        max_tokens: u32,
    ) -> Self {
        Self {
            provider,
            bus,
            tools,
            config,
            model,
            max_tokens,
            running: DashMap::new(),
            meta: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Spawn a background task. Refuses with a `Resource` error at the
    /// concurrency cap.
    pub fn spawn(
        self: &Arc<Self>,
        prompt: &str,
        label: Option<&str>,
        origin: Origin,
    ) -> Result<String, MagpieError> {
        if self.running.len() >= self.config.max_concurrent {
            return Err(MagpieError::Resource(format!(
                "busy: {} background tasks already running (cap {})",
                self.running.len(),
                self.config.max_concurrent
            )));
        }

        let id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let label = label
            .map(str::to_string)
            .unwrap_or_else(|| default_label(prompt));

        let task = SubagentTask {
            id: id.clone(),
            label: label.clone(),
            prompt: prompt.to_string(),
            origin_channel: origin.channel.clone(),
            origin_chat_id: origin.chat_id.clone(),
            started_at: Utc::now(),
            finished_at: None,
            status: SubagentStatus::Running,
            result: None,
        };
        self.meta
            .lock()
            .expect("subagent meta poisoned")
            .insert(id.clone(), task);

        let cancel = CancellationToken::new();
        self.running.insert(
            id.clone(),
            RunningHandle {
                cancel: cancel.clone(),
            },
        );

        let manager = Arc::clone(self);
        let prompt = prompt.to_string();
        let task_id = id.clone();
        self.tracker.spawn(async move {
            manager
                .run_subagent(task_id, prompt, label, origin, cancel)
                .await;
        });

        info!(id = id.as_str(), "subagent spawned");
        Ok(id)
    }

    /// Currently running tasks.
    pub fn list(&self) -> Vec<SubagentTask> {
        let meta = self.meta.lock().expect("subagent meta poisoned");
        self.running
            .iter()
            .filter_map(|entry| meta.get(entry.key()).cloned())
            .collect()
    }

    /// All known tasks, including completed ones not yet pruned.
    pub fn list_all(&self) -> Vec<SubagentTask> {
        self.meta
            .lock()
            .expect("subagent meta poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<SubagentTask> {
        self.meta
            .lock()
            .expect("subagent meta poisoned")
            .get(id)
            .cloned()
    }

    /// Cancel a running task. Returns whether a running task was found.
    pub fn cancel(&self, id: &str) -> bool {
        match self.running.get(id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything and wait for task teardown.
    pub async fn shutdown(&self) {
        for entry in self.running.iter() {
            entry.value().cancel.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn run_subagent(
        self: Arc<Self>,
        id: String,
        prompt: String,
        label: String,
        origin: Origin,
        cancel: CancellationToken,
    ) {
        debug!(id = id.as_str(), label = label.as_str(), "subagent starting");

        let progress_stop = CancellationToken::new();
        if self.config.progress_interval_secs > 0 {
            let bus = self.bus.clone();
            let origin = origin.clone();
            let label = label.clone();
            let stop = progress_stop.clone();
            let interval_secs = self.config.progress_interval_secs;
            tokio::spawn(async move {
                progress_loop(bus, origin, label, interval_secs, stop).await;
            });
        }

        let timeout = Duration::from_secs(self.config.timeout_secs.max(1));
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Outcome::Cancelled,
            result = tokio::time::timeout(timeout, self.tool_loop(&prompt, &origin, &cancel)) => {
                match result {
                    Ok(Ok(text)) => Outcome::Done(text),
                    Ok(Err(e)) => Outcome::Failed(format!("Error: {e}")),
                    Err(_) => Outcome::Failed(format!(
                        "Error: background task timed out after {}s",
                        timeout.as_secs()
                    )),
                }
            }
        };
        progress_stop.cancel();

        let (status, result_text) = match outcome {
            Outcome::Done(text) => {
                info!(id = id.as_str(), "subagent completed");
                (SubagentStatus::Done, text)
            }
            Outcome::Failed(message) => {
                warn!(id = id.as_str(), error = message.as_str(), "subagent failed");
                (SubagentStatus::Failed, message)
            }
            Outcome::Cancelled => {
                info!(id = id.as_str(), "subagent cancelled");
                (SubagentStatus::Cancelled, "Task was cancelled.".to_string())
            }
        };

        let truncated = truncate_with_marker(&result_text, self.config.result_max_chars);
        {
            let mut meta = self.meta.lock().expect("subagent meta poisoned");
            if let Some(task) = meta.get_mut(&id) {
                task.status = status;
                task.finished_at = Some(Utc::now());
                task.result = Some(truncated.clone());
            }
        }
        self.running.remove(&id);
        self.prune_completed();

        self.announce(&id, &label, &prompt, &truncated, &origin, status)
            .await;
    }

    /// The subagent's own tool loop: bounded iterations, no session.
    async fn tool_loop(
        &self,
        prompt: &str,
        origin: &Origin,
        cancel: &CancellationToken,
    ) -> Result<String, MagpieError> {
        let mut messages = vec![
            ChatMessage::system(self.subagent_prompt(prompt)),
            ChatMessage::user(prompt.to_string()),
        ];
        let tool_defs = self.tools.describe();
        let exec_ctx = ExecutionContext::new(&origin.channel, &origin.chat_id, cancel.clone());

        let mut error_streak = 0u32;
        let mut nudged = false;
        let max_iterations = self.config.max_iterations.max(1);

        for iteration in 1..=max_iterations {
            let response = self
                .provider
                .chat_with_retry(
                    ChatRequest {
                        messages: messages.clone(),
                        tools: Some(tool_defs.clone()),
                        model: self.model.clone(),
                        max_tokens: self.max_tokens,
                        temperature: 0.0,
                    },
                    RetryConfig::default(),
                )
                .await?;

            if response.has_tool_calls() {
                let calls = response.tool_calls.clone();
                messages.push(ChatMessage::assistant_with_calls(response.content, calls.clone()));

                let results = self.tools.execute_batch(&calls, &exec_ctx).await;
                let any_ok = results.iter().any(|r| !is_tool_error(r));
                for (call, result) in calls.iter().zip(results.iter()) {
                    debug!(tool = call.name.as_str(), iteration, "subagent tool executed");
                    messages.push(ChatMessage::tool_result(&call.id, &call.name, result.clone()));
                }

                if any_ok {
                    error_streak = 0;
                } else {
                    error_streak += 1;
                    if error_streak >= TOOL_ERROR_BACKOFF {
                        return Ok("Task aborted: too many consecutive tool errors.".to_string());
                    }
                }
                continue;
            }

            match response.content {
                Some(content) if !content.trim().is_empty() => return Ok(content),
                _ if !nudged && iteration < max_iterations => {
                    // Some models return empty content when they consider
                    // the task done; nudge once for a text summary.
                    nudged = true;
                    messages.push(ChatMessage::user(
                        "Please reply with a brief summary of what you did.".to_string(),
                    ));
                }
                _ => break,
            }
        }

        Ok(format!(
            "Task completed but no final response was generated (reached {max_iterations} iterations)."
        ))
    }

    fn subagent_prompt(&self, task: &str) -> String {
        let now = Utc::now().format("%Y-%m-%d %H:%M (%A)");
        format!(
            "# Background Task\n\n\
             You are a background task runner spawned by the main agent to complete a \
             specific task.\n\n\
             Current time: {now}\n\n\
             ## Your Task\n{task}\n\n\
             ## Rules\n\
             1. Stay focused. Complete only the assigned task, nothing else.\n\
             2. Your final response is reported back to the main agent.\n\
             3. Do not initiate conversations or take on side tasks.\n\
             4. Be concise but informative in your findings.\n\n\
             ## What You Cannot Do\n\
             - Send messages directly to users\n\
             - Spawn further background tasks\n\n\
             When you have completed the task, provide a clear summary of your findings \
             or actions."
        )
    }

    /// Post the result back to the main agent as a system message.
    async fn announce(
        &self,
        id: &str,
        label: &str,
        prompt: &str,
        result: &str,
        origin: &Origin,
        status: SubagentStatus,
    ) {
        let status_text = if status == SubagentStatus::Done {
            "completed successfully"
        } else {
            "failed"
        };
        let content = format!(
            "[Background task '{label}' {status_text}]\n\n\
             Task: {prompt}\n\n\
             Result:\n{result}\n\n\
             Summarize this naturally for the user. Keep it brief (1-2 sentences). \
             Do not mention internal task ids."
        );

        let msg = InboundMessage {
            id: uuid::Uuid::new_v4().to_string(),
            channel: origin.channel.clone(),
            sender_id: format!("subagent:{id}"),
            chat_id: origin.chat_id.clone(),
            role: MessageRole::System,
            content,
            media: Vec::new(),
            metadata: std::collections::HashMap::new(),
        };

        if let Err(e) = self.bus.publish_inbound(msg).await {
            warn!(id, error = %e, "failed to announce subagent result");
        } else {
            debug!(id, origin = origin.channel.as_str(), "subagent result announced");
        }
    }

    fn prune_completed(&self) {
        let mut meta = self.meta.lock().expect("subagent meta poisoned");
        let mut completed: Vec<(String, DateTime<Utc>)> = meta
            .values()
            .filter(|t| t.status != SubagentStatus::Running)
            .map(|t| (t.id.clone(), t.finished_at.unwrap_or(t.started_at)))
            .collect();
        if completed.len() <= MAX_COMPLETED_TASKS {
            return;
        }
        completed.sort_by_key(|(_, finished)| *finished);
        let excess = completed.len() - MAX_COMPLETED_TASKS;
        for (id, _) in completed.into_iter().take(excess) {
            meta.remove(&id);
        }
    }
}

enum Outcome {
    Done(String),
    Failed(String),
    Cancelled,
}

fn default_label(prompt: &str) -> String {
    let mut label: String = prompt.chars().take(30).collect();
    if prompt.chars().count() > 30 {
        label.push_str("...");
    }
    label
}

/// Cap a result string, appending a marker when content was dropped.
pub fn truncate_with_marker(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n[truncated]")
}

async fn progress_loop(
    bus: MessageBus,
    origin: Origin,
    label: String,
    interval_secs: u64,
    stop: CancellationToken,
) {
    let started = tokio::time::Instant::now();
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    interval.tick().await; // skip the immediate first tick
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = interval.tick() => {
                let elapsed = started.elapsed().as_secs();
                let minutes = elapsed / 60;
                let seconds = elapsed % 60;
                let elapsed_text = if minutes > 0 {
                    format!("{minutes}m {seconds}s")
                } else {
                    format!("{seconds}s")
                };
                let msg = OutboundMessage::status(
                    &origin.channel,
                    &origin.chat_id,
                    &format!("Background task '{label}' still running ({elapsed_text})."),
                );
                if bus.publish_outbound(msg).await.is_err() {
                    return;
                }
            }
        }
    }
}
