// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The agent loop: per-session ordering scheduler and LLM tool loop.
//!
//! `run` is the single admission point for user messages. Messages
//! sharing a session key execute in submission order through a per-session
//! tail chain; distinct sessions proceed in parallel up to the global
//! admission semaphore. Handlers waiting on a tail release their permit so
//! queued same-session work never starves other sessions.
//!
//! Subagent reports arrive as `role = system` messages and take a separate
//! summarization path that never enters the tool loop.

pub mod shutdown;
pub mod subagent;
pub mod tools;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use magpie_bus::MessageBus;
use magpie_config::MagpieConfig;
use magpie_context::ContextBuilder;
use magpie_core::{
    ChatMessage, ChatRequest, InboundMessage, LlmProvider, MagpieError, MessageRole,
    OutboundMessage, RetryConfig, SessionSettings, ToolCallRequest, Turn, TurnRole, Verbosity,
};
use magpie_memory::MemoryScope;
use magpie_session::SessionStore;
use magpie_tools::{ExecutionContext, ToolRegistry, is_tool_error};

pub use subagent::{Origin, SubagentManager, SubagentStatus, SubagentTask};
pub use tools::{MessageTool, SpawnTool, SubagentControlTool, UseSkillTool};

/// Characters of the last tool error quoted in the backoff reply.
const ERROR_EXCERPT_MAX_CHARS: usize = 200;

/// Per-session serialization point.
#[derive(Default)]
struct TailSlot {
    generation: u64,
    rx: Option<oneshot::Receiver<()>>,
}

pub struct AgentLoop {
    bus: MessageBus,
    provider: Arc<dyn LlmProvider>,
    sessions: Arc<SessionStore>,
    context: Arc<ContextBuilder>,
    tools: Arc<ToolRegistry>,
    config: Arc<MagpieConfig>,
    semaphore: Arc<Semaphore>,
    tails: Mutex<HashMap<String, TailSlot>>,
    tracker: TaskTracker,
    aborts: Mutex<Vec<tokio::task::AbortHandle>>,
    cancel: CancellationToken,
}

impl AgentLoop {
    pub fn new(
        bus: MessageBus,
        provider: Arc<dyn LlmProvider>,
        sessions: Arc<SessionStore>,
        context: Arc<ContextBuilder>,
        tools: Arc<ToolRegistry>,
        config: Arc<MagpieConfig>,
        cancel: CancellationToken,
    ) -> Self {
        let max_concurrent = config.agent.max_concurrent_messages.max(1);
        Self {
            bus,
            provider,
            sessions,
            context,
            tools,
            config,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            tails: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            aborts: Mutex::new(Vec::new()),
            cancel,
        }
    }

    /// Long-running consumer. Acquires an admission permit *before*
    /// advancing `next_inbound`, so under backlog the queue fills (and
    /// backpressures channels) instead of task memory.
    pub async fn run(self: &Arc<Self>) {
        info!("agent loop started");

        loop {
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => {
                    match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    }
                }
                _ = self.cancel.cancelled() => break,
            };

            let msg = tokio::select! {
                msg = self.bus.next_inbound() => msg,
                _ = self.cancel.cancelled() => {
                    drop(permit);
                    break;
                }
            };
            let Some(msg) = msg else { break };

            let trusted = self.config.channel_trusted(&msg.channel);
            let session_key = msg.session_key(trusted);
            debug!(
                channel = msg.channel.as_str(),
                sender_id = msg.sender_id.as_str(),
                session_key = session_key.as_str(),
                "inbound message queued"
            );

            // Attach downstream of the session tail. This runs in the
            // consumer (serialized), so tail order equals bus order.
            let (prev_rx, done_tx, my_gen) = {
                let mut tails = self.tails.lock().expect("tail map poisoned");
                let slot = tails.entry(session_key.clone()).or_default();
                slot.generation += 1;
                let my_gen = slot.generation;
                let prev_rx = slot.rx.take();
                let (tx, rx) = oneshot::channel();
                slot.rx = Some(rx);
                (prev_rx, tx, my_gen)
            };

            let agent = Arc::clone(self);
            let key = session_key.clone();
            let handle = self.tracker.spawn(async move {
                let mut permit = Some(permit);

                if let Some(prev) = prev_rx {
                    // Waiting our turn must not occupy the admission gate.
                    drop(permit.take());
                    debug!(session_key = key.as_str(), "waiting on session tail");
                    let _ = prev.await;
                    permit = tokio::select! {
                        p = agent.semaphore.clone().acquire_owned() => p.ok(),
                        _ = agent.cancel.cancelled() => None,
                    };
                }

                if permit.is_some() && !agent.cancel.is_cancelled() {
                    debug!(session_key = key.as_str(), "message admitted");
                    if let Err(e) = agent.process_message(&msg, &key).await {
                        error!(session_key = key.as_str(), error = %e, "message handling failed");
                        let _ = agent
                            .bus
                            .publish_outbound(OutboundMessage::new(
                                &msg.channel,
                                &msg.chat_id,
                                &format!("Sorry, I encountered an error: {e}"),
                            ))
                            .await;
                    }
                } else {
                    debug!(session_key = key.as_str(), "message cancelled before admission");
                }

                drop(permit);
                let _ = done_tx.send(());
                let mut tails = agent.tails.lock().expect("tail map poisoned");
                if tails
                    .get(&key)
                    .is_some_and(|slot| slot.generation == my_gen)
                {
                    tails.remove(&key);
                }
            });

            let mut aborts = self.aborts.lock().expect("abort list poisoned");
            aborts.retain(|h| !h.is_finished());
            aborts.push(handle.abort_handle());
        }

        info!("agent loop stopped");
    }

    /// Cancel the root, drain handlers within the grace period, then
    /// force-cancel whatever is left.
    pub async fn stop(&self) {
        info!("agent loop stopping");
        self.cancel.cancel();
        self.tracker.close();

        let grace = Duration::from_secs(self.config.agent.shutdown_grace_secs);
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                grace_secs = grace.as_secs(),
                "grace period elapsed, force-cancelling remaining handlers"
            );
            for handle in self.aborts.lock().expect("abort list poisoned").drain(..) {
                handle.abort();
            }
        }
    }

    async fn process_message(
        &self,
        msg: &InboundMessage,
        session_key: &str,
    ) -> Result<(), MagpieError> {
        match msg.role {
            MessageRole::System => self.process_system_message(msg, session_key).await,
            MessageRole::User => self.process_user_message(msg, session_key).await,
        }
    }

    async fn process_user_message(
        &self,
        msg: &InboundMessage,
        session_key: &str,
    ) -> Result<(), MagpieError> {
        info!(
            channel = msg.channel.as_str(),
            sender_id = msg.sender_id.as_str(),
            "processing message"
        );

        let trusted = self.config.channel_trusted(&msg.channel);
        let mut settings = self.sessions.load_settings(session_key).await?;
        if let Some(refusal) = self.apply_settings_overrides(msg, trusted, &mut settings) {
            self.bus
                .publish_outbound(OutboundMessage::new(&msg.channel, &msg.chat_id, &refusal))
                .await?;
            return Ok(());
        }
        settings.sender_id = Some(msg.sender_id.clone());
        if let Err(e) = self.sessions.save_settings(session_key, &settings).await {
            warn!(session_key, error = %e, "failed to persist session settings");
        }

        let session = self.sessions.load(session_key).await?;
        let scope = self.memory_scope_for(session_key, Some(msg));
        let messages = self
            .context
            .build_messages(
                session.recent_turns(self.config.session.history_turns),
                &msg.content,
                &msg.media,
                &scope,
            )
            .await?;

        // The user turn is persisted before the loop runs; a persistence
        // failure is surfaced but does not discard in-memory state.
        let mut session = session;
        session.add_turn(Turn::new(TurnRole::User, &msg.content).with_media(msg.media.clone()));
        if let Err(e) = self.sessions.save(&session).await {
            warn!(session_key, error = %e, "session save failed");
            self.bus
                .publish_outbound(OutboundMessage::new(
                    &msg.channel,
                    &msg.chat_id,
                    "Warning: I couldn't persist this conversation to disk.",
                ))
                .await?;
        }

        let reply = self
            .tool_loop(messages, &settings, &msg.channel, &msg.chat_id)
            .await;

        session.add_turn(Turn::new(TurnRole::Assistant, &reply));
        if let Err(e) = self.sessions.save(&session).await {
            warn!(session_key, error = %e, "session save failed after reply");
        }

        self.bus
            .publish_outbound(OutboundMessage::new(&msg.channel, &msg.chat_id, &reply))
            .await?;
        Ok(())
    }

    /// Subagent report: truncate, summarize with one lightweight LLM call
    /// (no tools), and deliver to the origin chat.
    async fn process_system_message(
        &self,
        msg: &InboundMessage,
        session_key: &str,
    ) -> Result<(), MagpieError> {
        info!(sender_id = msg.sender_id.as_str(), "processing system message");

        let payload =
            subagent::truncate_with_marker(&msg.content, self.config.subagent.result_max_chars);

        let request = ChatRequest {
            messages: vec![
                ChatMessage::system(
                    "You relay background task results to the user. Summarize the \
                     report below naturally in one or two sentences. Do not mention \
                     internal machinery.",
                ),
                ChatMessage::user(payload.clone()),
            ],
            tools: None,
            model: self.model_for(&SessionSettings::default()),
            max_tokens: self.config.agent.max_tokens,
            temperature: self.config.agent.temperature,
        };

        let summary = match self
            .provider
            .chat_with_retry(request, RetryConfig::default())
            .await
        {
            Ok(response) => response
                .content
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| "Background task completed.".to_string()),
            Err(e) => {
                warn!(error = %e, "summarizer call failed, relaying raw status");
                "A background task finished, but I couldn't summarize its result.".to_string()
            }
        };

        let mut session = self.sessions.load(session_key).await?;
        session.add_turn(Turn::new(
            TurnRole::System,
            format!("[{}] {payload}", msg.sender_id),
        ));
        session.add_turn(Turn::new(TurnRole::Assistant, &summary));
        if let Err(e) = self.sessions.save(&session).await {
            warn!(session_key, error = %e, "session save failed for system message");
        }

        self.bus
            .publish_outbound(OutboundMessage::new(&msg.channel, &msg.chat_id, &summary))
            .await?;
        Ok(())
    }

    /// Invoke the loop outside the bus (cron jobs, heartbeat, CLI). Reuses
    /// the same session, context, and tool machinery.
    pub async fn process_direct(
        &self,
        content: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
    ) -> Result<String, MagpieError> {
        let settings = self.sessions.load_settings(session_key).await?;
        let session = self.sessions.load(session_key).await?;
        let scope = self.memory_scope_for(session_key, None);
        let messages = self
            .context
            .build_messages(
                session.recent_turns(self.config.session.history_turns),
                content,
                &[],
                &scope,
            )
            .await?;

        let reply = self.tool_loop(messages, &settings, channel, chat_id).await;

        let mut session = session;
        session.add_turn(Turn::new(TurnRole::User, content));
        session.add_turn(Turn::new(TurnRole::Assistant, &reply));
        if let Err(e) = self.sessions.save(&session).await {
            warn!(session_key, error = %e, "session save failed in process_direct");
        }

        Ok(reply)
    }

    /// The LLM-driven tool loop. Always returns user-facing text.
    async fn tool_loop(
        &self,
        mut messages: Vec<ChatMessage>,
        settings: &SessionSettings,
        channel: &str,
        chat_id: &str,
    ) -> String {
        let model = self.model_for(settings);
        let tool_defs = self.tools.describe();
        let max_iterations = self.config.max_tool_iterations();
        let backoff = self.config.agent.tool_error_backoff.max(1);
        let exec_ctx = ExecutionContext::new(channel, chat_id, self.cancel.child_token());

        let mut error_streak = 0u32;
        let mut last_error = String::new();
        let mut nudged = false;
        let mut last_status: Option<tokio::time::Instant> = None;

        for iteration in 1..=max_iterations {
            let request = ChatRequest {
                messages: messages.clone(),
                tools: Some(tool_defs.clone()),
                model: model.clone(),
                max_tokens: self.config.agent.max_tokens,
                temperature: self.config.agent.temperature,
            };

            let response = match self
                .provider
                .chat_with_retry(request, RetryConfig::default())
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    let error_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
                    error!(error_id = error_id.as_str(), error = %e, "LLM call failed");
                    return format!(
                        "Sorry, I ran into a problem reaching the language model \
                         (error id {error_id}). Please try again."
                    );
                }
            };

            if response.has_tool_calls() {
                let calls = response.tool_calls.clone();
                last_status = self
                    .maybe_emit_tool_status(channel, chat_id, &calls, settings.verbosity, last_status)
                    .await;

                messages.push(ChatMessage::assistant_with_calls(
                    response.content,
                    calls.clone(),
                ));

                let results = self.tools.execute_batch(&calls, &exec_ctx).await;
                let any_ok = results.iter().any(|r| !is_tool_error(r));
                for (call, result) in calls.iter().zip(results.iter()) {
                    debug!(tool = call.name.as_str(), iteration, "tool executed");
                    if is_tool_error(result) {
                        last_error = result.clone();
                    }
                    messages.push(ChatMessage::tool_result(&call.id, &call.name, result.clone()));
                }

                if any_ok {
                    error_streak = 0;
                } else {
                    error_streak += 1;
                    if error_streak >= backoff {
                        let excerpt: String = if self.config.agent.verbose_tool_errors {
                            last_error.clone()
                        } else {
                            last_error.chars().take(ERROR_EXCERPT_MAX_CHARS).collect()
                        };
                        warn!(error_streak, "aborting loop after repeated tool failures");
                        return format!(
                            "My tooling is failing repeatedly, so I've stopped rather than \
                             loop. Last error: {excerpt}"
                        );
                    }
                }
                continue;
            }

            match response.content {
                Some(content) if !content.trim().is_empty() => return content,
                _ if !nudged && iteration < max_iterations => {
                    // Some models return empty content when they consider
                    // the task done; nudge once for a text reply.
                    nudged = true;
                    messages.push(ChatMessage::user(
                        "Please reply with a brief summary of what you did.".to_string(),
                    ));
                }
                _ => {
                    return "I've completed processing but have no response to give.".to_string();
                }
            }
        }

        format!(
            "I stopped after {max_iterations} tool iterations without reaching a final \
             answer. Ask me to continue if you'd like."
        )
    }

    /// Status outbounds naming the tools, rate-limited by verbosity.
    async fn maybe_emit_tool_status(
        &self,
        channel: &str,
        chat_id: &str,
        calls: &[ToolCallRequest],
        verbosity: Verbosity,
        last_status: Option<tokio::time::Instant>,
    ) -> Option<tokio::time::Instant> {
        let min_interval = Duration::from_secs_f64(verbosity.status_interval_secs());
        if let Some(last) = last_status
            && last.elapsed() < min_interval
        {
            return Some(last);
        }

        let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        let status = OutboundMessage::status(
            channel,
            chat_id,
            &format!("Working on it ({})...", names.join(", ")),
        );
        // Status updates are best-effort; never block the loop on them.
        if let Err(e) = self.bus.try_publish_outbound(status) {
            debug!(error = %e, "status update dropped");
        }
        Some(tokio::time::Instant::now())
    }

    /// Settings overrides carried on message metadata. Only trusted
    /// channels may change anything; the `restrict_workspace` toggle is
    /// additionally gated by admin config.
    fn apply_settings_overrides(
        &self,
        msg: &InboundMessage,
        trusted: bool,
        settings: &mut SessionSettings,
    ) -> Option<String> {
        let wants_restrict = msg
            .metadata
            .get("restrict_workspace")
            .and_then(|v| v.as_bool());
        let wants_model = msg
            .metadata
            .get("model")
            .and_then(|v| v.as_str())
            .filter(|m| !m.is_empty());
        let wants_verbosity = msg
            .metadata
            .get("verbosity")
            .and_then(|v| v.as_str())
            .and_then(|v| v.parse::<Verbosity>().ok());

        if (wants_restrict.is_some() || wants_model.is_some() || wants_verbosity.is_some())
            && !trusted
        {
            return Some(
                "This channel is not allowed to change session settings.".to_string(),
            );
        }

        if let Some(restrict) = wants_restrict {
            if !restrict && !self.config.agent.allow_unrestricted_workspace {
                return Some(
                    "Unrestricting the workspace is disabled by the administrator."
                        .to_string(),
                );
            }
            settings.restrict_workspace = Some(restrict);
        }
        if let Some(model) = wants_model {
            settings.model = Some(model.to_string());
        }
        if let Some(verbosity) = wants_verbosity {
            settings.verbosity = verbosity;
        }
        None
    }

    fn model_for(&self, settings: &SessionSettings) -> String {
        settings
            .model
            .clone()
            .or_else(|| self.config.agent.model.clone())
            .unwrap_or_else(|| self.provider.default_model().to_string())
    }

    fn memory_scope_for(&self, session_key: &str, msg: Option<&InboundMessage>) -> MemoryScope {
        if self.config.agent.memory_scope == "user"
            && let Some(msg) = msg
        {
            return MemoryScope::User(format!("{}:{}", msg.channel, msg.sender_id));
        }
        MemoryScope::Session(session_key.to_string())
    }
}
