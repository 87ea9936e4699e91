// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end scenarios driving the fully wired kernel through mock
//! channels and providers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use magpie::{ServeDeps, run_serve};
use magpie_config::MagpieConfig;
use magpie_core::{
    ChatRequest, ChatResponse, InboundMessage, LlmProvider, MagpieError, TokenUsage,
    ToolCallRequest,
};
use magpie_test_utils::MockChannel;
use magpie_tools::{ExecutionContext, Tool};

fn test_config(data_dir: &std::path::Path) -> MagpieConfig {
    let mut config = MagpieConfig::default();
    config.agent.data_dir = Some(data_dir.to_path_buf());
    config.agent.shutdown_grace_secs = 2;
    config.cron.enabled = false;
    config
}

fn user_msg(channel: &str, chat_id: &str, text: &str) -> InboundMessage {
    InboundMessage::user(channel, "tester", chat_id, text)
}

/// Polls until `check` passes or the deadline expires.
async fn wait_for<F>(deadline: Duration, mut check: F)
where
    F: AsyncFnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    loop {
        if check().await {
            return;
        }
        assert!(
            start.elapsed() < deadline,
            "condition not reached within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// A tool that sleeps, tracking peak concurrency.
struct SleepTool {
    millis: u64,
    current: Arc<AtomicU32>,
    peak: Arc<AtomicU32>,
}

impl SleepTool {
    fn new(millis: u64) -> (Arc<Self>, Arc<AtomicU32>) {
        let peak = Arc::new(AtomicU32::new(0));
        let tool = Arc::new(Self {
            millis,
            current: Arc::new(AtomicU32::new(0)),
            peak: peak.clone(),
        });
        (tool, peak)
    }
}

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }
    fn description(&self) -> &str {
        "Sleeps briefly"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    async fn execute(&self, _args: Value, _ctx: &ExecutionContext) -> Result<String, MagpieError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok("slept".to_string())
    }
}

/// Deterministic provider: first round issues one `sleep` tool call, the
/// round after the tool result replies `<user text>-reply`.
struct SleepThenEchoProvider;

fn last_user_text(request: &ChatRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user" && !m.content.as_text().starts_with('['))
        .map(|m| m.content.as_text())
        .unwrap_or_default()
}

fn tool_call(name: &str, arguments: Value) -> ChatResponse {
    ChatResponse {
        content: None,
        tool_calls: vec![ToolCallRequest {
            id: format!("call-{}", uuid_like()),
            name: name.to_string(),
            arguments,
        }],
        usage: TokenUsage::default(),
        stop_reason: Some("tool_use".to_string()),
    }
}

fn text(content: &str) -> ChatResponse {
    ChatResponse {
        content: Some(content.to_string()),
        tool_calls: Vec::new(),
        usage: TokenUsage::default(),
        stop_reason: Some("end_turn".to_string()),
    }
}

fn uuid_like() -> String {
    use std::sync::atomic::AtomicU64;
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[async_trait]
impl LlmProvider for SleepThenEchoProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, MagpieError> {
        let saw_tool_result = request.messages.iter().any(|m| m.role == "tool");
        if saw_tool_result {
            Ok(text(&format!("{}-reply", last_user_text(&request))))
        } else {
            Ok(tool_call("sleep", json!({})))
        }
    }

    fn default_model(&self) -> &str {
        "test-model"
    }
}

/// S1: messages within one session reply in submission order while another
/// session proceeds independently.
#[tokio::test]
async fn per_session_fifo_under_contention() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let channel = Arc::new(MockChannel::new("telegram"));
    for text in ["A", "B", "C"] {
        channel.queue_inbound(user_msg("telegram", "42", text)).await;
    }
    channel.queue_inbound(user_msg("telegram", "99", "X")).await;

    let (sleep_tool, _) = SleepTool::new(200);
    let cancel = CancellationToken::new();
    let deps = ServeDeps {
        provider: Arc::new(SleepThenEchoProvider),
        adapters: vec![channel.clone()],
        tools: vec![sleep_tool],
    };

    let serve_cancel = cancel.clone();
    let serve = tokio::spawn(async move { run_serve(config, deps, serve_cancel).await });

    wait_for(Duration::from_secs(10), async || {
        channel.sent_replies().await.len() >= 4
    })
    .await;

    let replies: Vec<(String, String)> = channel
        .sent_replies()
        .await
        .into_iter()
        .map(|m| (m.chat_id, m.content))
        .collect();

    let session_42: Vec<&str> = replies
        .iter()
        .filter(|(chat, _)| chat == "42")
        .map(|(_, content)| content.as_str())
        .collect();
    assert_eq!(session_42, vec!["A-reply", "B-reply", "C-reply"]);
    assert!(replies.iter().any(|(chat, content)| chat == "99" && content == "X-reply"));

    cancel.cancel();
    serve.await.unwrap().unwrap();
}

/// S2: cross-session concurrency never exceeds max_concurrent_messages.
#[tokio::test]
async fn cross_session_concurrency_cap() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.agent.max_concurrent_messages = 2;

    let channel = Arc::new(MockChannel::new("telegram"));
    for i in 0..5 {
        channel
            .queue_inbound(user_msg("telegram", &format!("chat-{i}"), &format!("m{i}")))
            .await;
    }

    let (sleep_tool, peak) = SleepTool::new(300);
    let cancel = CancellationToken::new();
    let deps = ServeDeps {
        provider: Arc::new(SleepThenEchoProvider),
        adapters: vec![channel.clone()],
        tools: vec![sleep_tool],
    };

    let started = tokio::time::Instant::now();
    let serve_cancel = cancel.clone();
    let serve = tokio::spawn(async move { run_serve(config, deps, serve_cancel).await });

    wait_for(Duration::from_secs(10), async || {
        channel.sent_replies().await.len() >= 5
    })
    .await;
    let elapsed = started.elapsed();

    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "admission gate exceeded: peak {}",
        peak.load(Ordering::SeqCst)
    );
    // 5 messages through 2 slots of a 300 ms tool: at least 3 rounds.
    assert!(
        elapsed >= Duration::from_millis(850),
        "finished implausibly fast: {elapsed:?}"
    );

    cancel.cancel();
    serve.await.unwrap().unwrap();
}

/// S5 provider: spawns a subagent that produces a 200 KiB result; asserts
/// no LLM request ever carries the untruncated payload.
struct BigResultProvider {
    payload_chars: usize,
    max_seen_message_chars: Arc<AtomicUsize>,
}

#[async_trait]
impl LlmProvider for BigResultProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, MagpieError> {
        for message in &request.messages {
            self.max_seen_message_chars
                .fetch_max(message.content.char_len(), Ordering::SeqCst);
        }

        let system = request
            .messages
            .first()
            .map(|m| m.content.as_text())
            .unwrap_or_default();

        if system.starts_with("# Background Task") {
            // The subagent "researches" and produces a huge report.
            return Ok(text(&"x".repeat(self.payload_chars)));
        }
        if system.contains("relay background task results") {
            return Ok(text("Your report is ready - here's the gist."));
        }

        let saw_tool_result = request.messages.iter().any(|m| m.role == "tool");
        if saw_tool_result {
            Ok(text("Started a background task for that."))
        } else {
            Ok(tool_call("spawn", json!({"task": "produce the big report"})))
        }
    }

    fn default_model(&self) -> &str {
        "test-model"
    }
}

/// S5: the main agent summarizes a truncated excerpt; no LLM call ever
/// receives the full 200 KiB payload.
#[tokio::test]
async fn subagent_result_is_truncated_and_summarized() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.subagent.progress_interval_secs = 0;
    let result_cap = config.subagent.result_max_chars;

    let payload_chars = 200 * 1024;
    let max_seen = Arc::new(AtomicUsize::new(0));
    let provider = Arc::new(BigResultProvider {
        payload_chars,
        max_seen_message_chars: max_seen.clone(),
    });

    let channel = Arc::new(MockChannel::new("telegram"));
    channel
        .queue_inbound(user_msg("telegram", "42", "research everything"))
        .await;

    let cancel = CancellationToken::new();
    let deps = ServeDeps {
        provider,
        adapters: vec![channel.clone()],
        tools: vec![],
    };
    let serve_cancel = cancel.clone();
    let serve = tokio::spawn(async move { run_serve(config, deps, serve_cancel).await });

    wait_for(Duration::from_secs(10), async || {
        channel
            .sent_replies()
            .await
            .iter()
            .any(|m| m.content.contains("gist"))
    })
    .await;

    let replies = channel.sent_replies().await;
    assert!(replies.iter().any(|m| m.content == "Started a background task for that."));
    assert!(replies.iter().any(|m| m.content.contains("gist")));

    // The summarizer saw a truncated excerpt, never the full payload.
    let seen = max_seen.load(Ordering::SeqCst);
    assert!(
        seen < payload_chars,
        "an LLM call carried the full {payload_chars}-char payload"
    );
    assert!(
        seen <= result_cap + 1024,
        "payload seen by the LLM ({seen} chars) exceeds the truncation cap"
    );

    cancel.cancel();
    serve.await.unwrap().unwrap();
}

/// Session-key override metadata is honored only for trusted channels.
#[tokio::test]
async fn session_override_requires_trusted_channel() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.channels.insert(
        "webui".to_string(),
        magpie_config::ChannelConfig {
            enabled: true,
            trusted: true,
            ..Default::default()
        },
    );
    let sessions_dir = config.sessions_dir();

    let webui = Arc::new(MockChannel::new("webui"));
    let telegram = Arc::new(MockChannel::new("telegram"));

    let mut trusted_msg = user_msg("webui", "main", "trusted hello");
    trusted_msg
        .metadata
        .insert("session_key".to_string(), json!("webui:pinned"));
    webui.queue_inbound(trusted_msg).await;

    let mut untrusted_msg = user_msg("telegram", "7", "untrusted hello");
    untrusted_msg
        .metadata
        .insert("session_key".to_string(), json!("webui:pinned"));
    telegram.queue_inbound(untrusted_msg).await;

    let cancel = CancellationToken::new();
    let deps = ServeDeps {
        provider: Arc::new(magpie_test_utils::MockProvider::with_texts(vec![
            "reply one",
            "reply two",
        ])),
        adapters: vec![webui.clone(), telegram.clone()],
        tools: vec![],
    };
    let serve_cancel = cancel.clone();
    let serve = tokio::spawn(async move { run_serve(config, deps, serve_cancel).await });

    wait_for(Duration::from_secs(10), async || {
        webui.sent_replies().await.len() + telegram.sent_replies().await.len() >= 2
    })
    .await;

    let files: Vec<String> = std::fs::read_dir(&sessions_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.ends_with(".log"))
        .collect();
    assert!(files.iter().any(|f| f == "webui_pinned.log"));
    assert!(files.iter().any(|f| f == "telegram_7.log"));

    cancel.cancel();
    serve.await.unwrap().unwrap();
}
