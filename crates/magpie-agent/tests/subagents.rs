// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests for the subagent manager.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use magpie_agent::{Origin, SubagentManager, SubagentStatus};
use magpie_bus::MessageBus;
use magpie_config::SubagentConfig;
use magpie_core::{
    ChatRequest, ChatResponse, LlmProvider, MagpieError, MessageRole, TokenUsage,
};
use magpie_test_utils::MockProvider;
use magpie_tools::{ToolRegistry, ToolRegistryConfig};

fn origin() -> Origin {
    Origin {
        channel: "telegram".to_string(),
        chat_id: "42".to_string(),
    }
}

fn manager(
    provider: Arc<dyn LlmProvider>,
    config: SubagentConfig,
) -> (Arc<SubagentManager>, MessageBus) {
    let bus = MessageBus::new(32, 32);
    let tools = Arc::new(ToolRegistry::new(ToolRegistryConfig::default()));
    let manager = Arc::new(SubagentManager::new(
        provider,
        bus.clone(),
        tools,
        config,
        "test-model".to_string(),
        1024,
    ));
    (manager, bus)
}

fn quiet_config() -> SubagentConfig {
    SubagentConfig {
        progress_interval_secs: 0,
        ..SubagentConfig::default()
    }
}

#[tokio::test]
async fn completed_subagent_announces_as_system_message() {
    let provider = Arc::new(MockProvider::with_texts(vec!["findings: all good"]));
    let (manager, bus) = manager(provider, quiet_config());

    let id = manager.spawn("check the logs", Some("log check"), origin()).unwrap();

    let announce = tokio::time::timeout(Duration::from_secs(5), bus.next_inbound())
        .await
        .expect("subagent should announce")
        .unwrap();
    assert_eq!(announce.role, MessageRole::System);
    assert_eq!(announce.channel, "telegram");
    assert_eq!(announce.chat_id, "42");
    assert!(announce.sender_id.starts_with("subagent:"));
    assert!(announce.content.contains("completed successfully"));
    assert!(announce.content.contains("findings: all good"));

    // Wait for teardown, then check recorded metadata.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let task = manager.get(&id).unwrap();
    assert_eq!(task.status, SubagentStatus::Done);
    assert_eq!(manager.running_count(), 0);
}

#[tokio::test]
async fn oversized_results_are_truncated_with_marker() {
    let big = "y".repeat(200 * 1024);
    let provider = Arc::new(MockProvider::new());
    provider.push_text(&big).await;

    let config = quiet_config();
    let cap = config.result_max_chars;
    let (manager, bus) = manager(provider, config);
    manager.spawn("huge output", None, origin()).unwrap();

    let announce = tokio::time::timeout(Duration::from_secs(5), bus.next_inbound())
        .await
        .unwrap()
        .unwrap();
    assert!(announce.content.contains("[truncated]"));
    // Announce = wrapper + truncated payload; well under the raw size.
    assert!(announce.content.len() < cap + 1024);
}

/// P5: the running count never exceeds the configured cap.
#[tokio::test]
async fn spawn_refuses_at_capacity() {
    struct SlowProvider;

    #[async_trait]
    impl LlmProvider for SlowProvider {
        async fn chat(&self, _r: ChatRequest) -> Result<ChatResponse, MagpieError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ChatResponse {
                content: Some("late".to_string()),
                tool_calls: Vec::new(),
                usage: TokenUsage::default(),
                stop_reason: None,
            })
        }
        fn default_model(&self) -> &str {
            "slow"
        }
    }

    let config = SubagentConfig {
        max_concurrent: 2,
        progress_interval_secs: 0,
        ..SubagentConfig::default()
    };
    let (manager, _bus) = manager(Arc::new(SlowProvider), config);

    manager.spawn("one", None, origin()).unwrap();
    manager.spawn("two", None, origin()).unwrap();
    assert_eq!(manager.running_count(), 2);

    let err = manager.spawn("three", None, origin()).unwrap_err();
    assert!(matches!(err, MagpieError::Resource(_)));
    assert!(err.to_string().contains("busy"));

    manager.shutdown().await;
}

#[tokio::test]
async fn cancel_stops_a_running_subagent() {
    struct HangingProvider;

    #[async_trait]
    impl LlmProvider for HangingProvider {
        async fn chat(&self, _r: ChatRequest) -> Result<ChatResponse, MagpieError> {
            std::future::pending().await
        }
        fn default_model(&self) -> &str {
            "hanging"
        }
    }

    let (manager, bus) = manager(Arc::new(HangingProvider), quiet_config());
    let id = manager.spawn("never finishes", None, origin()).unwrap();
    assert!(manager.cancel(&id));

    let announce = tokio::time::timeout(Duration::from_secs(5), bus.next_inbound())
        .await
        .unwrap()
        .unwrap();
    assert!(announce.content.contains("cancelled"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.running_count(), 0);
    assert_eq!(manager.get(&id).unwrap().status, SubagentStatus::Cancelled);
    assert!(!manager.cancel(&id), "cancel of finished task reports false");
}

#[tokio::test]
async fn wall_clock_timeout_fails_the_task() {
    struct SlowProvider;

    #[async_trait]
    impl LlmProvider for SlowProvider {
        async fn chat(&self, _r: ChatRequest) -> Result<ChatResponse, MagpieError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            unreachable!()
        }
        fn default_model(&self) -> &str {
            "slow"
        }
    }

    let config = SubagentConfig {
        timeout_secs: 1,
        progress_interval_secs: 0,
        ..SubagentConfig::default()
    };
    let (manager, bus) = manager(Arc::new(SlowProvider), config);
    let id = manager.spawn("slow task", None, origin()).unwrap();

    let announce = tokio::time::timeout(Duration::from_secs(5), bus.next_inbound())
        .await
        .unwrap()
        .unwrap();
    assert!(announce.content.contains("timed out"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.get(&id).unwrap().status, SubagentStatus::Failed);
}

#[tokio::test]
async fn progress_status_updates_reach_the_origin() {
    struct SlowishProvider;

    #[async_trait]
    impl LlmProvider for SlowishProvider {
        async fn chat(&self, _r: ChatRequest) -> Result<ChatResponse, MagpieError> {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            Ok(ChatResponse {
                content: Some("done".to_string()),
                tool_calls: Vec::new(),
                usage: TokenUsage::default(),
                stop_reason: None,
            })
        }
        fn default_model(&self) -> &str {
            "slowish"
        }
    }

    let config = SubagentConfig {
        progress_interval_secs: 1,
        ..SubagentConfig::default()
    };
    let (manager, bus) = manager(Arc::new(SlowishProvider), config);
    manager.spawn("watchable", Some("watchable"), origin()).unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), bus.next_outbound())
        .await
        .expect("expected a progress status update")
        .unwrap();
    assert!(status.is_status());
    assert!(status.content.contains("watchable"));
    assert!(status.content.contains("still running"));

    manager.shutdown().await;
}
