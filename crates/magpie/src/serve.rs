// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `magpie serve` wiring.
//!
//! Builds every subsystem from configuration, starts the channel
//! supervisor, cron scheduler, and heartbeat, and runs the agent loop
//! until the cancellation token fires. Shutdown then drains in order:
//! agent handlers (bounded grace), subagents, channels, bus.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use magpie_agent::{
    AgentLoop, MessageTool, SpawnTool, SubagentControlTool, SubagentManager, UseSkillTool,
};
use magpie_bus::MessageBus;
use magpie_channel::{ChannelAdapter, ChannelSupervisor};
use magpie_config::MagpieConfig;
use magpie_context::ContextBuilder;
use magpie_core::{LlmProvider, MagpieError};
use magpie_cron::{CronService, HeartbeatService};
use magpie_memory::{MemoryIndex, NoteStore};
use magpie_session::SessionStore;
use magpie_skill::SkillsRegistry;
use magpie_tools::{Tool, ToolRegistry, ToolRegistryConfig};

/// Host-supplied collaborators: the LLM provider, chat channels, and the
/// concrete work tools (files, shell, web, ...).
pub struct ServeDeps {
    pub provider: Arc<dyn LlmProvider>,
    pub adapters: Vec<Arc<dyn ChannelAdapter>>,
    pub tools: Vec<Arc<dyn Tool>>,
}

/// Run the kernel until `cancel` fires.
pub async fn run_serve(
    config: MagpieConfig,
    deps: ServeDeps,
    cancel: CancellationToken,
) -> Result<(), MagpieError> {
    info!(agent = config.agent.name.as_str(), "starting magpie serve");

    let data_dir = config.data_dir();
    let workspace = config.workspace_dir();
    for dir in [
        &data_dir,
        &workspace,
        &config.sessions_dir(),
        &config.cron_dir(),
        &config.uploads_dir(),
    ] {
        std::fs::create_dir_all(dir)?;
    }

    let config = Arc::new(config);
    let bus = MessageBus::new(config.bus.inbound_capacity, config.bus.outbound_capacity);

    let sessions = Arc::new(SessionStore::new(
        config.sessions_dir(),
        config.session.cache_entries,
    )?);

    let memory_root = workspace.join("memory");
    let notes = NoteStore::new(&memory_root);
    let index = MemoryIndex::open(memory_root.join("memory.db")).await?;
    let skills = Arc::new(SkillsRegistry::new(workspace.join("skills")));
    info!(skills = skills.list().len(), "skills registry initialized");

    let context = Arc::new(ContextBuilder::new(
        &workspace,
        notes,
        index,
        skills.clone(),
        config.context.clone(),
        &config.agent.name,
    ));

    let registry_config = ToolRegistryConfig {
        parallelism: config.tools.parallelism,
        cache_entries: config.tools.cache_entries,
        cache_ttl: std::time::Duration::from_secs(config.tools.cache_ttl_secs),
        default_timeout: std::time::Duration::from_secs(config.tools.default_timeout_secs),
        allowed_tools: config.tools.allowed_tools.clone(),
    };

    // Subagents get the host's work tools plus skill disclosure, but no
    // spawn/message, so delegation stays single-level.
    let subagent_tools = Arc::new(ToolRegistry::new(registry_config.clone()));
    for tool in &deps.tools {
        subagent_tools.register(tool.clone())?;
    }
    subagent_tools.register(Arc::new(UseSkillTool::new(skills.clone())))?;

    let model = config
        .agent
        .model
        .clone()
        .unwrap_or_else(|| deps.provider.default_model().to_string());
    let subagents = Arc::new(SubagentManager::new(
        deps.provider.clone(),
        bus.clone(),
        subagent_tools,
        config.subagent.clone(),
        model,
        config.agent.max_tokens,
    ));

    let tools = Arc::new(ToolRegistry::new(registry_config));
    for tool in &deps.tools {
        tools.register(tool.clone())?;
    }
    tools.register(Arc::new(SpawnTool::new(subagents.clone())))?;
    tools.register(Arc::new(SubagentControlTool::new(subagents.clone())))?;
    tools.register(Arc::new(MessageTool::new(bus.clone())))?;
    tools.register(Arc::new(UseSkillTool::new(skills)))?;
    info!(tools = tools.len(), "tool registry initialized");

    let agent = Arc::new(AgentLoop::new(
        bus.clone(),
        deps.provider.clone(),
        sessions.clone(),
        context,
        tools,
        config.clone(),
        cancel.child_token(),
    ));

    // Cron and heartbeat hold a process_direct handle, not the agent loop
    // itself. The service handle is kept alive for the scheduler task.
    let _cron = if config.cron.enabled {
        let agent_handle = agent.clone();
        let runner: magpie_cron::JobRunner = Arc::new(move |job: magpie_cron::CronJob| {
            let agent = agent_handle.clone();
            Box::pin(async move {
                let session_key = format!("cron:{}", job.id);
                let channel = job.target_channel.clone().unwrap_or_else(|| "cron".to_string());
                let chat_id = job.target_chat_id.clone().unwrap_or_else(|| job.id.clone());
                agent
                    .process_direct(&job.message, &session_key, &channel, &chat_id)
                    .await
            })
        });
        let service = Arc::new(
            CronService::load(config.cron_dir().join("jobs.json"), bus.clone(), runner).await?,
        );
        let service2 = service.clone();
        let cron_cancel = cancel.child_token();
        tokio::spawn(async move { service2.run(cron_cancel).await });
        Some(service)
    } else {
        info!("cron disabled by configuration");
        None
    };

    if config.heartbeat.enabled {
        let agent_handle = agent.clone();
        let runner: magpie_cron::HeartbeatRunner = Arc::new(move |prompt: String| {
            let agent = agent_handle.clone();
            Box::pin(async move {
                agent
                    .process_direct(&prompt, "heartbeat:main", "heartbeat", "main")
                    .await
            })
        });
        let heartbeat = HeartbeatService::new(&workspace, config.heartbeat.interval_secs, runner);
        let hb_cancel = cancel.child_token();
        tokio::spawn(async move { heartbeat.run(hb_cancel).await });
        info!(
            interval_secs = config.heartbeat.interval_secs,
            "heartbeat enabled"
        );
    }

    let mut supervisor = ChannelSupervisor::new();
    for adapter in deps.adapters {
        supervisor.add_adapter(adapter);
    }
    let channel_cancel = cancel.child_token();
    supervisor.start(bus.clone(), channel_cancel.clone());
    info!(channels = supervisor.channel_count(), "channels started");

    // The agent loop is the foreground task.
    agent.run().await;

    // Orderly shutdown: handlers (bounded grace), subagents, channels.
    agent.stop().await;
    subagents.shutdown().await;
    channel_cancel.cancel();
    supervisor.stop().await;
    bus.shutdown();

    info!("magpie serve shutdown complete");
    Ok(())
}
