// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for the Magpie agent kernel.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup. A rejected config is refused outright -- the
//! caller keeps whatever configuration it already had rather than falling
//! back to defaults.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level Magpie configuration.
///
/// Loaded from TOML files following the XDG hierarchy, with environment
/// variable overrides. All sections are optional and default to sensible
/// values.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MagpieConfig {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub subagent: SubagentConfig,

    #[serde(default)]
    pub cron: CronConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Per-channel settings keyed by channel name ("telegram", "webui", ...).
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
}

/// Agent identity, model selection, and loop limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Display name of the agent.
    #[serde(default = "default_agent_name")]
    pub name: String,

    /// Data directory profile suffix; data lives at `~/.magpie[_<profile>]`.
    #[serde(default)]
    pub profile: Option<String>,

    /// Explicit data directory, overriding the home-based default.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Default model when a session has no override.
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Upper bound on tool-loop iterations per message. Values <= 0 are
    /// coerced to 1 by [`MagpieConfig::validate`].
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: i64,

    /// Maximum distinct sessions processed in parallel. Messages within
    /// one session are always sequential.
    #[serde(default = "default_max_concurrent_messages")]
    pub max_concurrent_messages: usize,

    /// Consecutive fully-failed tool batches tolerated before the loop
    /// gives up with a user-facing error.
    #[serde(default = "default_tool_error_backoff")]
    pub tool_error_backoff: u32,

    /// Memory scoping: "session" (per chat) or "user" (per sender).
    #[serde(default = "default_memory_scope")]
    pub memory_scope: String,

    /// Admin gate for the per-session `restrict_workspace` toggle.
    #[serde(default)]
    pub allow_unrestricted_workspace: bool,

    /// Surface raw tool errors to users instead of a hint + error id.
    #[serde(default)]
    pub verbose_tool_errors: bool,

    /// Seconds to wait for in-flight message handlers on shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            profile: None,
            data_dir: None,
            log_level: default_log_level(),
            model: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_tool_iterations: default_max_tool_iterations(),
            max_concurrent_messages: default_max_concurrent_messages(),
            tool_error_backoff: default_tool_error_backoff(),
            memory_scope: default_memory_scope(),
            allow_unrestricted_workspace: false,
            verbose_tool_errors: false,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_agent_name() -> String {
    "magpie".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tool_iterations() -> i64 {
    20
}

fn default_max_concurrent_messages() -> usize {
    4
}

fn default_tool_error_backoff() -> u32 {
    3
}

fn default_memory_scope() -> String {
    "session".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

/// Message bus queue capacities.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    #[serde(default = "default_queue_capacity")]
    pub inbound_capacity: usize,

    #[serde(default = "default_queue_capacity")]
    pub outbound_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: default_queue_capacity(),
            outbound_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

/// Session store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Bounded in-memory session cache entries.
    #[serde(default = "default_session_cache_entries")]
    pub cache_entries: usize,

    /// Most recent turns handed to the context builder.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_entries: default_session_cache_entries(),
            history_turns: default_history_turns(),
        }
    }
}

fn default_session_cache_entries() -> usize {
    256
}

fn default_history_turns() -> usize {
    50
}

/// Prompt assembly budgets (characters) and media limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfig {
    #[serde(default = "default_bootstrap_max_chars")]
    pub bootstrap_max_chars: usize,

    #[serde(default = "default_memory_max_chars")]
    pub memory_max_chars: usize,

    #[serde(default = "default_skills_max_chars")]
    pub skills_max_chars: usize,

    #[serde(default = "default_history_max_chars")]
    pub history_max_chars: usize,

    /// Per-attachment size cap in bytes.
    #[serde(default = "default_media_max_bytes")]
    pub media_max_bytes: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            bootstrap_max_chars: default_bootstrap_max_chars(),
            memory_max_chars: default_memory_max_chars(),
            skills_max_chars: default_skills_max_chars(),
            history_max_chars: default_history_max_chars(),
            media_max_bytes: default_media_max_bytes(),
        }
    }
}

fn default_bootstrap_max_chars() -> usize {
    4000
}

fn default_memory_max_chars() -> usize {
    6000
}

fn default_skills_max_chars() -> usize {
    12000
}

fn default_history_max_chars() -> usize {
    80000
}

fn default_media_max_bytes() -> u64 {
    8 * 1024 * 1024
}

/// Tool registry settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    /// Maximum tool calls executed concurrently within one message.
    #[serde(default = "default_tool_parallelism")]
    pub parallelism: usize,

    /// Result cache entries for cacheable tools.
    #[serde(default = "default_tool_cache_entries")]
    pub cache_entries: usize,

    /// Default cache TTL in seconds.
    #[serde(default = "default_tool_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Default per-call timeout when a tool declares none.
    #[serde(default = "default_tool_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Optional allowlist of tool names exposed to the LLM.
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            parallelism: default_tool_parallelism(),
            cache_entries: default_tool_cache_entries(),
            cache_ttl_secs: default_tool_cache_ttl_secs(),
            default_timeout_secs: default_tool_timeout_secs(),
            allowed_tools: None,
        }
    }
}

fn default_tool_parallelism() -> usize {
    8
}

fn default_tool_cache_entries() -> usize {
    256
}

fn default_tool_cache_ttl_secs() -> u64 {
    300
}

fn default_tool_timeout_secs() -> u64 {
    60
}

/// Background subagent limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SubagentConfig {
    #[serde(default = "default_max_concurrent_subagents")]
    pub max_concurrent: usize,

    #[serde(default = "default_subagent_max_iterations")]
    pub max_iterations: usize,

    /// Wall-clock limit per subagent.
    #[serde(default = "default_subagent_timeout_secs")]
    pub timeout_secs: u64,

    /// Truncation cap for a subagent's reported result.
    #[serde(default = "default_subagent_result_max_chars")]
    pub result_max_chars: usize,

    /// Seconds between progress status messages (0 disables them).
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent_subagents(),
            max_iterations: default_subagent_max_iterations(),
            timeout_secs: default_subagent_timeout_secs(),
            result_max_chars: default_subagent_result_max_chars(),
            progress_interval_secs: default_progress_interval_secs(),
        }
    }
}

fn default_max_concurrent_subagents() -> usize {
    8
}

fn default_subagent_max_iterations() -> usize {
    15
}

fn default_subagent_timeout_secs() -> u64 {
    900
}

fn default_subagent_result_max_chars() -> usize {
    32 * 1024
}

fn default_progress_interval_secs() -> u64 {
    15
}

/// Scheduled-job engine settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CronConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

/// Heartbeat settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

fn default_heartbeat_interval_secs() -> u64 {
    1800
}

/// Per-channel admission settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Only trusted channels may redirect session routing via metadata.
    /// The local browser UI is trusted; network-exposed channels are not.
    #[serde(default)]
    pub trusted: bool,

    /// Allowed sender ids; empty allows everyone.
    #[serde(default)]
    pub allow_from: Vec<String>,

    /// Minimum seconds between messages from the same sender (0 disables).
    #[serde(default)]
    pub rate_limit_secs: u64,
}

fn default_true() -> bool {
    true
}

impl MagpieConfig {
    /// Root data directory: `agent.data_dir` when set, else `~/.magpie`
    /// or `~/.magpie_<profile>`.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.agent.data_dir {
            return dir.clone();
        }
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        match self.agent.profile.as_deref() {
            Some(p) if !p.is_empty() => home.join(format!(".magpie_{p}")),
            _ => home.join(".magpie"),
        }
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.data_dir().join("workspace")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir().join("sessions")
    }

    pub fn cron_dir(&self) -> PathBuf {
        self.data_dir().join("cron")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir().join("uploads")
    }

    /// Whether `channel` may override session routing via metadata.
    pub fn channel_trusted(&self, channel: &str) -> bool {
        self.channels.get(channel).is_some_and(|c| c.trusted)
    }

    /// Coerce out-of-range values in place, logging each adjustment.
    ///
    /// The tool loop requires at least one iteration; queue capacities and
    /// parallelism must be non-zero.
    pub fn validate(&mut self) {
        if self.agent.max_tool_iterations < 1 {
            tracing::warn!(
                configured = self.agent.max_tool_iterations,
                "agent.max_tool_iterations must be >= 1, coercing to 1"
            );
            self.agent.max_tool_iterations = 1;
        }
        if self.agent.max_concurrent_messages == 0 {
            tracing::warn!("agent.max_concurrent_messages must be >= 1, coercing to 1");
            self.agent.max_concurrent_messages = 1;
        }
        if self.bus.inbound_capacity == 0 {
            tracing::warn!("bus.inbound_capacity must be >= 1, coercing to 1");
            self.bus.inbound_capacity = 1;
        }
        if self.bus.outbound_capacity == 0 {
            tracing::warn!("bus.outbound_capacity must be >= 1, coercing to 1");
            self.bus.outbound_capacity = 1;
        }
        if self.tools.parallelism == 0 {
            tracing::warn!("tools.parallelism must be >= 1, coercing to 1");
            self.tools.parallelism = 1;
        }
    }

    /// Validated tool-loop iteration bound (always >= 1 after `validate`).
    pub fn max_tool_iterations(&self) -> usize {
        self.agent.max_tool_iterations.max(1) as usize
    }
}
