// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Layered TOML configuration for the Magpie agent kernel.
//!
//! Config is merged from compiled defaults, system/XDG/local `magpie.toml`
//! files, and `MAGPIE_*` environment variables. Unknown keys are rejected;
//! out-of-range values are coerced with warnings by
//! [`model::MagpieConfig::validate`].

pub mod loader;
pub mod model;

pub use loader::{build_figment, load_config, load_config_from_path, load_config_from_str};
pub use model::{
    AgentConfig, BusConfig, ChannelConfig, ContextConfig, CronConfig, HeartbeatConfig,
    MagpieConfig, SessionConfig, SubagentConfig, ToolsConfig,
};
