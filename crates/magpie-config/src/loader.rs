// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration loader using Figment for layered config merging.
//!
//! Supports the XDG hierarchy: `./magpie.toml` > `~/.config/magpie/magpie.toml`
//! > `/etc/magpie/magpie.toml`, with environment variable overrides via the
//! `MAGPIE_` prefix.

#![allow(clippy::result_large_err)] // figment::Error is external and cannot be boxed without wrapper

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::model::MagpieConfig;

/// Load configuration from the standard XDG hierarchy with env var overrides.
///
/// Merge order (later overrides earlier):
/// 1. Compiled defaults
/// 2. `/etc/magpie/magpie.toml` (system-wide)
/// 3. `~/.config/magpie/magpie.toml` (user XDG config)
/// 4. `./magpie.toml` (local directory)
/// 5. `MAGPIE_*` environment variables
///
/// A config that fails extraction (unknown keys, type mismatches) is
/// refused; callers keep their prior configuration.
pub fn load_config() -> Result<MagpieConfig, figment::Error> {
    let mut config: MagpieConfig = build_figment().extract()?;
    config.validate();
    Ok(config)
}

/// Load configuration from a TOML string only (no XDG lookup).
///
/// Used for testing and explicit config specification.
pub fn load_config_from_str(toml_content: &str) -> Result<MagpieConfig, figment::Error> {
    let mut config: MagpieConfig = Figment::new()
        .merge(Serialized::defaults(MagpieConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()?;
    config.validate();
    Ok(config)
}

/// Load configuration from a specific file path with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<MagpieConfig, figment::Error> {
    let mut config: MagpieConfig = Figment::new()
        .merge(Serialized::defaults(MagpieConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()?;
    config.validate();
    Ok(config)
}

/// Build the Figment used internally for config loading (exposed for
/// diagnostic use; returned before extraction so callers can inspect
/// provenance metadata).
pub fn build_figment() -> Figment {
    Figment::new()
        .merge(Serialized::defaults(MagpieConfig::default()))
        .merge(Toml::file("/etc/magpie/magpie.toml"))
        .merge(Toml::file(
            dirs::config_dir()
                .map(|d| d.join("magpie/magpie.toml"))
                .unwrap_or_default(),
        ))
        .merge(Toml::file("magpie.toml"))
        .merge(env_provider())
}

/// Create the environment variable provider using explicit `map()` for
/// section-to-dot mapping.
///
/// Uses `Env::map()` NOT `Env::split("_")` to avoid ambiguity with
/// underscore-containing key names: `MAGPIE_AGENT_MAX_TOKENS` must map to
/// `agent.max_tokens`, not `agent.max.tokens`.
fn env_provider() -> Env {
    Env::prefixed("MAGPIE_").map(|key| {
        // `key` is the lowercased env var name with the prefix stripped,
        // e.g. MAGPIE_AGENT_MAX_TOKENS -> "agent_max_tokens".
        let key_str = key.as_str();
        let mapped = key_str
            .replacen("agent_", "agent.", 1)
            .replacen("bus_", "bus.", 1)
            .replacen("session_", "session.", 1)
            .replacen("context_", "context.", 1)
            .replacen("tools_", "tools.", 1)
            .replacen("subagent_", "subagent.", 1)
            .replacen("cron_", "cron.", 1)
            .replacen("heartbeat_", "heartbeat.", 1);
        mapped.into()
    })
}
