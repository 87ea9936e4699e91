// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Magpie composition root.
//!
//! [`serve::run_serve`] wires the full kernel -- bus, session store,
//! memory, skills, context, tools, agent loop, subagents, cron, and
//! heartbeat -- from a configuration plus the host-supplied LLM provider,
//! channel adapters, and work tools. Everything is injected explicitly;
//! there is no module-level state.

pub mod serve;

pub use serve::{ServeDeps, run_serve};
