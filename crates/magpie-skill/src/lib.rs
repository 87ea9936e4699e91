// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Skill packages for the Magpie agent.
//!
//! A skill is a directory under `workspace/skills/` holding a `SKILL.md`
//! with YAML frontmatter and markdown instructions. The registry lists
//! skills deterministically for the system prompt and loads full bodies on
//! demand; `.skill` archives install with path-traversal defence.

pub mod frontmatter;
pub mod install;
pub mod registry;

pub use frontmatter::{SkillMeta, parse_skill_md};
pub use install::install_archive;
pub use registry::{SkillInfo, SkillsRegistry};
