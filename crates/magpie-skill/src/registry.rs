// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Skill discovery and loading.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use tracing::warn;

use magpie_core::MagpieError;

use crate::frontmatter::{SkillMeta, parse_skill_md};

/// Listing entry for one skill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillInfo {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
}

/// Enumerates and loads skill packages under a skills directory.
///
/// A skill is a directory containing a `SKILL.md`. Bodies are cached by
/// file mtime.
pub struct SkillsRegistry {
    skills_dir: PathBuf,
    body_cache: Mutex<HashMap<PathBuf, (Option<SystemTime>, String)>>,
}

impl SkillsRegistry {
    pub fn new(skills_dir: impl Into<PathBuf>) -> Self {
        Self {
            skills_dir: skills_dir.into(),
            body_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn skills_dir(&self) -> &Path {
        &self.skills_dir
    }

    /// All valid skills, sorted by name for deterministic prompts.
    ///
    /// Directories whose SKILL.md fails to parse are skipped with a warning.
    pub fn list(&self) -> Vec<SkillInfo> {
        let mut skills = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.skills_dir) else {
            return skills;
        };
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let skill_file = dir.join("SKILL.md");
            if !skill_file.exists() {
                continue;
            }
            match self.read_meta(&skill_file) {
                Ok(meta) => skills.push(SkillInfo {
                    name: meta.name,
                    description: meta.description,
                    path: skill_file,
                }),
                Err(e) => {
                    warn!(path = %skill_file.display(), error = %e, "skipping unparsable skill");
                }
            }
        }
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    /// Full instruction body of a skill (frontmatter stripped), on demand.
    pub fn load(&self, name: &str) -> Result<String, MagpieError> {
        let skill_file = self.skills_dir.join(name).join("SKILL.md");
        if !skill_file.exists() {
            return Err(MagpieError::Validation(format!("unknown skill '{name}'")));
        }

        let mtime = std::fs::metadata(&skill_file)
            .and_then(|m| m.modified())
            .ok();
        {
            let cache = self.body_cache.lock().expect("skill cache poisoned");
            if let Some((cached_mtime, body)) = cache.get(&skill_file)
                && *cached_mtime == mtime
            {
                return Ok(body.clone());
            }
        }

        let content = std::fs::read_to_string(&skill_file)?;
        let (_, body) = parse_skill_md(&content)?;
        self.body_cache
            .lock()
            .expect("skill cache poisoned")
            .insert(skill_file, (mtime, body.clone()));
        Ok(body)
    }

    fn read_meta(&self, skill_file: &Path) -> Result<SkillMeta, MagpieError> {
        let content = std::fs::read_to_string(skill_file)?;
        let (meta, _) = parse_skill_md(&content)?;
        Ok(meta)
    }

    /// Markdown summary of available skills for the system prompt.
    pub fn summary(&self) -> String {
        let skills = self.list();
        if skills.is_empty() {
            return String::new();
        }
        let mut lines = vec!["<skills>".to_string()];
        for s in &skills {
            lines.push("  <skill>".to_string());
            lines.push(format!("    <name>{}</name>", escape_xml(&s.name)));
            lines.push(format!(
                "    <description>{}</description>",
                escape_xml(&s.description)
            ));
            lines.push(format!("    <location>{}</location>", s.path.display()));
            lines.push("  </skill>".to_string());
        }
        lines.push("</skills>".to_string());
        lines.join("\n")
    }
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
