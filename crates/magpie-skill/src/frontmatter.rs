// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SKILL.md frontmatter parsing.
//!
//! A skill file opens with a YAML frontmatter block delimited by `---`
//! lines, followed by the markdown instructions:
//!
//! ```markdown
//! ---
//! name: weather-lookup
//! description: Look up current weather for a city
//! version: 0.2.0
//! ---
//! # Weather lookup
//! ...
//! ```

use serde::Deserialize;

use magpie_core::MagpieError;

/// Parsed frontmatter of a SKILL.md.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SkillMeta {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Split a SKILL.md into `(meta, body)`.
///
/// Validates that the name is non-empty and uses only alphanumerics,
/// hyphens, and underscores (it doubles as a directory name).
pub fn parse_skill_md(content: &str) -> Result<(SkillMeta, String), MagpieError> {
    let (raw_meta, body) = split_frontmatter(content).ok_or_else(|| {
        MagpieError::Validation("SKILL.md is missing its frontmatter block".to_string())
    })?;

    let meta: SkillMeta = serde_yaml::from_str(raw_meta)
        .map_err(|e| MagpieError::Validation(format!("invalid skill frontmatter: {e}")))?;

    if meta.name.is_empty() {
        return Err(MagpieError::Validation(
            "skill name must not be empty".to_string(),
        ));
    }
    if !meta
        .name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(MagpieError::Validation(format!(
            "skill name '{}' contains invalid characters (only alphanumeric, hyphens, underscores allowed)",
            meta.name
        )));
    }

    Ok((meta, body.trim_start().to_string()))
}

/// Return `(frontmatter, body)` when the content opens with a `---` block.
fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n"))?;
    let end = rest.find("\n---")?;
    let meta = &rest[..end];
    let after = &rest[end + 4..];
    let body = after.strip_prefix('\n').unwrap_or(after);
    Some((meta, body))
}
