// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Installing skills from `.skill` archives (gzipped tar).
//!
//! Every archive entry must land inside the skills directory once
//! extracted; `..` components and absolute paths are refused, and symlink
//! entries are rejected outright.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::info;

use magpie_core::MagpieError;

use crate::frontmatter::parse_skill_md;

/// Install a `.skill` archive into `skills_dir`.
///
/// Returns the installed skill's name (taken from the extracted SKILL.md
/// frontmatter).
pub fn install_archive(skills_dir: &Path, archive: impl Read) -> Result<String, MagpieError> {
    std::fs::create_dir_all(skills_dir)?;
    let mut tar = Archive::new(GzDecoder::new(archive));

    let mut skill_md: Option<PathBuf> = None;
    for entry in tar.entries().map_err(MagpieError::storage)? {
        let mut entry = entry.map_err(MagpieError::storage)?;
        let header_type = entry.header().entry_type();
        if matches!(header_type, EntryType::Symlink | EntryType::Link) {
            return Err(MagpieError::Validation(
                "skill archive contains a link entry, refusing to install".to_string(),
            ));
        }

        let rel = entry.path().map_err(MagpieError::storage)?.into_owned();
        let safe_rel = sanitize_entry_path(&rel)?;
        let target = skills_dir.join(&safe_rel);

        match header_type {
            EntryType::Directory => {
                std::fs::create_dir_all(&target)?;
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut out = std::fs::File::create(&target)?;
                std::io::copy(&mut entry, &mut out)?;
                if target.file_name().and_then(|n| n.to_str()) == Some("SKILL.md") {
                    skill_md = Some(target.clone());
                }
            }
            other => {
                return Err(MagpieError::Validation(format!(
                    "skill archive contains unsupported entry type {other:?}"
                )));
            }
        }
    }

    let skill_md = skill_md.ok_or_else(|| {
        MagpieError::Validation("skill archive does not contain a SKILL.md".to_string())
    })?;
    let content = std::fs::read_to_string(&skill_md)?;
    let (meta, _) = parse_skill_md(&content)?;
    info!(skill = meta.name.as_str(), "skill installed");
    Ok(meta.name)
}

/// Validate an archive entry path: relative, no parent traversal.
fn sanitize_entry_path(path: &Path) -> Result<PathBuf, MagpieError> {
    let mut safe = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => safe.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(MagpieError::Validation(format!(
                    "skill archive entry '{}' escapes the skills directory",
                    path.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(MagpieError::Validation(format!(
                    "skill archive entry '{}' has an absolute path",
                    path.display()
                )));
            }
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(MagpieError::Validation(
            "skill archive contains an empty entry path".to_string(),
        ));
    }
    Ok(safe)
}
