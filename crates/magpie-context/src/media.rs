// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Media attachment loading for multimodal messages.

use std::path::Path;

use base64::Engine;
use tracing::warn;

use magpie_core::{ContentPart, MediaDescriptor};

/// Load media descriptors into base64 image parts.
///
/// Returns `(parts, notes)`: parts for attachments that loaded (possibly
/// `None` when nothing did), and one human-readable note per descriptor
/// that was skipped (missing, oversized, or a non-image type).
pub fn attach_media(
    workspace: &Path,
    _text: &str,
    media: &[MediaDescriptor],
    max_bytes: u64,
) -> (Option<Vec<ContentPart>>, Vec<String>) {
    let mut parts = Vec::new();
    let mut notes = Vec::new();

    for descriptor in media {
        let path = resolve(workspace, &descriptor.path);

        if !descriptor.mime.starts_with("image/") {
            notes.push(format!(
                "[Attachment {} ({}) could not be attached: unsupported media type]",
                descriptor.path, descriptor.mime
            ));
            continue;
        }

        let size = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "media file unreadable");
                notes.push(format!(
                    "[Attachment {} could not be attached: unreadable]",
                    descriptor.path
                ));
                continue;
            }
        };
        if size > max_bytes {
            warn!(path = %path.display(), size, max_bytes, "media file over size cap");
            notes.push(format!(
                "[Attachment {} could not be attached: {size} bytes exceeds the {max_bytes} byte cap]",
                descriptor.path
            ));
            continue;
        }

        match std::fs::read(&path) {
            Ok(bytes) => {
                let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
                parts.push(ContentPart::Image {
                    media_type: descriptor.mime.clone(),
                    data,
                });
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "media read failed");
                notes.push(format!(
                    "[Attachment {} could not be attached: unreadable]",
                    descriptor.path
                ));
            }
        }
    }

    let parts = if parts.is_empty() { None } else { Some(parts) };
    (parts, notes)
}

/// Relative media paths resolve against the workspace; absolute paths
/// outside it are preserved verbatim.
fn resolve(workspace: &Path, path: &str) -> std::path::PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        workspace.join(p)
    }
}
