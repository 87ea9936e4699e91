// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-session conversation history with atomic persistence.
//!
//! Each session is one JSONL file under `sessions/`: a metadata first line
//! followed by one line per turn. Saves rewrite the file through a named
//! temp file and an atomic rename, serialized by a per-key in-process mutex
//! plus an OS advisory lock on a `.lock` sidecar so two processes also
//! serialize. A bounded LRU cache fronts the disk and is invalidated by
//! mtime when another process modified the file.

pub mod safe_key;
pub mod store;

pub use safe_key::sanitize_key;
pub use store::{Session, SessionInfo, SessionStore};
