// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Memory subsystem: markdown note files plus an FTS retrieval index.
//!
//! Notes are organized by scope (global, per-session, per-user) under
//! `workspace/memory/`. The daily note file is the canonical source of
//! truth; the SQLite index at `workspace/memory/memory.db` is a derived
//! view that can be rebuilt from the files at any time.

pub mod index;
pub mod notes;

pub use index::{MemoryHit, MemoryIndex};
pub use notes::{MemoryScope, NoteStore};
