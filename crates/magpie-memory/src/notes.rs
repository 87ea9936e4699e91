// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Markdown note files: the canonical memory storage.
//!
//! Each scope owns a directory with a long-term `MEMORY.md` and daily
//! `YYYY-MM-DD.md` notes. The FTS index in [`crate::index`] is a derived
//! view over these files.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use magpie_core::MagpieError;
use magpie_session::sanitize_key;

/// A memory scope: which directory notes are read from and written to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemoryScope {
    Global,
    Session(String),
    User(String),
}

impl MemoryScope {
    /// Stable scope label used as the index partition key.
    ///
    /// Keys are sanitized the same way as their note directories so that a
    /// rebuild from disk reproduces identical labels.
    pub fn label(&self) -> String {
        match self {
            MemoryScope::Global => "global".to_string(),
            MemoryScope::Session(key) => format!("session:{}", sanitize_key(key)),
            MemoryScope::User(key) => format!("user:{}", sanitize_key(key)),
        }
    }

    fn dir(&self, memory_root: &Path) -> PathBuf {
        match self {
            MemoryScope::Global => memory_root.join("global"),
            MemoryScope::Session(key) => memory_root.join("sessions").join(sanitize_key(key)),
            MemoryScope::User(key) => memory_root.join("users").join(sanitize_key(key)),
        }
    }
}

/// File-level operations for one memory root (`workspace/memory`).
#[derive(Debug, Clone)]
pub struct NoteStore {
    root: PathBuf,
}

impl NoteStore {
    pub fn new(memory_root: impl Into<PathBuf>) -> Self {
        Self {
            root: memory_root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Long-term note file for a scope.
    pub fn memory_file(&self, scope: &MemoryScope) -> PathBuf {
        scope.dir(&self.root).join("MEMORY.md")
    }

    /// Today's daily note file for a scope.
    pub fn today_file(&self, scope: &MemoryScope) -> PathBuf {
        let today = Utc::now().format("%Y-%m-%d");
        scope.dir(&self.root).join(format!("{today}.md"))
    }

    /// Append text to today's note under a per-file advisory lock.
    pub fn append_today(&self, scope: &MemoryScope, text: &str) -> Result<(), MagpieError> {
        let path = self.today_file(scope);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_path = {
            let mut p = path.as_os_str().to_owned();
            p.push(".lock");
            PathBuf::from(p)
        };
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        let mut lock = fd_lock::RwLock::new(lock_file);
        let _guard = lock.write()?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(text.as_bytes())?;
        if !text.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Every note file under a scope's directory (for ingest/rebuild).
    pub fn scope_files(&self, scope: &MemoryScope) -> Vec<PathBuf> {
        let dir = scope.dir(&self.root);
        let mut files = Vec::new();
        if let Ok(entries) = fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("md") {
                    files.push(path);
                }
            }
        }
        files.sort();
        files
    }

    /// All scopes that currently have note directories on disk.
    pub fn known_scopes(&self) -> Vec<MemoryScope> {
        let mut scopes = vec![MemoryScope::Global];
        for (sub, make) in [
            ("sessions", MemoryScope::Session as fn(String) -> MemoryScope),
            ("users", MemoryScope::User as fn(String) -> MemoryScope),
        ] {
            if let Ok(entries) = fs::read_dir(self.root.join(sub)) {
                for entry in entries.flatten() {
                    if entry.path().is_dir() {
                        scopes.push(make(entry.file_name().to_string_lossy().to_string()));
                    }
                }
            }
        }
        scopes
    }
}
