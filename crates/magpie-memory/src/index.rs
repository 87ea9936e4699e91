// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite-backed memory index with FTS5 retrieval and a LIKE fallback.
//!
//! The note files are canonical; this index is a derived view rebuilt from
//! them at any time. `memory_sources` tracks file mtimes so unchanged files
//! are not re-chunked; `memory_entries` holds the chunks; an FTS5 virtual
//! table (when the SQLite build ships it) provides bm25 ranking.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio_rusqlite::Connection;
use tracing::{debug, warn};

use magpie_core::MagpieError;

use crate::notes::{MemoryScope, NoteStore};

/// One retrieved chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryHit {
    pub scope: String,
    pub source_key: String,
    pub content: String,
}

fn storage_err(e: tokio_rusqlite::Error) -> MagpieError {
    MagpieError::Storage {
        source: Box::new(e),
    }
}

/// Split markdown-ish text into stable chunks for indexing.
///
/// Paragraphs separated by blank lines; fragments under 12 chars are
/// skipped, chunks are capped at 1000 chars.
pub(crate) fn split_into_chunks(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                push_chunk(&mut chunks, &current);
                current.clear();
            }
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        push_chunk(&mut chunks, &current);
    }
    chunks
}

fn push_chunk(chunks: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if trimmed.len() < 12 {
        return;
    }
    let capped: String = trimmed.chars().take(1000).collect();
    chunks.push(capped);
}

/// Build an FTS query from free text: lowercased alphanumeric tokens
/// OR-joined, capped at 16 terms. Lowercasing keeps tokens like "AND"
/// from being read as FTS operators; stripping punctuation avoids FTS
/// query syntax injection.
pub(crate) fn fts_query_from_text(text: &str) -> String {
    let mut terms: Vec<String> = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            current.push(c.to_ascii_lowercase());
        } else if !current.is_empty() {
            if current.len() >= 2 {
                terms.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
        if terms.len() >= 16 {
            break;
        }
    }
    if current.len() >= 2 && terms.len() < 16 {
        terms.push(current);
    }
    terms.join(" OR ")
}

fn hash_text(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn mtime_ns(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// The FTS-backed retrieval index.
pub struct MemoryIndex {
    conn: Connection,
    fts_enabled: bool,
}

impl MemoryIndex {
    /// Open (and create) the index database at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, MagpieError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path).await.map_err(storage_err)?;
        Self::with_connection(conn).await
    }

    /// In-memory index for tests.
    pub async fn open_in_memory() -> Result<Self, MagpieError> {
        let conn = Connection::open_in_memory().await.map_err(storage_err)?;
        Self::with_connection(conn).await
    }

    async fn with_connection(conn: Connection) -> Result<Self, MagpieError> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA busy_timeout=3000;

                 CREATE TABLE IF NOT EXISTS memory_sources (
                   scope TEXT NOT NULL,
                   source_key TEXT NOT NULL,
                   mtime_ns INTEGER NOT NULL,
                   updated_at TEXT NOT NULL,
                   PRIMARY KEY (scope, source_key)
                 );

                 CREATE TABLE IF NOT EXISTS memory_entries (
                   id INTEGER PRIMARY KEY,
                   scope TEXT NOT NULL,
                   source_key TEXT NOT NULL,
                   content TEXT NOT NULL,
                   content_hash TEXT NOT NULL,
                   created_at TEXT NOT NULL,
                   UNIQUE (scope, source_key, content_hash)
                 );

                 CREATE INDEX IF NOT EXISTS idx_memory_entries_scope
                   ON memory_entries(scope);",
            )?;
            Ok(())
        })
        .await
        .map_err(storage_err)?;

        // FTS5 may be missing from the linked SQLite; fall back to LIKE.
        let fts_enabled = conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE VIRTUAL TABLE IF NOT EXISTS memory_entries_fts
                       USING fts5(content, scope, content='memory_entries', content_rowid='id');

                     CREATE TRIGGER IF NOT EXISTS memory_entries_ai
                       AFTER INSERT ON memory_entries BEGIN
                       INSERT INTO memory_entries_fts(rowid, content, scope)
                       VALUES (new.id, new.content, new.scope);
                     END;

                     CREATE TRIGGER IF NOT EXISTS memory_entries_ad
                       AFTER DELETE ON memory_entries BEGIN
                       INSERT INTO memory_entries_fts(memory_entries_fts, rowid, content, scope)
                       VALUES('delete', old.id, old.content, old.scope);
                     END;",
                )?;
                Ok(())
            })
            .await
            .is_ok();

        if !fts_enabled {
            warn!("FTS5 unavailable, memory search falls back to substring matching");
        }

        Ok(Self { conn, fts_enabled })
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled
    }

    /// Index a file under a scope; no-op when its mtime is unchanged.
    pub async fn ingest_file_if_changed(
        &self,
        scope: &str,
        path: &Path,
    ) -> Result<(), MagpieError> {
        let source_key = path.to_string_lossy().to_string();
        let current_mtime = mtime_ns(path);
        let text = std::fs::read_to_string(path).unwrap_or_default();
        let scope = scope.to_string();

        self.conn
            .call(move |conn| {
                let recorded: Option<i64> = conn
                    .query_row(
                        "SELECT mtime_ns FROM memory_sources WHERE scope = ?1 AND source_key = ?2",
                        rusqlite::params![scope, source_key],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                if recorded == Some(current_mtime) {
                    return Ok(());
                }

                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM memory_entries WHERE scope = ?1 AND source_key = ?2",
                    rusqlite::params![scope, source_key],
                )?;

                let now = chrono::Utc::now().to_rfc3339();
                for chunk in split_into_chunks(&text) {
                    tx.execute(
                        "INSERT OR IGNORE INTO memory_entries
                           (scope, source_key, content, content_hash, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        rusqlite::params![scope, source_key, chunk, hash_text(&chunk), now],
                    )?;
                }

                tx.execute(
                    "INSERT INTO memory_sources(scope, source_key, mtime_ns, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(scope, source_key)
                     DO UPDATE SET mtime_ns = excluded.mtime_ns, updated_at = excluded.updated_at",
                    rusqlite::params![scope, source_key, current_mtime, now],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }

    /// Top-`k` chunks for `query` within `scope`, ranked by bm25 when FTS
    /// is available.
    pub async fn search(
        &self,
        scope: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<MemoryHit>, MagpieError> {
        let fts_query = fts_query_from_text(query);
        if fts_query.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let scope = scope.to_string();
        let fts_enabled = self.fts_enabled;
        self.conn
            .call(move |conn| {
                if fts_enabled {
                    let mut stmt = conn.prepare(
                        "SELECT memory_entries.scope, memory_entries.source_key, memory_entries.content
                         FROM memory_entries_fts
                         JOIN memory_entries ON memory_entries_fts.rowid = memory_entries.id
                         WHERE memory_entries.scope = ?1
                           AND memory_entries_fts MATCH ?2
                         ORDER BY bm25(memory_entries_fts)
                         LIMIT ?3",
                    )?;
                    let hits = stmt
                        .query_map(
                            rusqlite::params![scope, fts_query, k as i64],
                            |row| {
                                Ok(MemoryHit {
                                    scope: row.get(0)?,
                                    source_key: row.get(1)?,
                                    content: row.get(2)?,
                                })
                            },
                        )?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(hits)
                } else {
                    // Tokenized OR fallback mirroring fts_query_from_text.
                    let terms: Vec<String> = fts_query
                        .split(" OR ")
                        .map(|t| format!("%{t}%"))
                        .collect();
                    if terms.is_empty() {
                        return Ok(Vec::new());
                    }
                    let where_clause = (0..terms.len())
                        .map(|i| format!("content LIKE ?{}", i + 2))
                        .collect::<Vec<_>>()
                        .join(" OR ");
                    let sql = format!(
                        "SELECT scope, source_key, content FROM memory_entries
                         WHERE scope = ?1 AND ({where_clause}) LIMIT {k}"
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let mut params: Vec<&dyn rusqlite::types::ToSql> = vec![&scope];
                    for t in &terms {
                        params.push(t);
                    }
                    let hits = stmt
                        .query_map(params.as_slice(), |row| {
                            Ok(MemoryHit {
                                scope: row.get(0)?,
                                source_key: row.get(1)?,
                                content: row.get(2)?,
                            })
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(hits)
                }
            })
            .await
            .map_err(storage_err)
    }

    /// Ingest a scope's canonical files, then search it.
    pub async fn retrieve(
        &self,
        notes: &NoteStore,
        scope: &MemoryScope,
        query: &str,
        k: usize,
    ) -> Result<Vec<MemoryHit>, MagpieError> {
        let label = scope.label();
        let memory_file = notes.memory_file(scope);
        let today_file = notes.today_file(scope);
        for path in [&memory_file, &today_file] {
            if path.exists() {
                self.ingest_file_if_changed(&label, path).await?;
            }
        }
        self.search(&label, query, k).await
    }

    /// Rescan every known scope directory and reingest. Idempotent.
    pub async fn rebuild(&self, notes: &NoteStore) -> Result<usize, MagpieError> {
        let mut files = 0usize;
        for scope in notes.known_scopes() {
            let label = scope.label();
            for path in notes.scope_files(&scope) {
                self.ingest_file_if_changed(&label, &path).await?;
                files += 1;
            }
        }
        debug!(files, "memory index rebuild complete");
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn chunking_splits_paragraphs_and_bounds_sizes() {
        let text = "tiny\n\nThis paragraph is long enough to index.\n\nSecond paragraph also long enough.";
        let chunks = split_into_chunks(text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("This paragraph"));

        let huge = "x".repeat(5000);
        let chunks = split_into_chunks(&huge);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chars().count(), 1000);
    }

    #[test]
    fn fts_query_sanitizes_and_caps_terms() {
        assert_eq!(fts_query_from_text("hello world"), "hello OR world");
        // Punctuation is stripped and operators are neutralized by casing.
        assert_eq!(
            fts_query_from_text(r#""quoted" AND (grouped)"#),
            "quoted OR and OR grouped"
        );
        assert_eq!(fts_query_from_text("!!!"), "");

        let many: String = (0..40).map(|i| format!("term{i} ")).collect();
        let q = fts_query_from_text(&many);
        assert!(q.split(" OR ").count() <= 16);
    }

    #[tokio::test]
    async fn ingest_and_search_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("note.md");
        std::fs::write(&path, "The user has a golden retriever named Max.\n\nUnrelated paragraph about cooking pasta.").unwrap();

        let index = MemoryIndex::open_in_memory().await.unwrap();
        index.ingest_file_if_changed("global", &path).await.unwrap();

        let hits = index.search("global", "golden retriever", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("Max"));

        let none = index.search("global", "quantum physics", 10).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn search_is_scoped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("note.md");
        std::fs::write(&path, "Session-scoped fact about databases.").unwrap();

        let index = MemoryIndex::open_in_memory().await.unwrap();
        index
            .ingest_file_if_changed("session:a_1", &path)
            .await
            .unwrap();

        let hits = index.search("session:a_1", "databases", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        let other = index.search("global", "databases", 5).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn unchanged_file_is_not_reingested() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("note.md");
        std::fs::write(&path, "A stable fact that should be indexed once.").unwrap();

        let index = MemoryIndex::open_in_memory().await.unwrap();
        index.ingest_file_if_changed("global", &path).await.unwrap();
        index.ingest_file_if_changed("global", &path).await.unwrap();

        let hits = index.search("global", "stable fact", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn modified_file_replaces_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("note.md");
        std::fs::write(&path, "Original content about sailing boats.").unwrap();

        let index = MemoryIndex::open_in_memory().await.unwrap();
        index.ingest_file_if_changed("global", &path).await.unwrap();

        // Ensure the mtime moves even on coarse filesystems.
        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(&path, "Replaced content about mountain hiking.").unwrap();
        index.ingest_file_if_changed("global", &path).await.unwrap();

        assert!(index.search("global", "sailing", 10).await.unwrap().is_empty());
        assert_eq!(index.search("global", "hiking", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retrieve_ingests_scope_files() {
        let dir = tempdir().unwrap();
        let notes = NoteStore::new(dir.path().join("memory"));
        let scope = MemoryScope::Session("telegram:42".to_string());
        notes
            .append_today(&scope, "The deploy password hint is 'swordfish'.")
            .unwrap();

        let index = MemoryIndex::open_in_memory().await.unwrap();
        let hits = index
            .retrieve(&notes, &scope, "deploy password", 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("swordfish"));
    }

    #[tokio::test]
    async fn rebuild_is_idempotent() {
        let dir = tempdir().unwrap();
        let notes = NoteStore::new(dir.path().join("memory"));
        notes
            .append_today(&MemoryScope::Global, "Rebuildable fact number one.")
            .unwrap();
        notes
            .append_today(
                &MemoryScope::Session("a:1".to_string()),
                "Rebuildable fact number two.",
            )
            .unwrap();

        let index = MemoryIndex::open_in_memory().await.unwrap();
        let first = index.rebuild(&notes).await.unwrap();
        let second = index.rebuild(&notes).await.unwrap();
        assert_eq!(first, second);

        let hits = index.search("global", "Rebuildable", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
