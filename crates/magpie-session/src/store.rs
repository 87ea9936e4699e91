// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The session store: load, append, settings, list, delete.

use std::fs;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use magpie_core::{MagpieError, SessionSettings, Turn};

use crate::safe_key::{collision_suffix, sanitize_key};

/// An in-memory session: the ordered turns plus bookkeeping timestamps.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: String,
    pub turns: Vec<Turn>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    fn new(key: &str) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            turns: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.updated_at = Utc::now();
    }

    /// The most recent `max` turns, oldest first.
    pub fn recent_turns(&self, max: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(max);
        &self.turns[start..]
    }
}

/// Summary row returned by [`SessionStore::list`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub key: String,
    pub updated_at: DateTime<Utc>,
}

/// Metadata first line of a session log file.
#[derive(Debug, Serialize, Deserialize)]
struct MetaLine {
    #[serde(rename = "_type")]
    record_type: String,
    key: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

struct CachedSession {
    session: Session,
    /// File mtime observed at load/save, for cross-process invalidation.
    mtime: Option<SystemTime>,
}

/// Manages conversation sessions stored as JSONL files.
pub struct SessionStore {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    cache: Mutex<LruCache<String, CachedSession>>,
    /// Count of records dropped as malformed during loads.
    malformed_records: AtomicU64,
}

impl SessionStore {
    /// Open (and create) the store at `dir`.
    pub fn new(dir: impl Into<PathBuf>, cache_entries: usize) -> Result<Self, MagpieError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let cap = NonZeroUsize::new(cache_entries.max(1)).unwrap();
        Ok(Self {
            dir,
            locks: DashMap::new(),
            cache: Mutex::new(LruCache::new(cap)),
            malformed_records: AtomicU64::new(0),
        })
    }

    /// Total malformed records skipped since the store was opened.
    pub fn malformed_record_count(&self) -> u64 {
        self.malformed_records.load(Ordering::Relaxed)
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Resolve the log path for `key`, disambiguating sanitized-name
    /// collisions with a content-hash suffix.
    fn log_path(&self, key: &str) -> PathBuf {
        let base = sanitize_key(key);
        let candidate = self.dir.join(format!("{base}.log"));
        if let Some(existing_key) = read_meta_key(&candidate)
            && existing_key != key
        {
            let suffixed = format!("{base}-{}", collision_suffix(key));
            return self.dir.join(format!("{suffixed}.log"));
        }
        candidate
    }

    fn settings_path(&self, key: &str) -> PathBuf {
        self.log_path(key).with_extension("settings")
    }

    fn lock_path(log_path: &Path) -> PathBuf {
        let mut p = log_path.as_os_str().to_owned();
        p.push(".lock");
        PathBuf::from(p)
    }

    /// Load a session, creating an empty one if none exists on disk.
    ///
    /// Malformed record lines are skipped and counted, never fatal.
    pub async fn load(&self, key: &str) -> Result<Session, MagpieError> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.load_locked(key).await
    }

    /// Append a turn and persist. The read-modify-write holds the per-key
    /// lock throughout, so concurrent appends never lose turns.
    pub async fn append(&self, key: &str, turn: Turn) -> Result<(), MagpieError> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        let mut session = self.load_locked(key).await?;
        session.add_turn(turn);
        self.save_locked(&session).await
    }

    /// Persist a session atomically: serialize to a temp file in the same
    /// directory, fsync, rename over the log. In-process saves serialize on
    /// the per-key mutex; other processes serialize on the OS lock.
    pub async fn save(&self, session: &Session) -> Result<(), MagpieError> {
        let lock = self.key_lock(&session.key);
        let _guard = lock.lock().await;
        self.save_locked(session).await
    }

    /// Load body; caller holds the per-key lock.
    async fn load_locked(&self, key: &str) -> Result<Session, MagpieError> {
        let path = self.log_path(key);
        {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(key) {
                // Another process may have rewritten the file; compare mtime.
                let disk_mtime = file_mtime(&path);
                if cached.mtime == disk_mtime {
                    return Ok(cached.session.clone());
                }
                debug!(key, "session cache stale, reloading from disk");
            }
        }

        let (session, mtime, malformed) = {
            let key = key.to_string();
            let path = path.clone();
            tokio::task::spawn_blocking(move || read_session(&key, &path))
                .await
                .map_err(|e| MagpieError::Internal(format!("session load task failed: {e}")))??
        };
        if malformed > 0 {
            self.malformed_records
                .fetch_add(malformed, Ordering::Relaxed);
            warn!(key, skipped = malformed, "skipped malformed session records");
        }

        self.cache.lock().await.put(
            key.to_string(),
            CachedSession {
                session: session.clone(),
                mtime,
            },
        );
        Ok(session)
    }

    /// Save body; caller holds the per-key lock.
    async fn save_locked(&self, session: &Session) -> Result<(), MagpieError> {
        let path = self.log_path(&session.key);
        let mtime = {
            let session = session.clone();
            let path = path.clone();
            tokio::task::spawn_blocking(move || write_session(&session, &path))
                .await
                .map_err(|e| MagpieError::Internal(format!("session save task failed: {e}")))??
        };

        self.cache.lock().await.put(
            session.key.clone(),
            CachedSession {
                session: session.clone(),
                mtime,
            },
        );
        Ok(())
    }

    /// Load the settings sidecar; defaults when absent or unreadable.
    pub async fn load_settings(&self, key: &str) -> Result<SessionSettings, MagpieError> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        let path = self.settings_path(key);
        let settings = tokio::task::spawn_blocking(move || -> SessionSettings {
            match fs::read_to_string(&path) {
                Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                    warn!(path = %path.display(), error = %e, "unreadable settings record, using defaults");
                    SessionSettings::default()
                }),
                Err(_) => SessionSettings::default(),
            }
        })
        .await
        .map_err(|e| MagpieError::Internal(format!("settings load task failed: {e}")))?;
        Ok(settings)
    }

    /// Persist settings last-writer-wins, with the same locking discipline
    /// as session saves.
    pub async fn save_settings(
        &self,
        key: &str,
        settings: &SessionSettings,
    ) -> Result<(), MagpieError> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        let path = self.settings_path(key);
        let log_path = self.log_path(key);
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || -> Result<(), MagpieError> {
            with_os_lock(&Self::lock_path(&log_path), || {
                let mut tmp = tempfile::NamedTempFile::new_in(
                    path.parent().unwrap_or_else(|| Path::new(".")),
                )?;
                serde_json::to_writer(&mut tmp, &settings).map_err(MagpieError::storage)?;
                tmp.flush()?;
                tmp.as_file().sync_all()?;
                tmp.persist(&path)
                    .map_err(|e| MagpieError::storage(e.error))?;
                Ok(())
            })
        })
        .await
        .map_err(|e| MagpieError::Internal(format!("settings save task failed: {e}")))?
    }

    /// All sessions on disk, newest first.
    pub async fn list(&self) -> Result<Vec<SessionInfo>, MagpieError> {
        let dir = self.dir.clone();
        let mut infos = tokio::task::spawn_blocking(move || -> Result<Vec<SessionInfo>, MagpieError> {
            let mut out = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("log") {
                    continue;
                }
                match read_meta(&path) {
                    Some(meta) => out.push(SessionInfo {
                        key: meta.key,
                        updated_at: meta.updated_at,
                    }),
                    None => {
                        warn!(path = %path.display(), "session log without readable metadata, skipping");
                    }
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| MagpieError::Internal(format!("session list task failed: {e}")))??;
        infos.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(infos)
    }

    /// Delete a session's history and settings. Returns whether anything
    /// was removed.
    pub async fn delete(&self, key: &str) -> Result<bool, MagpieError> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        self.cache.lock().await.pop(key);
        let log = self.log_path(key);
        let settings = self.settings_path(key);
        let removed = tokio::task::spawn_blocking(move || -> Result<bool, MagpieError> {
            let removed = with_os_lock(&Self::lock_path(&log), || {
                let mut removed = false;
                if log.exists() {
                    fs::remove_file(&log)?;
                    removed = true;
                }
                if settings.exists() {
                    fs::remove_file(&settings)?;
                    removed = true;
                }
                Ok(removed)
            })?;
            let _ = fs::remove_file(Self::lock_path(&log));
            Ok(removed)
        })
        .await
        .map_err(|e| MagpieError::Internal(format!("session delete task failed: {e}")))??;
        Ok(removed)
    }
}

/// Run `f` while holding the OS advisory lock at `path`.
///
/// Blocks until a peer process releases. Only called from blocking
/// sections (`spawn_blocking`).
fn with_os_lock<T>(
    path: &Path,
    f: impl FnOnce() -> Result<T, MagpieError>,
) -> Result<T, MagpieError> {
    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    let mut lock = fd_lock::RwLock::new(file);
    let _guard = lock.write()?;
    f()
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn read_meta_key(path: &Path) -> Option<String> {
    read_meta(path).map(|m| m.key)
}

fn read_meta(path: &Path) -> Option<MetaLine> {
    let text = fs::read_to_string(path).ok()?;
    let first = text.lines().next()?;
    let meta: MetaLine = serde_json::from_str(first).ok()?;
    (meta.record_type == "meta").then_some(meta)
}

/// Read a session file. Returns the session, observed mtime, and the count
/// of malformed lines skipped.
fn read_session(
    key: &str,
    path: &Path,
) -> Result<(Session, Option<SystemTime>, u64), MagpieError> {
    if !path.exists() {
        return Ok((Session::new(key), None, 0));
    }

    let text = fs::read_to_string(path)?;
    let mut session = Session::new(key);
    let mut malformed = 0u64;

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if idx == 0
            && let Ok(meta) = serde_json::from_str::<MetaLine>(line)
            && meta.record_type == "meta"
        {
            session.created_at = meta.created_at;
            session.updated_at = meta.updated_at;
            continue;
        }
        match serde_json::from_str::<Turn>(line) {
            Ok(turn) => session.turns.push(turn),
            Err(_) => malformed += 1,
        }
    }

    let mtime = file_mtime(path);
    Ok((session, mtime, malformed))
}

/// Write a session file atomically and return the new mtime.
fn write_session(session: &Session, path: &Path) -> Result<Option<SystemTime>, MagpieError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    with_os_lock(&SessionStore::lock_path(path), || {
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        let meta = MetaLine {
            record_type: "meta".to_string(),
            key: session.key.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        };
        serde_json::to_writer(&mut tmp, &meta).map_err(MagpieError::storage)?;
        tmp.write_all(b"\n")?;
        for turn in &session.turns {
            serde_json::to_writer(&mut tmp, turn).map_err(MagpieError::storage)?;
            tmp.write_all(b"\n")?;
        }
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| MagpieError::storage(e.error))?;
        Ok(file_mtime(path))
    })
}
