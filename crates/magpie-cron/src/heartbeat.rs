// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Periodic workspace-file-driven wake-ups.
//!
//! On every tick the service reads `HEARTBEAT.md` from the workspace. If
//! the file has any actionable line -- anything other than headers, blank
//! lines, checked items, or empty checkboxes -- the agent is invoked with a
//! fixed instruction to process unchecked items. A sentinel response means
//! "nothing to do" and is dropped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use magpie_core::MagpieError;

/// Sentinel reply indicating the heartbeat found nothing actionable.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

/// The file read on each tick, relative to the workspace.
pub const HEARTBEAT_FILE: &str = "HEARTBEAT.md";

/// Callback invoking the agent loop (`process_direct`) with the heartbeat
/// prompt, returning the agent's reply.
pub type HeartbeatRunner =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<String, MagpieError>> + Send + Sync>;

pub struct HeartbeatService {
    workspace: PathBuf,
    interval: Duration,
    runner: HeartbeatRunner,
}

impl HeartbeatService {
    pub fn new(workspace: impl Into<PathBuf>, interval_secs: u64, runner: HeartbeatRunner) -> Self {
        Self {
            workspace: workspace.into(),
            interval: Duration::from_secs(interval_secs.max(1)),
            runner,
        }
    }

    /// Tick forever until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "heartbeat service started");
        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await; // skip the immediate first tick
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = cancel.cancelled() => {
                    info!("heartbeat service stopped");
                    return;
                }
            }
        }
    }

    /// One heartbeat evaluation. Public so hosts and tests can trigger it
    /// directly.
    pub async fn tick(&self) {
        let path = self.workspace.join(HEARTBEAT_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => {
                debug!(path = %path.display(), "no heartbeat file, skipping tick");
                return;
            }
        };

        if !has_actionable_items(&content) {
            debug!("heartbeat file has no actionable items");
            return;
        }

        let prompt = format!(
            "Read {HEARTBEAT_FILE} in your workspace and process any unchecked items. \
             Mark items done when you complete them. If nothing needs doing, reply \
             with exactly: {HEARTBEAT_OK}"
        );

        match (self.runner)(prompt).await {
            Ok(reply) if reply.trim().starts_with(HEARTBEAT_OK) => {
                debug!("heartbeat: nothing to report");
            }
            Ok(reply) => {
                info!(reply_len = reply.len(), "heartbeat produced actionable output");
            }
            Err(e) => {
                warn!(error = %e, "heartbeat run failed (non-fatal)");
            }
        }
    }
}

/// Whether the heartbeat file contains anything worth waking the agent
/// for. Headers, blank lines, checked items, and empty `- [ ]` markers do
/// not count.
pub fn has_actionable_items(content: &str) -> bool {
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("- [ ]") {
            if !rest.trim().is_empty() {
                return true;
            }
            continue;
        }
        if trimmed.starts_with("- [x]") || trimmed.starts_with("- [X]") {
            continue;
        }
        // Any other non-empty line counts as a task.
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn recording_runner(calls: Arc<AtomicU32>, reply: &'static str) -> HeartbeatRunner {
        Arc::new(move |_prompt| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(reply.to_string())
            })
        })
    }

    #[test]
    fn plain_task_lines_are_actionable() {
        assert!(has_actionable_items("Do the thing\n"));
        assert!(has_actionable_items("- [ ] water the plants\n"));
    }

    #[test]
    fn headers_blanks_and_checked_items_are_not() {
        assert!(!has_actionable_items(""));
        assert!(!has_actionable_items("# Tasks\n\n"));
        assert!(!has_actionable_items("# Tasks\n\n- [ ]\n"));
        assert!(!has_actionable_items("- [x] already done\n- [X] this too\n"));
    }

    #[test]
    fn mixed_file_with_one_open_item_is_actionable() {
        let content = "# Tasks\n- [x] done thing\n- [ ] open thing\n";
        assert!(has_actionable_items(content));
    }

    #[tokio::test]
    async fn tick_invokes_runner_when_tasks_exist() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(HEARTBEAT_FILE), "Do the thing\n").unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let svc = HeartbeatService::new(dir.path(), 999_999, recording_runner(calls.clone(), HEARTBEAT_OK));
        svc.tick().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tick_skips_when_file_is_effectively_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(HEARTBEAT_FILE), "# Tasks\n\n- [ ]\n").unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let svc = HeartbeatService::new(dir.path(), 999_999, recording_runner(calls.clone(), HEARTBEAT_OK));
        svc.tick().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tick_skips_when_file_is_missing() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let svc = HeartbeatService::new(dir.path(), 999_999, recording_runner(calls.clone(), HEARTBEAT_OK));
        svc.tick().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_ticks_on_interval_until_cancelled() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(HEARTBEAT_FILE), "- [ ] recurring\n").unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let svc = Arc::new(HeartbeatService::new(
            dir.path(),
            1,
            recording_runner(calls.clone(), HEARTBEAT_OK),
        ));

        let cancel = CancellationToken::new();
        let svc2 = svc.clone();
        let cancel2 = cancel.clone();
        let task = tokio::spawn(async move { svc2.run(cancel2).await });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        let _ = task.await;

        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
