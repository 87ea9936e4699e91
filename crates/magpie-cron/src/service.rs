// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The scheduled-job engine.
//!
//! Jobs persist as one JSON file written through a temp file and an atomic
//! rename under an OS advisory lock: an interrupted save leaves either the
//! prior state or the new state, never a torn file. A corrupt store is
//! renamed aside with a warning rather than discarded.
//!
//! One sleeper task waits for the earliest `next_run` across enabled jobs
//! and is woken early when the job set changes.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use magpie_bus::MessageBus;
use magpie_core::{MagpieError, OutboundMessage};

use crate::types::{CronJob, JobKind, JobStore, Schedule};

/// Callback for `kind = task` jobs: runs the agent loop and returns the
/// reply text. Passing a handle (instead of the agent itself) keeps the
/// AgentLoop <-> CronService relationship cycle-free.
pub type JobRunner =
    Arc<dyn Fn(CronJob) -> BoxFuture<'static, Result<String, MagpieError>> + Send + Sync>;

pub struct CronService {
    store_path: PathBuf,
    bus: MessageBus,
    runner: JobRunner,
    jobs: Mutex<Vec<CronJob>>,
    changed: Notify,
}

impl CronService {
    /// Load the job set from `store_path` (creating parent directories).
    pub async fn load(
        store_path: impl Into<PathBuf>,
        bus: MessageBus,
        runner: JobRunner,
    ) -> Result<Self, MagpieError> {
        let store_path = store_path.into();
        if let Some(parent) = store_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let store = read_store(&store_path)?;
        info!(jobs = store.jobs.len(), "cron store loaded");
        Ok(Self {
            store_path,
            bus,
            runner,
            jobs: Mutex::new(store.jobs),
            changed: Notify::new(),
        })
    }

    /// Add a job. The schedule is evaluated immediately; an unparsable
    /// cron expression marks the job `schedule_error` with a warning
    /// instead of silently dropping it.
    pub async fn add_job(
        &self,
        name: &str,
        kind: JobKind,
        schedule: Schedule,
        message: &str,
        deliver: bool,
        target_channel: Option<String>,
        target_chat_id: Option<String>,
    ) -> Result<CronJob, MagpieError> {
        let mut job = CronJob {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            name: name.to_string(),
            kind,
            schedule,
            message: message.to_string(),
            deliver,
            target_channel,
            target_chat_id,
            enabled: true,
            next_run: None,
            last_run: None,
            last_status: None,
        };
        evaluate_schedule(&mut job);

        let mut jobs = self.jobs.lock().await;
        jobs.push(job.clone());
        self.save(&jobs).await?;
        drop(jobs);

        self.changed.notify_one();
        info!(id = job.id.as_str(), name, "cron job added");
        Ok(job)
    }

    /// Remove a job by id. Returns whether it existed.
    pub async fn remove_job(&self, id: &str) -> Result<bool, MagpieError> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        let removed = jobs.len() != before;
        if removed {
            self.save(&jobs).await?;
            self.changed.notify_one();
        }
        Ok(removed)
    }

    /// Enable or disable a job. Returns whether it was found.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, MagpieError> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
            return Ok(false);
        };
        job.enabled = enabled;
        if enabled {
            evaluate_schedule(job);
        } else {
            job.next_run = None;
        }
        self.save(&jobs).await?;
        self.changed.notify_one();
        Ok(true)
    }

    pub async fn list(&self) -> Vec<CronJob> {
        self.jobs.lock().await.clone()
    }

    /// Fire a job now. With `force`, fires even when not yet due.
    pub async fn run_job(&self, id: &str, force: bool) -> Result<bool, MagpieError> {
        let job = {
            let jobs = self.jobs.lock().await;
            let Some(job) = jobs.iter().find(|j| j.id == id) else {
                return Ok(false);
            };
            if !force {
                let due = job
                    .next_run
                    .is_some_and(|next| next <= Utc::now());
                if !job.enabled || !due {
                    return Ok(false);
                }
            }
            job.clone()
        };

        let status = self.fire(&job).await;

        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.last_run = Some(Utc::now());
            job.last_status = Some(status.to_string());
            if matches!(job.schedule, Schedule::At { .. }) {
                // One-shots disable themselves after firing.
                job.enabled = false;
                job.next_run = None;
            } else {
                evaluate_schedule(job);
            }
        }
        self.save(&jobs).await?;
        drop(jobs);
        self.changed.notify_one();
        Ok(true)
    }

    /// The sleeper loop: wait for the earliest due job, fire it, repeat.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("cron scheduler started");
        loop {
            let next = {
                let jobs = self.jobs.lock().await;
                jobs.iter()
                    .filter(|j| j.enabled)
                    .filter_map(|j| j.next_run.map(|t| (t, j.id.clone())))
                    .min()
            };

            match next {
                None => {
                    // Nothing scheduled; sleep until the set changes.
                    tokio::select! {
                        _ = self.changed.notified() => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                Some((due_at, id)) => {
                    let wait = (due_at - Utc::now())
                        .to_std()
                        .unwrap_or(std::time::Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {
                            if let Err(e) = self.run_job(&id, false).await {
                                warn!(id = id.as_str(), error = %e, "cron job execution failed");
                            }
                        }
                        _ = self.changed.notified() => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }
        info!("cron scheduler stopped");
    }

    async fn fire(&self, job: &CronJob) -> &'static str {
        info!(id = job.id.as_str(), name = job.name.as_str(), "cron job firing");
        match job.kind {
            JobKind::Reminder => {
                let (Some(channel), Some(chat_id)) =
                    (job.target_channel.as_deref(), job.target_chat_id.as_deref())
                else {
                    warn!(id = job.id.as_str(), "reminder job has no delivery target");
                    return "error";
                };
                match self
                    .bus
                    .publish_outbound(OutboundMessage::new(channel, chat_id, &job.message))
                    .await
                {
                    Ok(()) => "ok",
                    Err(e) => {
                        warn!(id = job.id.as_str(), error = %e, "reminder delivery failed");
                        "error"
                    }
                }
            }
            JobKind::Task => match (self.runner)(job.clone()).await {
                Ok(reply) => {
                    if job.deliver
                        && let (Some(channel), Some(chat_id)) =
                            (job.target_channel.as_deref(), job.target_chat_id.as_deref())
                        && let Err(e) = self
                            .bus
                            .publish_outbound(OutboundMessage::new(channel, chat_id, &reply))
                            .await
                    {
                        warn!(id = job.id.as_str(), error = %e, "task reply delivery failed");
                    }
                    "ok"
                }
                Err(e) => {
                    warn!(id = job.id.as_str(), error = %e, "task job failed");
                    "error"
                }
            },
        }
    }

    /// Atomic save under the OS lock. A peer instance reloads after the
    /// lock releases.
    async fn save(&self, jobs: &[CronJob]) -> Result<(), MagpieError> {
        let store = JobStore {
            jobs: jobs.to_vec(),
        };
        let path = self.store_path.clone();
        tokio::task::spawn_blocking(move || write_store(&path, &store))
            .await
            .map_err(|e| MagpieError::Internal(format!("cron save task failed: {e}")))?
    }

    /// Re-read the store from disk (used after another process saved).
    pub async fn reload(&self) -> Result<(), MagpieError> {
        let store = read_store(&self.store_path)?;
        *self.jobs.lock().await = store.jobs;
        self.changed.notify_one();
        Ok(())
    }
}

/// Compute and record a job's next run; parse failures mark it
/// `schedule_error` so the user sees the problem.
fn evaluate_schedule(job: &mut CronJob) {
    match job.schedule.next_after(Utc::now()) {
        Ok(next) => {
            job.next_run = next;
            if job.last_status.as_deref() == Some("schedule_error") {
                job.last_status = None;
            }
        }
        Err(e) => {
            warn!(id = job.id.as_str(), error = e.as_str(), "job schedule is invalid");
            job.next_run = None;
            job.last_status = Some("schedule_error".to_string());
        }
    }
}

fn read_store(path: &Path) -> Result<JobStore, MagpieError> {
    if !path.exists() {
        return Ok(JobStore::default());
    }
    let text = fs::read_to_string(path)?;
    match serde_json::from_str(&text) {
        Ok(store) => Ok(store),
        Err(e) => {
            // Never lose the store to a parse error: rename the corrupt
            // file aside and start fresh, loudly.
            let aside = path.with_extension(format!("corrupt-{}", Utc::now().timestamp()));
            warn!(
                path = %path.display(),
                aside = %aside.display(),
                error = %e,
                "cron store is corrupt; moving it aside"
            );
            fs::rename(path, &aside)?;
            Ok(JobStore::default())
        }
    }
}

fn write_store(path: &Path, store: &JobStore) -> Result<(), MagpieError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
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

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut tmp, store).map_err(MagpieError::storage)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| MagpieError::storage(e.error))?;
    debug!(path = %path.display(), jobs = store.jobs.len(), "cron store saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn noop_runner() -> JobRunner {
        Arc::new(|_job| Box::pin(async { Ok("done".to_string()) }))
    }

    fn counting_runner(counter: Arc<AtomicU32>) -> JobRunner {
        Arc::new(move |_job| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("task reply".to_string())
            })
        })
    }

    async fn service(dir: &Path, runner: JobRunner) -> (CronService, MessageBus) {
        let bus = MessageBus::new(16, 16);
        let svc = CronService::load(dir.join("jobs.json"), bus.clone(), runner)
            .await
            .unwrap();
        (svc, bus)
    }

    #[tokio::test]
    async fn add_persists_and_store_parses() {
        let dir = tempdir().unwrap();
        let (svc, _bus) = service(dir.path(), noop_runner()).await;

        for i in 0..3 {
            svc.add_job(
                &format!("job{i}"),
                JobKind::Reminder,
                Schedule::Every { seconds: 3600 },
                "ping",
                false,
                Some("telegram".to_string()),
                Some("42".to_string()),
            )
            .await
            .unwrap();
        }

        // The on-disk store parses back cleanly after every mutation.
        let text = fs::read_to_string(dir.path().join("jobs.json")).unwrap();
        let store: JobStore = serde_json::from_str(&text).unwrap();
        assert_eq!(store.jobs.len(), 3);
        assert!(store.jobs.iter().all(|j| j.next_run.is_some()));
    }

    #[tokio::test]
    async fn no_temp_files_survive_saves() {
        let dir = tempdir().unwrap();
        let (svc, _bus) = service(dir.path(), noop_runner()).await;
        svc.add_job(
            "j",
            JobKind::Reminder,
            Schedule::Every { seconds: 60 },
            "m",
            false,
            Some("c".to_string()),
            Some("1".to_string()),
        )
        .await
        .unwrap();

        let stray: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n != "jobs.json" && n != "jobs.json.lock")
            .collect();
        assert!(stray.is_empty(), "unexpected files: {stray:?}");
    }

    #[tokio::test]
    async fn corrupt_store_is_renamed_aside() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("jobs.json"), "{ not json").unwrap();

        let (svc, _bus) = service(dir.path(), noop_runner()).await;
        assert!(svc.list().await.is_empty());

        let aside_exists = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("corrupt"));
        assert!(aside_exists, "corrupt store should be preserved aside");
    }

    #[tokio::test]
    async fn invalid_cron_expression_marks_schedule_error() {
        let dir = tempdir().unwrap();
        let (svc, _bus) = service(dir.path(), noop_runner()).await;

        let job = svc
            .add_job(
                "broken",
                JobKind::Task,
                Schedule::Cron {
                    expr: "definitely not cron".to_string(),
                    tz: None,
                },
                "do it",
                false,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(job.last_status.as_deref(), Some("schedule_error"));
        assert!(job.next_run.is_none());

        // The broken job is persisted, not silently dropped.
        let listed = svc.list().await;
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn unknown_timezone_marks_schedule_error() {
        let dir = tempdir().unwrap();
        let (svc, _bus) = service(dir.path(), noop_runner()).await;

        let job = svc
            .add_job(
                "lost",
                JobKind::Reminder,
                Schedule::Cron {
                    expr: "0 9 * * *".to_string(),
                    tz: Some("Atlantis/Sunken_City".to_string()),
                },
                "good morning",
                false,
                Some("telegram".to_string()),
                Some("42".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(job.last_status.as_deref(), Some("schedule_error"));
        assert!(job.next_run.is_none());
    }

    #[tokio::test]
    async fn zoned_cron_job_gets_a_next_run() {
        let dir = tempdir().unwrap();
        let (svc, _bus) = service(dir.path(), noop_runner()).await;

        let job = svc
            .add_job(
                "morning-briefing",
                JobKind::Task,
                Schedule::Cron {
                    expr: "0 7 * * *".to_string(),
                    tz: Some("Asia/Tokyo".to_string()),
                },
                "summarize overnight mail",
                false,
                None,
                None,
            )
            .await
            .unwrap();
        assert!(job.last_status.is_none());
        assert!(job.next_run.is_some());
    }

    #[tokio::test]
    async fn run_job_force_updates_state_and_calls_runner() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let (svc, _bus) = service(dir.path(), counting_runner(calls.clone())).await;

        let job = svc
            .add_job(
                "t1",
                JobKind::Task,
                Schedule::Every { seconds: 1000 },
                "hello",
                false,
                None,
                None,
            )
            .await
            .unwrap();

        assert!(svc.run_job(&job.id, true).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let listed = svc.list().await;
        assert_eq!(listed[0].last_status.as_deref(), Some("ok"));
        assert!(listed[0].last_run.is_some());
        assert!(listed[0].next_run.is_some());
    }

    #[tokio::test]
    async fn run_job_without_force_respects_due_time() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let (svc, _bus) = service(dir.path(), counting_runner(calls.clone())).await;

        let job = svc
            .add_job(
                "later",
                JobKind::Task,
                Schedule::Every { seconds: 3600 },
                "hello",
                false,
                None,
                None,
            )
            .await
            .unwrap();

        assert!(!svc.run_job(&job.id, false).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reminder_fires_to_outbound_directly() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let (svc, bus) = service(dir.path(), counting_runner(calls.clone())).await;

        let job = svc
            .add_job(
                "remind",
                JobKind::Reminder,
                Schedule::Every { seconds: 3600 },
                "drink water",
                false,
                Some("telegram".to_string()),
                Some("42".to_string()),
            )
            .await
            .unwrap();
        svc.run_job(&job.id, true).await.unwrap();

        // Straight to outbound; the agent runner was never involved.
        let out = bus.next_outbound().await.unwrap();
        assert_eq!(out.content, "drink water");
        assert_eq!(out.channel, "telegram");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn task_with_deliver_publishes_reply() {
        let dir = tempdir().unwrap();
        let (svc, bus) = service(dir.path(), noop_runner()).await;

        let job = svc
            .add_job(
                "morning",
                JobKind::Task,
                Schedule::Every { seconds: 3600 },
                "summarize the news",
                true,
                Some("telegram".to_string()),
                Some("42".to_string()),
            )
            .await
            .unwrap();
        svc.run_job(&job.id, true).await.unwrap();

        let out = bus.next_outbound().await.unwrap();
        assert_eq!(out.content, "done");
    }

    #[tokio::test]
    async fn one_shot_disables_after_firing() {
        let dir = tempdir().unwrap();
        let (svc, bus) = service(dir.path(), noop_runner()).await;

        let job = svc
            .add_job(
                "once",
                JobKind::Reminder,
                Schedule::At {
                    at: Utc::now() + chrono::Duration::hours(1),
                },
                "one time",
                false,
                Some("telegram".to_string()),
                Some("42".to_string()),
            )
            .await
            .unwrap();
        svc.run_job(&job.id, true).await.unwrap();
        let _ = bus.next_outbound().await;

        let listed = svc.list().await;
        assert!(!listed[0].enabled);
        assert!(listed[0].next_run.is_none());
    }

    #[tokio::test]
    async fn remove_and_enable_round_trip() {
        let dir = tempdir().unwrap();
        let (svc, _bus) = service(dir.path(), noop_runner()).await;

        let job = svc
            .add_job(
                "toggle",
                JobKind::Task,
                Schedule::Every { seconds: 60 },
                "x",
                false,
                None,
                None,
            )
            .await
            .unwrap();

        assert!(svc.set_enabled(&job.id, false).await.unwrap());
        assert!(svc.list().await[0].next_run.is_none());
        assert!(svc.set_enabled(&job.id, true).await.unwrap());
        assert!(svc.list().await[0].next_run.is_some());

        assert!(svc.remove_job(&job.id).await.unwrap());
        assert!(!svc.remove_job(&job.id).await.unwrap());
        assert!(svc.list().await.is_empty());
    }

    #[tokio::test]
    async fn scheduler_fires_due_jobs() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let (svc, _bus) = service(dir.path(), counting_runner(calls.clone())).await;
        let svc = Arc::new(svc);

        svc.add_job(
            "fast",
            JobKind::Task,
            Schedule::Every { seconds: 1 },
            "tick",
            false,
            None,
            None,
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        let svc2 = svc.clone();
        let cancel2 = cancel.clone();
        let scheduler = tokio::spawn(async move { svc2.run(cancel2).await });

        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        cancel.cancel();
        let _ = scheduler.await;

        assert!(
            calls.load(Ordering::SeqCst) >= 1,
            "scheduler should have fired the every-1s job"
        );
    }

    #[tokio::test]
    async fn reload_picks_up_external_changes() {
        let dir = tempdir().unwrap();
        let (svc_a, _bus_a) = service(dir.path(), noop_runner()).await;
        let (svc_b, _bus_b) = service(dir.path(), noop_runner()).await;

        svc_a
            .add_job(
                "shared",
                JobKind::Task,
                Schedule::Every { seconds: 60 },
                "x",
                false,
                None,
                None,
            )
            .await
            .unwrap();

        assert!(svc_b.list().await.is_empty());
        svc_b.reload().await.unwrap();
        assert_eq!(svc_b.list().await.len(), 1);
    }
}
