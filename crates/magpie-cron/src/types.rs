// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scheduled job types and schedule evaluation.

use chrono::{DateTime, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};

/// What firing a job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Runs the agent loop via `process_direct`.
    Task,
    /// Delivered straight to the target chat, bypassing the agent.
    Reminder,
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schedule {
    /// Standard five-field cron expression, evaluated in `tz` (an IANA
    /// zone name) when given, otherwise in UTC.
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
    /// Fixed interval in seconds.
    Every { seconds: u64 },
    /// One-shot at a specific time; the job disables itself after firing.
    At { at: DateTime<Utc> },
}

impl Schedule {
    /// Next fire time after `now`, or an error for an unparsable cron
    /// expression or unknown timezone. A past one-shot returns `Ok(None)`.
    ///
    /// Results are always returned in UTC; a `tz` only changes which
    /// wall clock the expression's fields are read against.
    pub fn next_after(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, String> {
        match self {
            Schedule::Cron { expr, tz } => {
                let cron = Cron::new(expr)
                    .parse()
                    .map_err(|e| format!("invalid cron expression '{expr}': {e}"))?;
                match tz.as_deref() {
                    Some(name) => {
                        let zone: chrono_tz::Tz = name
                            .parse()
                            .map_err(|_| format!("unknown timezone '{name}'"))?;
                        let local_next = cron
                            .find_next_occurrence(&now.with_timezone(&zone), false)
                            .map_err(|e| format!("no next occurrence for '{expr}': {e}"))?;
                        Ok(Some(local_next.with_timezone(&Utc)))
                    }
                    None => cron
                        .find_next_occurrence(&now, false)
                        .map(Some)
                        .map_err(|e| format!("no next occurrence for '{expr}': {e}")),
                }
            }
            Schedule::Every { seconds } => {
                Ok(Some(now + chrono::Duration::seconds((*seconds).max(1) as i64)))
            }
            Schedule::At { at } => Ok((*at > now).then_some(*at)),
        }
    }
}

/// One persistent scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub kind: JobKind,
    pub schedule: Schedule,
    /// The reminder text, or the prompt handed to the agent for tasks.
    pub message: String,
    /// For tasks: whether the agent's reply is delivered to the target.
    #[serde(default)]
    pub deliver: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_chat_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    /// "ok", "error", or "schedule_error" after the last evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// The persisted job set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStore {
    #[serde(default)]
    pub jobs: Vec<CronJob>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn every_schedule_advances_by_interval() {
        let schedule = Schedule::Every { seconds: 300 };
        let next = schedule.next_after(now()).unwrap().unwrap();
        assert_eq!((next - now()).num_seconds(), 300);
    }

    #[test]
    fn cron_schedule_finds_next_occurrence() {
        let schedule = Schedule::Cron {
            expr: "0 9 * * *".to_string(),
            tz: None,
        };
        let next = schedule.next_after(now()).unwrap().unwrap();
        assert_eq!(next.format("%H:%M").to_string(), "09:00");
        assert!(next > now());
    }

    #[test]
    fn cron_schedule_respects_timezone() {
        // Feb 6, 2026 is standard time in New York (UTC-5): with "now" at
        // 13:30 UTC, the next 09:00 America/New_York is 14:00 UTC that day.
        let now = Utc.with_ymd_and_hms(2026, 2, 6, 13, 30, 0).unwrap();
        let schedule = Schedule::Cron {
            expr: "0 9 * * *".to_string(),
            tz: Some("America/New_York".to_string()),
        };
        let next = schedule.next_after(now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 6, 14, 0, 0).unwrap());
    }

    #[test]
    fn cron_schedule_without_tz_reads_utc() {
        // Same expression with no tz: 08:59 UTC rolls to 09:00 UTC.
        let now = Utc.with_ymd_and_hms(2026, 2, 6, 8, 59, 0).unwrap();
        let schedule = Schedule::Cron {
            expr: "0 9 * * *".to_string(),
            tz: None,
        };
        let next = schedule.next_after(now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 6, 9, 0, 0).unwrap());
    }

    #[test]
    fn invalid_cron_expression_is_an_error() {
        let schedule = Schedule::Cron {
            expr: "not a cron".to_string(),
            tz: None,
        };
        let err = schedule.next_after(now()).unwrap_err();
        assert!(err.contains("invalid cron expression"));
    }

    #[test]
    fn unknown_timezone_is_an_error() {
        let schedule = Schedule::Cron {
            expr: "0 9 * * *".to_string(),
            tz: Some("Mars/Olympus_Mons".to_string()),
        };
        let err = schedule.next_after(now()).unwrap_err();
        assert!(err.contains("unknown timezone"));
    }

    #[test]
    fn past_one_shot_yields_none() {
        let schedule = Schedule::At {
            at: now() - chrono::Duration::hours(1),
        };
        assert!(schedule.next_after(now()).unwrap().is_none());

        let future = Schedule::At {
            at: now() + chrono::Duration::hours(1),
        };
        assert!(future.next_after(now()).unwrap().is_some());
    }

    #[test]
    fn job_store_round_trips_through_json() {
        let store = JobStore {
            jobs: vec![CronJob {
                id: "j1".to_string(),
                name: "standup".to_string(),
                kind: JobKind::Reminder,
                schedule: Schedule::Cron {
                    expr: "0 9 * * 1-5".to_string(),
                    tz: Some("Europe/Berlin".to_string()),
                },
                message: "Standup in 5".to_string(),
                deliver: false,
                target_channel: Some("telegram".to_string()),
                target_chat_id: Some("42".to_string()),
                enabled: true,
                next_run: None,
                last_run: None,
                last_status: None,
            }],
        };
        let json = serde_json::to_string_pretty(&store).unwrap();
        let parsed: JobStore = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.jobs.len(), 1);
        assert_eq!(parsed.jobs[0].kind, JobKind::Reminder);
        assert_eq!(
            parsed.jobs[0].schedule,
            Schedule::Cron {
                expr: "0 9 * * 1-5".to_string(),
                tz: Some("Europe/Berlin".to_string()),
            }
        );
    }
}
