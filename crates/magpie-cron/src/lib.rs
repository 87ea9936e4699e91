// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Timed execution for the Magpie agent: a persistent cron-style job
//! engine and the heartbeat wake-up service.
//!
//! Both invoke the agent through an async callback handle rather than
//! holding the agent itself, keeping the dependency graph acyclic.

pub mod heartbeat;
pub mod service;
pub mod types;

pub use heartbeat::{HEARTBEAT_FILE, HEARTBEAT_OK, HeartbeatRunner, HeartbeatService};
pub use service::{CronService, JobRunner};
pub use types::{CronJob, JobKind, JobStore, Schedule};
