// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Admission checks channels apply before publishing to the bus.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Allowlist plus per-sender rate limiting for one channel.
///
/// Rate limiting is scoped to `(channel, sender_id)` -- the guard belongs
/// to a single channel, so the key here is just the sender. Shared-sender
/// fairness across chats is a channel-level policy.
pub struct ChannelGuard {
    allow_from: Vec<String>,
    rate_limit: Duration,
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl ChannelGuard {
    pub fn new(allow_from: Vec<String>, rate_limit_secs: u64) -> Self {
        Self {
            allow_from,
            rate_limit: Duration::from_secs(rate_limit_secs),
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `sender_id` is on the allowlist. An empty list allows
    /// everyone. Pipe-separated compound ids ("id|username") match if any
    /// part is allowed.
    pub fn is_allowed(&self, sender_id: &str) -> bool {
        if self.allow_from.is_empty() {
            return true;
        }
        if self.allow_from.iter().any(|a| a == sender_id) {
            return true;
        }
        sender_id
            .split('|')
            .any(|part| !part.is_empty() && self.allow_from.iter().any(|a| a == part))
    }

    /// Record an arrival from `sender_id`; `false` means the sender is
    /// inside the rate window and the message should be dropped.
    pub fn admit(&self, sender_id: &str) -> bool {
        if self.rate_limit.is_zero() {
            return true;
        }
        let now = Instant::now();
        let mut seen = self.last_seen.lock().expect("rate limit map poisoned");
        if let Some(last) = seen.get(sender_id)
            && now.duration_since(*last) < self.rate_limit
        {
            return false;
        }
        seen.insert(sender_id.to_string(), now);
        true
    }

    /// Combined check: allowlisted and outside the rate window.
    pub fn check(&self, sender_id: &str) -> bool {
        self.is_allowed(sender_id) && self.admit(sender_id)
    }
}
