// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The tool registry.
//!
//! `execute` never raises to the caller: every failure path produces an
//! `"Error: ..."` string. Cacheable tools get an LRU+TTL result cache and
//! an in-flight map that deduplicates concurrent identical calls. The
//! in-flight entry is owned by an RAII guard so the fingerprint is removed
//! on *every* exit path -- success, tool error, panic, or cancellation of
//! the awaiting task.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lru::LruCache;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use magpie_core::{MagpieError, ToolCallRequest, ToolDefinition};

use crate::tool::{ExecutionContext, Tool};
use crate::validate::validate_args;

/// Whether a tool result string represents a failure.
///
/// Tools and the registry both spell failures with these prefixes, which
/// the agent loop's error-streak accounting keys on.
pub fn is_tool_error(result: &str) -> bool {
    let s = result.trim_start();
    s.starts_with("Error:") || s.starts_with("Error executing")
}

/// Tunables for a registry instance.
#[derive(Debug, Clone)]
pub struct ToolRegistryConfig {
    /// Maximum concurrent calls within one `execute_batch`.
    pub parallelism: usize,
    /// Result cache entries.
    pub cache_entries: usize,
    /// Default TTL for cached results.
    pub cache_ttl: Duration,
    /// Default per-call timeout when a tool declares none.
    pub default_timeout: Duration,
    /// Optional allowlist restricting what `describe` exposes and
    /// `execute` permits.
    pub allowed_tools: Option<Vec<String>>,
}

impl Default for ToolRegistryConfig {
    fn default() -> Self {
        Self {
            parallelism: 8,
            cache_entries: 256,
            cache_ttl: Duration::from_secs(300),
            default_timeout: Duration::from_secs(60),
            allowed_tools: None,
        }
    }
}

#[derive(Clone)]
struct CacheEntry {
    value: String,
    inserted: Instant,
    ttl: Duration,
}

type SharedResult = Result<String, String>;
type InFlightFuture = Shared<BoxFuture<'static, SharedResult>>;

/// Registry of available tools, indexed by name.
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
    allowed: Option<HashSet<String>>,
    cache: Mutex<LruCache<String, CacheEntry>>,
    in_flight: DashMap<String, InFlightFuture>,
    semaphore: Arc<Semaphore>,
    config: ToolRegistryConfig,
}

impl ToolRegistry {
    pub fn new(config: ToolRegistryConfig) -> Self {
        let cap = NonZeroUsize::new(config.cache_entries.max(1)).unwrap();
        Self {
            tools: DashMap::new(),
            allowed: config
                .allowed_tools
                .as_ref()
                .map(|names| names.iter().cloned().collect()),
            cache: Mutex::new(LruCache::new(cap)),
            in_flight: DashMap::new(),
            semaphore: Arc::new(Semaphore::new(config.parallelism.max(1))),
            config,
        }
    }

    /// Register a tool. Fails on name collision.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), MagpieError> {
        let name = tool.name().to_string();
        match self.tools.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(MagpieError::Validation(format!(
                "tool '{name}' is already registered"
            ))),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(tool);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|t| t.clone())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn is_allowed(&self, name: &str) -> bool {
        self.allowed.as_ref().is_none_or(|set| set.contains(name))
    }

    /// Allowlisted tool definitions, sorted by name for deterministic
    /// prompts.
    pub fn describe(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .iter()
            .filter(|entry| self.is_allowed(entry.key()))
            .map(|entry| entry.value().definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Tool names currently exposed (after the allowlist filter).
    pub fn tool_names(&self) -> Vec<String> {
        self.describe().into_iter().map(|d| d.name).collect()
    }

    fn fingerprint(name: &str, args: &Value) -> String {
        // serde_json's default map is ordered, so serialization is
        // canonical for identical argument sets.
        let canonical = serde_json::to_string(args).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Execute a tool by name. Never raises: all failures come back as
    /// `"Error: ..."` strings.
    pub async fn execute(&self, name: &str, args: Value, ctx: &ExecutionContext) -> String {
        if !self.is_allowed(name) {
            return format!("Error: tool '{name}' is not permitted");
        }
        let Some(tool) = self.get(name) else {
            return format!("Error: tool '{name}' not found");
        };

        // Validation failures return before any in-flight bookkeeping, so
        // they can never leave an orphaned entry behind.
        if let Some(message) = validate_args(name, &tool.parameters_schema(), &args) {
            warn!(tool = name, "tool argument validation failed");
            return format!("Error: {message}");
        }

        if !tool.cacheable() {
            return match self.run_tool(tool, args, ctx.clone()).await {
                Ok(value) | Err(value) => value,
            };
        }

        let fp = Self::fingerprint(name, &args);

        {
            let mut cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&fp) {
                if entry.inserted.elapsed() < entry.ttl {
                    debug!(tool = name, "tool cache hit");
                    return entry.value.clone();
                }
                cache.pop(&fp);
            }
        }

        // Join an identical in-flight call when one exists; otherwise
        // insert ours. The guard removes the entry when this call leaves
        // scope for any reason.
        let (fut, guard) = match self.in_flight.entry(fp.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                debug!(tool = name, "joining in-flight tool call");
                (existing.get().clone(), None)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let tool = tool.clone();
                let args = args.clone();
                let ctx = ctx.clone();
                let timeout = tool.timeout().unwrap_or(self.config.default_timeout);
                let retries = tool.max_retries();
                let fut: InFlightFuture =
                    run_tool_with_retries(tool, args, ctx, timeout, retries)
                        .boxed()
                        .shared();
                vacant.insert(fut.clone());
                (
                    fut,
                    Some(InFlightGuard {
                        map: &self.in_flight,
                        key: fp.clone(),
                    }),
                )
            }
        };

        let result = fut.await;
        drop(guard);

        match result {
            Ok(value) => {
                let ttl = tool.cache_ttl().unwrap_or(self.config.cache_ttl);
                self.cache.lock().await.put(
                    fp,
                    CacheEntry {
                        value: value.clone(),
                        inserted: Instant::now(),
                        ttl,
                    },
                );
                value
            }
            Err(message) => message,
        }
    }

    async fn run_tool(
        &self,
        tool: Arc<dyn Tool>,
        args: Value,
        ctx: ExecutionContext,
    ) -> SharedResult {
        let timeout = tool.timeout().unwrap_or(self.config.default_timeout);
        let retries = tool.max_retries();
        run_tool_with_retries(tool, args, ctx, timeout, retries).await
    }

    /// Execute a batch of calls with bounded parallelism, preserving input
    /// order in the results. Individual failures (including panics) come
    /// back as error strings.
    pub async fn execute_batch(
        self: &Arc<Self>,
        calls: &[ToolCallRequest],
        ctx: &ExecutionContext,
    ) -> Vec<String> {
        if calls.is_empty() {
            return Vec::new();
        }
        if calls.len() == 1 {
            let call = &calls[0];
            return vec![self.execute(&call.name, call.arguments.clone(), ctx).await];
        }

        let handles: Vec<_> = calls
            .iter()
            .map(|call| {
                let registry = Arc::clone(self);
                let name = call.name.clone();
                let args = call.arguments.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let _permit = registry
                        .semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("tool semaphore closed");
                    registry.execute(&name, args, &ctx).await
                })
            })
            .collect();

        futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "tool task panicked");
                    "Error: tool crashed unexpectedly".to_string()
                }
            })
            .collect()
    }

    /// Number of in-flight deduplicated calls (diagnostics and tests).
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}

/// Removes the in-flight entry when the inserting call exits, no matter
/// how. This is the property that keeps a failed or cancelled call from
/// wedging every later identical call.
struct InFlightGuard<'a> {
    map: &'a DashMap<String, InFlightFuture>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Run a tool with a timeout per attempt and retries on transient errors,
/// honoring cancellation between and during attempts.
async fn run_tool_with_retries(
    tool: Arc<dyn Tool>,
    args: Value,
    ctx: ExecutionContext,
    timeout: Duration,
    max_retries: u32,
) -> SharedResult {
    let name = tool.name().to_string();
    let mut attempt = 0u32;
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(format!("Error executing {name}: cancelled"));
        }

        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(format!("Error executing {name}: cancelled"));
            }
            result = tokio::time::timeout(timeout, tool.execute(args.clone(), &ctx)) => result,
        };

        let error: MagpieError = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => MagpieError::Timeout { duration: timeout },
        };

        if error.is_transient() && attempt < max_retries {
            let delay = Duration::from_secs_f64(
                (2f64.powi(attempt as i32) * 0.25 + fastrand::f64() * 0.1).min(10.0),
            );
            warn!(
                tool = name.as_str(),
                attempt = attempt + 1,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "tool failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            continue;
        }

        return Err(format!("Error executing {name}: {error}"));
    }
}
