// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tool trait and registry for the Magpie agent kernel.
//!
//! The [`Tool`] trait is the boundary the kernel exposes to tool
//! implementations; the [`ToolRegistry`] owns validation, result caching,
//! concurrent-call deduplication, retries, timeouts, and bounded parallel
//! batch execution.

pub mod registry;
pub mod tool;
pub mod validate;

pub use registry::{ToolRegistry, ToolRegistryConfig, is_tool_error};
pub use tool::{ExecutionContext, Tool};
pub use validate::validate_args;
