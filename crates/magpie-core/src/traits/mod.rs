// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Adapter traits that external integrations implement.

pub mod provider;

pub use provider::LlmProvider;
