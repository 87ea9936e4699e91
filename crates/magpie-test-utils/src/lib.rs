// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test doubles for the Magpie kernel.
//!
//! `MockProvider` scripts LLM responses (including tool calls) and records
//! every request it received; `MockChannel` injects inbound messages and
//! captures outbound deliveries. Both enable fast, CI-runnable tests with
//! no external services.

pub mod mock_channel;
pub mod mock_provider;

pub use mock_channel::MockChannel;
pub use mock_provider::MockProvider;
