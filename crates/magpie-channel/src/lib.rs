// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Channel adapter interface and supervision.
//!
//! Channels bridge chat platforms to the message bus. The kernel never
//! speaks a platform's wire protocol; it consumes the [`ChannelAdapter`]
//! trait, runs admission checks through [`ChannelGuard`], and dispatches
//! outbound traffic through the [`ChannelSupervisor`].

pub mod guard;
pub mod supervisor;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use magpie_bus::MessageBus;
use magpie_core::{MagpieError, OutboundMessage};

pub use guard::ChannelGuard;
pub use supervisor::ChannelSupervisor;

/// Adapter for one messaging platform.
///
/// `start` is a long-running task: connect, listen, and publish
/// [`magpie_core::InboundMessage`]s to the bus (after the adapter's own
/// allowlist and rate-limit checks) until the token is cancelled.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel name used for session keys and outbound routing.
    fn name(&self) -> &str;

    async fn start(&self, bus: MessageBus, cancel: CancellationToken) -> Result<(), MagpieError>;

    async fn stop(&self) -> Result<(), MagpieError>;

    /// Deliver one outbound message on the platform.
    async fn send(&self, msg: OutboundMessage) -> Result<(), MagpieError>;
}
