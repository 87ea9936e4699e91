// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mock channel adapter for deterministic testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use magpie_bus::MessageBus;
use magpie_channel::ChannelAdapter;
use magpie_core::{InboundMessage, MagpieError, OutboundMessage};

/// A mock messaging channel.
///
/// Inbound messages queued before `start` are published to the bus when
/// the channel starts; outbound messages passed to `send` are captured
/// for assertions.
pub struct MockChannel {
    name: String,
    pending_inbound: Mutex<Vec<InboundMessage>>,
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
}

impl MockChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pending_inbound: Mutex::new(Vec::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a message for publication when the channel starts.
    pub async fn queue_inbound(&self, msg: InboundMessage) {
        self.pending_inbound.lock().await.push(msg);
    }

    /// All messages delivered through `send`, in order.
    pub async fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    /// Delivered non-status messages (status updates filtered out).
    pub async fn sent_replies(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|m| !m.is_status())
            .cloned()
            .collect()
    }

    pub async fn clear_sent(&self) {
        self.sent.lock().await.clear();
    }
}

#[async_trait]
impl ChannelAdapter for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, bus: MessageBus, cancel: CancellationToken) -> Result<(), MagpieError> {
        let pending: Vec<InboundMessage> = self.pending_inbound.lock().await.drain(..).collect();
        for msg in pending {
            bus.publish_inbound(msg).await?;
        }
        cancel.cancelled().await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), MagpieError> {
        Ok(())
    }

    async fn send(&self, msg: OutboundMessage) -> Result<(), MagpieError> {
        self.sent.lock().await.push(msg);
        Ok(())
    }
}
