// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Supervises channel adapters and routes outbound traffic.
//!
//! Each registered adapter gets a background task running its `start`
//! loop. A dispatch loop drains `MessageBus::next_outbound` and delivers
//! each message to the adapter matching its channel name; unknown
//! channels are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use magpie_bus::MessageBus;

use crate::ChannelAdapter;

pub struct ChannelSupervisor {
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Default for ChannelSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelSupervisor {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            tasks: Vec::new(),
        }
    }

    /// Register an adapter before `start`. The adapter's `name()` is the
    /// routing key for outbound messages.
    pub fn add_adapter(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn channel_count(&self) -> usize {
        self.adapters.len()
    }

    /// Start every adapter plus the outbound dispatch loop.
    pub fn start(&mut self, bus: MessageBus, cancel: CancellationToken) {
        for (name, adapter) in &self.adapters {
            let adapter = adapter.clone();
            let bus = bus.clone();
            let cancel = cancel.clone();
            let task_name = name.clone();
            self.tasks.push(tokio::spawn(async move {
                if let Err(e) = adapter.start(bus, cancel).await {
                    error!(channel = task_name.as_str(), error = %e, "channel adapter exited with error");
                }
            }));
            info!(channel = name.as_str(), "channel started");
        }

        let adapters = self.adapters.clone();
        let dispatch_cancel = cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            dispatch_outbound(adapters, bus, dispatch_cancel).await;
        }));
    }

    /// Stop all adapters and abort remaining supervisor tasks.
    pub async fn stop(&mut self) {
        for (name, adapter) in &self.adapters {
            if let Err(e) = adapter.stop().await {
                warn!(channel = name.as_str(), error = %e, "channel stop error");
            }
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn dispatch_outbound(
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
    bus: MessageBus,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            msg = bus.next_outbound() => msg,
            _ = cancel.cancelled() => {
                // Drain whatever the agent already queued before exiting.
                bus.shutdown();
                bus.next_outbound().await
            }
        };
        let Some(msg) = msg else {
            info!("outbound dispatch loop stopped");
            return;
        };

        match adapters.get(&msg.channel) {
            Some(adapter) => {
                if let Err(e) = adapter.send(msg.clone()).await {
                    warn!(
                        channel = msg.channel.as_str(),
                        chat_id = msg.chat_id.as_str(),
                        error = %e,
                        "outbound delivery failed"
                    );
                }
            }
            None => {
                warn!(
                    channel = msg.channel.as_str(),
                    "no adapter for outbound channel, dropping message"
                );
            }
        }
    }
}
