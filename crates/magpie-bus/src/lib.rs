// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded FIFO message bus connecting channels and the agent loop.
//!
//! Two independent queues: inbound (channel -> agent) and outbound
//! (agent -> channel). Producers await when a queue is full, or use the
//! `try_` variants to get an immediate backpressure refusal. Consumers
//! block until a message arrives or shutdown is signalled, at which point
//! they drain the queue and return `None`.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use magpie_core::{InboundMessage, MagpieError, OutboundMessage};

/// The shared message bus.
///
/// Cloneable handle; all clones publish into the same queues.
#[derive(Clone)]
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    inbound_rx: Arc<Mutex<mpsc::Receiver<InboundMessage>>>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<OutboundMessage>>>,
    shutdown: CancellationToken,
}

impl MessageBus {
    /// Create a bus with the given queue capacities.
    pub fn new(inbound_capacity: usize, outbound_capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity.max(1));
        Self {
            inbound_tx,
            outbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Publish an inbound message, waiting while the queue is full.
    pub async fn publish_inbound(&self, msg: InboundMessage) -> Result<(), MagpieError> {
        self.inbound_tx
            .send(msg)
            .await
            .map_err(|_| MagpieError::Internal("bus is shut down".to_string()))
    }

    /// Publish an inbound message without waiting. Returns a `Resource`
    /// error when the queue is full so channels can apply their own retry.
    pub fn try_publish_inbound(&self, msg: InboundMessage) -> Result<(), MagpieError> {
        self.inbound_tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                MagpieError::Resource("inbound queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                MagpieError::Internal("bus is shut down".to_string())
            }
        })
    }

    /// Publish an outbound message, waiting while the queue is full.
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<(), MagpieError> {
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| MagpieError::Internal("bus is shut down".to_string()))
    }

    /// Publish an outbound message without waiting.
    pub fn try_publish_outbound(&self, msg: OutboundMessage) -> Result<(), MagpieError> {
        self.outbound_tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                MagpieError::Resource("outbound queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                MagpieError::Internal("bus is shut down".to_string())
            }
        })
    }

    /// Next inbound message, or `None` once shutdown is signalled and the
    /// queue is drained.
    pub async fn next_inbound(&self) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        loop {
            // Drain whatever is already queued even during shutdown.
            match rx.try_recv() {
                Ok(msg) => return Some(msg),
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
            if self.shutdown.is_cancelled() {
                return None;
            }
            tokio::select! {
                msg = rx.recv() => return msg,
                _ = self.shutdown.cancelled() => {
                    // Loop once more to drain anything racing in.
                }
            }
        }
    }

    /// Next outbound message, or `None` once shutdown is signalled and the
    /// queue is drained.
    pub async fn next_outbound(&self) -> Option<OutboundMessage> {
        let mut rx = self.outbound_rx.lock().await;
        loop {
            match rx.try_recv() {
                Ok(msg) => return Some(msg),
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
            if self.shutdown.is_cancelled() {
                return None;
            }
            tokio::select! {
                msg = rx.recv() => return msg,
                _ = self.shutdown.cancelled() => {}
            }
        }
    }

    /// Signal shutdown: consumers drain remaining messages and return `None`.
    pub fn shutdown(&self) {
        debug!("message bus shutdown signalled");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Remaining inbound queue capacity (used by tests and diagnostics).
    pub fn inbound_capacity_remaining(&self) -> usize {
        self.inbound_tx.capacity()
    }
}
