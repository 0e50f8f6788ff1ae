//! In-process loopback transport.
//!
//! [`pair`] returns both ends of a fake broker connection: the operator end implements
//! [`Transport`] and the gateway end lets a simulator or a test read what the operator published
//! and inject messages, disconnects and publish failures.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use super::{QoS, Transport, TransportError, TransportEvent};

/// A message the operator published, as seen by the gateway.
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

impl Published {
    /// Decode the payload as JSON.
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.payload)
    }
}

#[derive(Debug)]
struct Shared {
    connected: AtomicBool,
    fail_publish: AtomicBool,
    subscriptions: Mutex<HashSet<String>>,
}

impl Shared {
    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(topic)
    }
}

/// Create a connected loopback pair.
///
/// `buffer` bounds the operator's inbound event queue; gateway publishes beyond it are refused.
pub fn pair(buffer: usize) -> (MemoryTransport, mpsc::Receiver<TransportEvent>, GatewayEnd) {
    let shared = Arc::new(Shared {
        connected: AtomicBool::new(true),
        fail_publish: AtomicBool::new(false),
        subscriptions: Mutex::new(HashSet::new()),
    });

    let (event_tx, event_rx) = mpsc::channel(buffer);
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

    let transport = MemoryTransport {
        shared: Arc::clone(&shared),
        to_gateway: inbox_tx,
    };
    let gateway = GatewayEnd {
        handle: GatewayHandle {
            shared,
            to_operator: event_tx,
        },
        inbox: inbox_rx,
    };

    (transport, event_rx, gateway)
}

/// Operator end of a [`pair`].
#[derive(Debug)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
    to_gateway: mpsc::UnboundedSender<Published>,
}

impl Transport for MemoryTransport {
    fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), TransportError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }

        if self.shared.fail_publish.load(Ordering::Acquire) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        trace!(topic = %topic, len = payload.len(), "memory publish");

        self.to_gateway
            .send(Published {
                topic: topic.to_string(),
                payload,
                qos,
            })
            .map_err(|_| TransportError::Publish {
                topic: topic.to_string(),
                reason: "gateway end dropped".to_string(),
            })
    }

    fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string());
        Ok(())
    }
}

/// Gateway end of a [`pair`]: the inbox of operator publishes plus a [`GatewayHandle`].
#[derive(Debug)]
pub struct GatewayEnd {
    handle: GatewayHandle,
    inbox: mpsc::UnboundedReceiver<Published>,
}

impl GatewayEnd {
    /// A cloneable handle for publishing and connection control.
    pub fn handle(&self) -> GatewayHandle {
        self.handle.clone()
    }

    /// Wait for the next message the operator published.
    pub async fn recv(&mut self) -> Option<Published> {
        self.inbox.recv().await
    }

    /// Take the next operator message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Published> {
        self.inbox.try_recv().ok()
    }

    /// Split into the handle and the raw inbox.
    pub fn into_parts(self) -> (GatewayHandle, mpsc::UnboundedReceiver<Published>) {
        (self.handle, self.inbox)
    }
}

impl std::ops::Deref for GatewayEnd {
    type Target = GatewayHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

/// Publishes towards the operator and controls the fake connection.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    shared: Arc<Shared>,
    to_operator: mpsc::Sender<TransportEvent>,
}

impl GatewayHandle {
    /// Deliver `payload` on `topic` if the operator subscribed to it, like a broker would.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<(), TransportError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }

        if !self.shared.is_subscribed(topic) {
            trace!(topic = %topic, "no operator subscription, dropping");
            return Ok(());
        }

        self.to_operator
            .try_send(TransportEvent::Message {
                topic: topic.to_string(),
                payload: payload.into(),
            })
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    /// Serialize `value` and [`publish`](Self::publish) it.
    pub fn publish_json(
        &self,
        topic: &str,
        value: &serde_json::Value,
    ) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(value).map_err(|e| TransportError::Publish {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        self.publish(topic, payload)
    }

    /// Drop the connection and notify the operator.
    pub fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::Release);
        // A full queue still gets the notification once the dispatcher catches up.
        let tx = self.to_operator.clone();
        if tx.try_send(TransportEvent::Disconnected).is_err() {
            tokio::spawn(async move {
                let _ = tx.send(TransportEvent::Disconnected).await;
            });
        }
    }

    /// Restore the connection and notify the operator.
    pub fn reconnect(&self) {
        self.shared.connected.store(true, Ordering::Release);
        let _ = self.to_operator.try_send(TransportEvent::Connected);
    }

    /// Make every operator publish fail until cleared.
    pub fn set_publish_failure(&self, fail: bool) {
        self.shared.fail_publish.store(fail, Ordering::Release);
    }

    /// Whether the operator subscribed to `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.shared.is_subscribed(topic)
    }
}
