//! The publish/subscribe channel to a gateway.
//!
//! Connecting, TLS and credentials belong to whoever implements [`Transport`]. This crate only
//! needs to publish bytes to a topic, register interest in topics, and be told about inbound
//! messages and connection changes through a [`TransportEvent`] channel.

pub mod memory;

use bytes::Bytes;
use thiserror::Error;

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// Something the transport observed, delivered to the link's dispatch task in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A message arrived on a subscribed topic.
    Message { topic: String, payload: Bytes },

    /// The connection is (re-)established.
    Connected,

    /// The connection dropped. Anything in flight is lost.
    Disconnected,
}

/// Errors raised by a [`Transport`] implementation.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The transport is not connected.
    #[error("transport is not connected")]
    NotConnected,

    /// The transport refused or failed to queue a publish.
    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    /// The transport refused a subscription.
    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },
}

/// The operator end of a duplex publish/subscribe connection.
///
/// Publishing must not block: implementations queue the message and return. Inbound traffic is
/// not read through this trait, it arrives on the event receiver handed over alongside it.
pub trait Transport: Send + Sync + 'static {
    /// Queue `payload` for delivery on `topic`.
    fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), TransportError>;

    /// Start delivering messages on `topic` to the event receiver.
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;
}
