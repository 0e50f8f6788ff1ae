use std::fmt::Display;
use std::sync::Arc;

/// An ID for a "unit", the gateway a drone is reached through.
///
/// This is the gateway serial number and is the `{D}` segment of every topic the unit uses.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnitId(Arc<str>);

impl UnitId {
    /// Create a new [`UnitId`] from any type that can be converted into an `Arc<str>`.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The full set of topics used to talk to this unit.
    pub fn topics(&self) -> DeviceTopics {
        DeviceTopics::new(self)
    }
}

impl Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for UnitId {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

/// Topic names for a single unit.
///
/// Requests flow operator to gateway on `services` and `drc_down`; everything else is
/// published by the gateway and subscribed to by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    /// `thing/product/{D}/services`
    pub services: String,
    /// `thing/product/{D}/services_reply`
    pub services_reply: String,
    /// `thing/product/{D}/drc/up`
    pub drc_up: String,
    /// `thing/product/{D}/drc/down`
    pub drc_down: String,
    /// `sys/product/{D}/status`
    pub status: String,
    /// `thing/product/{D}/events`
    pub events: String,
}

impl DeviceTopics {
    pub fn new(unit_id: &UnitId) -> Self {
        let d = unit_id.as_str();
        Self {
            services: format!("thing/product/{d}/services"),
            services_reply: format!("thing/product/{d}/services_reply"),
            drc_up: format!("thing/product/{d}/drc/up"),
            drc_down: format!("thing/product/{d}/drc/down"),
            status: format!("sys/product/{d}/status"),
            events: format!("thing/product/{d}/events"),
        }
    }

    /// Topics the operator side subscribes to, paired with the QoS the gateway expects.
    pub fn inbound(&self) -> [(&str, crate::transport::QoS); 4] {
        use crate::transport::QoS;
        [
            (self.services_reply.as_str(), QoS::AtLeastOnce),
            (self.drc_up.as_str(), QoS::AtMostOnce),
            (self.status.as_str(), QoS::AtMostOnce),
            (self.events.as_str(), QoS::AtMostOnce),
        ]
    }

    /// Topics that carry telemetry for the state cache.
    pub fn is_telemetry(&self, topic: &str) -> bool {
        topic == self.drc_up || topic == self.status || topic == self.events
    }
}
