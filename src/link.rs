//! One operator connection to one gateway.
//!
//! A [`DeviceLink`] owns everything that exists per device: the state cache, the correlator, the
//! control session and the task that demultiplexes inbound traffic between them. Several links
//! can share a process; nothing here is global.

use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control::{ControlSession, HeartbeatConfig};
use crate::correlator::{Correlator, CorrelatorConfig};
use crate::error::SessionResult;
use crate::state_cache::StateCache;
use crate::transport::memory::{self, GatewayEnd};
use crate::transport::{Transport, TransportEvent};
use crate::unit::{DeviceTopics, UnitId};

/// Configuration for a [`DeviceLink`].
#[derive(Debug, Clone, Builder)]
pub struct LinkConfig {
    #[builder(default)]
    pub correlator: CorrelatorConfig,
    #[builder(default)]
    pub heartbeat: HeartbeatConfig,
    /// OSD silence after which the device counts as offline.
    #[builder(default = Duration::from_secs(2))]
    pub online_timeout: Duration,
    /// Window the OSD frequency is computed over.
    #[builder(default = Duration::from_secs(2))]
    pub frequency_window: Duration,
    /// Inbound event queue size for transports this crate creates itself.
    #[builder(default = 1024)]
    pub event_buffer: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

pub struct DeviceLink {
    unit_id: UnitId,
    topics: DeviceTopics,
    cache: Arc<StateCache>,
    correlator: Arc<Correlator>,
    control: Arc<ControlSession>,
    config: LinkConfig,
    dispatch: JoinHandle<()>,
}

impl DeviceLink {
    /// Subscribe to the device's inbound topics and start routing `events`.
    ///
    /// `events` must be the receiver paired with `transport`.
    ///
    /// # Errors
    ///
    /// [`SessionError::Publish`](crate::error::SessionError::Publish) if a subscription was
    /// refused.
    pub fn start(
        unit_id: UnitId,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
        config: LinkConfig,
    ) -> SessionResult<Self> {
        let topics = unit_id.topics();
        subscribe_all(&topics, transport.as_ref())?;

        let cache = Arc::new(StateCache::new(config.frequency_window));
        let correlator = Arc::new(Correlator::new(
            unit_id.clone(),
            Arc::clone(&transport),
            config.correlator.clone(),
        ));
        let control = Arc::new(ControlSession::new(
            Arc::clone(&correlator),
            Arc::clone(&transport),
            config.heartbeat.clone(),
        ));

        let dispatch = tokio::spawn(dispatch(
            unit_id.clone(),
            topics.clone(),
            transport,
            events,
            Arc::clone(&cache),
            Arc::clone(&correlator),
        ));

        info!(unit_id = %unit_id, "device link started");

        Ok(Self {
            unit_id,
            topics,
            cache,
            correlator,
            control,
            config,
            dispatch,
        })
    }

    /// Start a link over an in-process loopback, returning the gateway end alongside.
    pub fn loopback(unit_id: UnitId, config: LinkConfig) -> SessionResult<(Self, GatewayEnd)> {
        let (transport, events, gateway) = memory::pair(config.event_buffer);
        let link = Self::start(unit_id, Arc::new(transport), events, config)?;
        Ok((link, gateway))
    }

    pub fn unit_id(&self) -> &UnitId {
        &self.unit_id
    }

    pub fn topics(&self) -> &DeviceTopics {
        &self.topics
    }

    pub fn cache(&self) -> &Arc<StateCache> {
        &self.cache
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn control(&self) -> &Arc<ControlSession> {
        &self.control
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Issue a correlated call to the device.
    pub async fn call(&self, method: &str, data: Value, timeout: Duration) -> SessionResult<Value> {
        self.correlator.call(method, data, timeout).await
    }

    /// [`call`](Self::call) with the correlator's default timeout.
    pub async fn call_default(&self, method: &str, data: Value) -> SessionResult<Value> {
        self.correlator.call_default(method, data).await
    }

    /// Whether OSD telemetry arrived within the configured online timeout.
    pub fn is_online(&self) -> bool {
        self.cache.is_online(self.config.online_timeout)
    }

    pub fn is_connected(&self) -> bool {
        self.correlator.is_connected()
    }

    /// Return the control session to `IDLE`, exiting DRC mode and releasing authority as needed.
    pub async fn shutdown(&self) -> SessionResult<()> {
        self.control.shutdown().await
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.dispatch.abort();
        // Replies can no longer be routed to calls made through a cloned session or correlator.
        self.correlator.fail_all();
    }
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("unit_id", &self.unit_id)
            .field("correlator", &self.correlator)
            .field("control", &self.control)
            .finish()
    }
}

fn subscribe_all(topics: &DeviceTopics, transport: &dyn Transport) -> SessionResult<()> {
    for (topic, qos) in topics.inbound() {
        transport.subscribe(topic, qos)?;
        debug!(topic = %topic, ?qos, "subscribed");
    }
    Ok(())
}

async fn dispatch(
    unit_id: UnitId,
    topics: DeviceTopics,
    transport: Arc<dyn Transport>,
    mut events: mpsc::Receiver<TransportEvent>,
    cache: Arc<StateCache>,
    correlator: Arc<Correlator>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message { topic, payload } => {
                if topic == topics.services_reply {
                    correlator.handle_reply(&payload);
                } else if topics.is_telemetry(&topic) {
                    cache.update(&topic, payload);
                } else {
                    debug!(unit_id = %unit_id, topic = %topic, "message on unexpected topic");
                }
            }
            TransportEvent::Disconnected => {
                let failed = correlator.fail_all();
                warn!(unit_id = %unit_id, failed, "transport disconnected");
            }
            TransportEvent::Connected => {
                if let Err(e) = subscribe_all(&topics, transport.as_ref()) {
                    warn!(unit_id = %unit_id, error = %e, "resubscribe failed");
                }
                correlator.mark_connected();
            }
        }
    }

    // Nothing can answer pending calls any more.
    correlator.fail_all();
    info!(unit_id = %unit_id, "event stream closed, dispatch stopped");
}
