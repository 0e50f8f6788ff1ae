//! A gateway that lives in-process.
//!
//! [`SimulatedGateway`] sits on the gateway end of a [`memory::pair`](crate::transport::memory::pair)
//! and answers the way a dock does: service calls get replies, heartbeats and stick samples are
//! recorded, and an accepted fly-to is followed by progress reports. Per-method behaviour can be
//! changed at runtime to provoke rejections and timeouts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bon::Builder;
use rand::Rng;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control::{METHOD_AUTH_RELEASE, METHOD_AUTH_REQUEST, METHOD_DRC_ENTER, METHOD_DRC_EXIT};
use crate::services::METHOD_FLY_TO_POINT;
use crate::transport::TransportError;
use crate::transport::memory::{GatewayEnd, GatewayHandle, Published};
use crate::unit::{DeviceTopics, UnitId};

/// Result code the simulator answers with when DRC mode is requested without authority.
pub const NO_AUTHORITY_CODE: i64 = 514_300;

/// How the simulator answers a service method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Reply with `result: 0`.
    Accept,
    /// Reply with this nonzero result.
    Reject(i64),
    /// Never reply.
    Silent,
}

#[derive(Debug, Clone, Builder)]
pub struct SimulatorConfig {
    /// Delay before each reply.
    #[builder(default = Duration::ZERO)]
    pub reply_delay: Duration,
    /// Time between fly-to progress reports.
    #[builder(default = Duration::from_millis(50))]
    pub progress_interval: Duration,
    /// `wayline_progress` reports sent before the final `wayline_ok`.
    #[builder(default = 3)]
    pub progress_steps: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Default)]
struct SimState {
    behaviors: HashMap<String, Behavior>,
    authority: bool,
    drc_active: bool,
    calls: Vec<String>,
    heartbeats: Vec<u64>,
    sticks: Vec<Value>,
}

/// A simulated gateway answering one operator link.
pub struct SimulatedGateway {
    unit_id: UnitId,
    topics: DeviceTopics,
    handle: GatewayHandle,
    state: Arc<Mutex<SimState>>,
    task: JoinHandle<()>,
}

impl SimulatedGateway {
    /// Start answering on `gateway`.
    pub fn spawn(unit_id: UnitId, gateway: GatewayEnd, config: SimulatorConfig) -> Self {
        let topics = unit_id.topics();
        let (handle, inbox) = gateway.into_parts();
        let state = Arc::new(Mutex::new(SimState::default()));

        let task = tokio::spawn(
            Responder {
                unit_id: unit_id.clone(),
                topics: topics.clone(),
                handle: handle.clone(),
                state: Arc::clone(&state),
                config,
            }
            .run(inbox),
        );

        info!(unit_id = %unit_id, "simulated gateway started");
        Self {
            unit_id,
            topics,
            handle,
            state,
            task,
        }
    }

    /// Answer `method` with `behavior` from now on.
    pub fn set_behavior(&self, method: &str, behavior: Behavior) {
        lock(&self.state)
            .behaviors
            .insert(method.to_string(), behavior);
    }

    /// Methods of every service request received, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Sequence numbers of every heartbeat received, in order.
    pub fn heartbeat_seqs(&self) -> Vec<u64> {
        lock(&self.state).heartbeats.clone()
    }

    /// `data` of every stick sample received, in order.
    pub fn stick_samples(&self) -> Vec<Value> {
        lock(&self.state).sticks.clone()
    }

    pub fn authority_granted(&self) -> bool {
        lock(&self.state).authority
    }

    pub fn drc_active(&self) -> bool {
        lock(&self.state).drc_active
    }

    /// Push one OSD sample.
    pub fn publish_osd(&self, latitude: f64, longitude: f64, height: f64) -> Result<(), TransportError> {
        publish_osd(&self.handle, &self.topics, latitude, longitude, height)
    }

    /// Connection controls (disconnect, reconnect, publish failures).
    pub fn handle(&self) -> &GatewayHandle {
        &self.handle
    }

    pub fn unit_id(&self) -> &UnitId {
        &self.unit_id
    }
}

impl Drop for SimulatedGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn publish_osd(
    handle: &GatewayHandle,
    topics: &DeviceTopics,
    latitude: f64,
    longitude: f64,
    height: f64,
) -> Result<(), TransportError> {
    handle.publish_json(
        &topics.drc_up,
        &json!({
            "method": "osd_info_push",
            "data": {
                "latitude": latitude,
                "longitude": longitude,
                "height": height,
                "attitude_head": 0.0,
                "horizontal_speed": 0.0,
            },
        }),
    )
}

struct Responder {
    unit_id: UnitId,
    topics: DeviceTopics,
    handle: GatewayHandle,
    state: Arc<Mutex<SimState>>,
    config: SimulatorConfig,
}

impl Responder {
    async fn run(self, mut inbox: mpsc::UnboundedReceiver<Published>) {
        while let Some(published) = inbox.recv().await {
            let body = match published.json() {
                Ok(body) => body,
                Err(e) => {
                    warn!(unit_id = %self.unit_id, error = %e, "simulator got malformed payload");
                    continue;
                }
            };

            if published.topic == self.topics.services {
                self.on_service(&body);
            } else if published.topic == self.topics.drc_down {
                self.on_drc_down(body);
            } else {
                debug!(unit_id = %self.unit_id, topic = %published.topic, "simulator ignoring topic");
            }
        }
    }

    fn on_drc_down(&self, body: Value) {
        let mut state = lock(&self.state);
        match body["method"].as_str() {
            Some("heart_beat") => {
                if let Some(seq) = body["seq"].as_u64() {
                    state.heartbeats.push(seq);
                }
            }
            Some("stick_control") if state.drc_active => state.sticks.push(body["data"].clone()),
            other => debug!(unit_id = %self.unit_id, method = ?other, "unexpected drc/down message"),
        }
    }

    fn on_service(&self, body: &Value) {
        let (Some(tid), Some(method)) = (body["tid"].as_str(), body["method"].as_str()) else {
            warn!(unit_id = %self.unit_id, "service request without tid or method");
            return;
        };

        let result = {
            let mut state = lock(&self.state);
            state.calls.push(method.to_string());
            let behavior = state
                .behaviors
                .get(method)
                .copied()
                .unwrap_or(Behavior::Accept);

            match behavior {
                Behavior::Silent => {
                    debug!(unit_id = %self.unit_id, method, "simulator staying silent");
                    return;
                }
                Behavior::Reject(code) => code,
                Behavior::Accept => apply(&mut state, method),
            }
        };

        let reply = json!({
            "tid": tid,
            "bid": tid,
            "method": method,
            "data": { "result": result, "output": {} },
        });
        self.send_reply(reply);

        if result == 0 && method == METHOD_FLY_TO_POINT {
            self.spawn_fly_to(&body["data"]);
        }
    }

    fn send_reply(&self, reply: Value) {
        let handle = self.handle.clone();
        let topic = self.topics.services_reply.clone();
        let delay = self.config.reply_delay;

        let send = move || {
            if let Err(e) = handle.publish_json(&topic, &reply) {
                warn!(error = %e, "simulator reply dropped");
            }
        };

        if delay.is_zero() {
            send();
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                send();
            });
        }
    }

    fn spawn_fly_to(&self, data: &Value) {
        let fly_to_id = data["fly_to_id"].as_str().unwrap_or_default().to_string();
        let target = &data["points"][0];
        let (latitude, longitude, height) = (
            target["latitude"].as_f64().unwrap_or_default(),
            target["longitude"].as_f64().unwrap_or_default(),
            target["height"].as_f64().unwrap_or_default(),
        );

        let handle = self.handle.clone();
        let topics = self.topics.clone();
        let config = self.config.clone();
        let unit_id = self.unit_id.clone();
        let mut remaining: f64 = rand::rng().random_range(50.0..500.0);

        tokio::spawn(async move {
            let step = remaining / f64::from(config.progress_steps + 1);

            for index in 0..config.progress_steps {
                tokio::time::sleep(config.progress_interval).await;
                remaining -= step;
                let report = progress_report(&fly_to_id, "wayline_progress", index, remaining);
                if handle.publish_json(&topics.events, &report).is_err() {
                    return;
                }
            }

            tokio::time::sleep(config.progress_interval).await;
            let _ = publish_osd(&handle, &topics, latitude, longitude, height);
            let report = progress_report(&fly_to_id, "wayline_ok", config.progress_steps, 0.0);
            let _ = handle.publish_json(&topics.events, &report);
            debug!(unit_id = %unit_id, fly_to_id = %fly_to_id, "simulated fly-to finished");
        });
    }
}

/// Apply an accepted service call to the simulated device; returns the result code.
fn apply(state: &mut SimState, method: &str) -> i64 {
    match method {
        METHOD_AUTH_REQUEST => state.authority = true,
        METHOD_DRC_ENTER if !state.authority => return NO_AUTHORITY_CODE,
        METHOD_DRC_ENTER => state.drc_active = true,
        METHOD_DRC_EXIT => state.drc_active = false,
        METHOD_AUTH_RELEASE => {
            state.authority = false;
            state.drc_active = false;
        }
        _ => {}
    }
    0
}

fn progress_report(fly_to_id: &str, status: &str, index: u32, remaining: f64) -> Value {
    json!({
        "method": "fly_to_point_progress",
        "data": {
            "fly_to_id": fly_to_id,
            "status": status,
            "result": 0,
            "way_point_index": index,
            "remaining_distance": remaining,
            "remaining_time": remaining / 12.0,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{AuthorityRequest, BrokerConfig, ControlState, DrcModeRequest, StickCommand};
    use crate::error::ErrorKind;
    use crate::link::{DeviceLink, LinkConfig};
    use crate::correlator::CorrelatorConfig;
    use crate::services::{self, FlyToStatus, FlyToTarget};
    use crate::state_machine::telemetry::Field;

    fn start(config: LinkConfig) -> (DeviceLink, SimulatedGateway) {
        let unit_id = UnitId::from("SN1");
        let (link, gateway) = DeviceLink::loopback(unit_id.clone(), config).unwrap();
        let sim = SimulatedGateway::spawn(unit_id, gateway, SimulatorConfig::default());
        (link, sim)
    }

    fn drc_request() -> DrcModeRequest {
        DrcModeRequest::builder()
            .broker(BrokerConfig::for_unit(
                &UnitId::from("SN1"),
                "127.0.0.1:1883",
                "pilot",
                "secret",
                Duration::from_secs(3600),
            ))
            .build()
    }

    #[tokio::test]
    async fn test_full_session_against_simulator() {
        let (link, sim) = start(LinkConfig::default());
        let control = link.control();

        control.request_authority(AuthorityRequest::default()).await.unwrap();
        assert!(sim.authority_granted());

        control.enter_mode(drc_request()).await.unwrap();
        assert!(sim.drc_active());
        assert_eq!(control.state(), ControlState::Active);

        control
            .send_stick(StickCommand {
                throttle: 1300,
                ..StickCommand::neutral()
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        let seqs = sim.heartbeat_seqs();
        assert!(seqs.len() >= 3, "{seqs:?}");
        assert_eq!(seqs[0], 1);
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));

        link.shutdown().await.unwrap();
        assert_eq!(control.state(), ControlState::Idle);
        assert!(!sim.authority_granted());

        let heartbeats_at_shutdown = sim.heartbeat_seqs().len();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sim.heartbeat_seqs().len(), heartbeats_at_shutdown);

        assert_eq!(sim.stick_samples().len(), 1);
        assert_eq!(sim.stick_samples()[0]["throttle"], 1300);
        assert_eq!(
            sim.calls(),
            vec![METHOD_AUTH_REQUEST, METHOD_DRC_ENTER, METHOD_DRC_EXIT, METHOD_AUTH_RELEASE]
        );
    }

    #[tokio::test]
    async fn test_rejected_authority_leaves_session_idle() {
        let (link, sim) = start(LinkConfig::default());
        sim.set_behavior(METHOD_AUTH_REQUEST, Behavior::Reject(319_004));

        let err = link
            .control()
            .request_authority(AuthorityRequest::default())
            .await
            .unwrap_err();

        assert_eq!(err.remote_code(), Some(319_004));
        assert_eq!(link.control().state(), ControlState::Idle);
        assert!(link.control().authority_holder().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_gateway_times_out() {
        let config = LinkConfig::builder()
            .correlator(
                CorrelatorConfig::builder()
                    .default_timeout(Duration::from_secs(3))
                    .build(),
            )
            .build();
        let (link, sim) = start(config);
        sim.set_behavior(METHOD_AUTH_REQUEST, Behavior::Silent);

        let err = link
            .control()
            .request_authority(AuthorityRequest::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(link.control().state(), ControlState::Idle);
        assert_eq!(link.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fly_to_reports_progress_to_completion() {
        let (link, sim) = start(LinkConfig::default());

        let target = FlyToTarget::builder()
            .latitude(22.58)
            .longitude(113.94)
            .height(120.0)
            .build();
        let id = services::fly_to_point(&link, target).await.unwrap();
        let outcome = services::wait_for_fly_to(&link, &id, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(outcome.status, FlyToStatus::Ok);
        assert_eq!(outcome.snapshot.str(Field::FlyToId), Some(id.as_str()));
        assert_eq!(outcome.snapshot.f64(Field::RemainingDistance), Some(0.0));
        assert_eq!(link.cache().position().latitude, Some(22.58));
        assert!(sim.calls().contains(&METHOD_FLY_TO_POINT.to_string()));
    }

    #[tokio::test]
    async fn test_return_home_and_osd() {
        let (link, sim) = start(LinkConfig::default());

        services::return_home(&link).await.unwrap();

        let mut updates = link.cache().subscribe();
        sim.publish_osd(22.5, 113.9, 80.0).unwrap();
        updates.changed().await.unwrap();
        assert_eq!(link.cache().takeoff_height(), Some(80.0));
        assert!(link.is_online());
    }

    #[tokio::test]
    async fn test_disconnect_mid_call_fails_fast() {
        let (link, sim) = start(LinkConfig::default());
        sim.set_behavior(METHOD_AUTH_REQUEST, Behavior::Silent);

        let control = Arc::clone(link.control());
        let call = tokio::spawn(async move {
            control.request_authority(AuthorityRequest::default()).await
        });
        while sim.calls().is_empty() {
            tokio::task::yield_now().await;
        }

        sim.handle().disconnect();
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportLost);
        assert_eq!(link.control().state(), ControlState::Idle);
    }
}
