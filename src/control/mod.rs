//! The operator's control session with one gateway.
//!
//! [`ControlSession`] drives a [`ControlMachine`] through the four gateway services that bracket
//! manual flight: take authority, enter DRC mode, exit DRC mode, release authority. The machine
//! decides what is legal; this runner makes the calls and owns the heartbeat that keeps DRC mode
//! alive.
//!
//! ```ignore
//! session.request_authority(AuthorityRequest::default()).await?;
//! session.enter_mode(DrcModeRequest::builder().broker(broker).build()).await?;
//! session.send_stick(StickCommand::neutral())?;
//! session.shutdown().await?;
//! ```

mod broker;
mod heartbeat;
mod stick;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::correlator::Correlator;
use crate::error::{SessionError, SessionResult};
use crate::state_machine::StateMachine;
use crate::state_machine::control::{ControlInput, ControlMachine, ControlOp, ControlOutput, Outcome};
use crate::state_machine::wrappers::system::{EpochMillis, SystemResource};
use crate::transport::{QoS, Transport};
use crate::unit::UnitId;

pub use crate::state_machine::control::ControlState;
pub use broker::{AuthorityRequest, BrokerConfig, DrcModeRequest};
pub use heartbeat::{HeartbeatConfig, HeartbeatStats, HeartbeatTask};
pub use stick::{STICK_NEUTRAL, STICK_RANGE, StickCommand};

pub const METHOD_AUTH_REQUEST: &str = "cloud_control_auth_request";
pub const METHOD_AUTH_RELEASE: &str = "cloud_control_auth_release";
pub const METHOD_DRC_ENTER: &str = "drc_mode_enter";
pub const METHOD_DRC_EXIT: &str = "drc_mode_exit";

struct Inner {
    machine: ControlMachine,
    heartbeat: Option<HeartbeatTask>,
    holder: Option<AuthorityRequest>,
    broker: Option<BrokerConfig>,
}

/// Authority and DRC mode sequencing for a single unit.
pub struct ControlSession {
    unit_id: UnitId,
    correlator: Arc<Correlator>,
    transport: Arc<dyn Transport>,
    drc_down: String,
    heartbeat_config: HeartbeatConfig,
    stick_seq: AtomicU64,
    inner: Mutex<Inner>,
}

impl ControlSession {
    pub fn new(
        correlator: Arc<Correlator>,
        transport: Arc<dyn Transport>,
        heartbeat_config: HeartbeatConfig,
    ) -> Self {
        let unit_id = correlator.unit_id().clone();
        Self {
            drc_down: unit_id.topics().drc_down,
            unit_id,
            correlator,
            transport,
            heartbeat_config,
            stick_seq: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                machine: ControlMachine::new(),
                heartbeat: None,
                holder: None,
                broker: None,
            }),
        }
    }

    pub fn state(&self) -> ControlState {
        self.lock().machine.state()
    }

    /// Counters of the running heartbeat, `None` outside DRC mode.
    pub fn heartbeat_stats(&self) -> Option<HeartbeatStats> {
        self.lock().heartbeat.as_ref().map(HeartbeatTask::stats)
    }

    /// `false` while the heartbeat is running but degraded.
    pub fn is_healthy(&self) -> bool {
        self.heartbeat_stats().is_none_or(|stats| !stats.degraded)
    }

    /// Who authority was granted to, while it is held.
    pub fn authority_holder(&self) -> Option<AuthorityRequest> {
        self.lock().holder.clone()
    }

    /// The broker handed to the gateway on the last successful entry, while DRC mode is active.
    pub fn broker(&self) -> Option<BrokerConfig> {
        self.lock().broker.clone()
    }

    /// Ask the gateway for flight control authority. Only legal from `IDLE`.
    pub async fn request_authority(&self, request: AuthorityRequest) -> SessionResult<()> {
        request.validate()?;
        let (transition, _) = self.begin(ControlOp::RequestAuthority)?;

        let result = self
            .correlator
            .call_default(METHOD_AUTH_REQUEST, request.to_data())
            .await;

        transition.finish(outcome_of(&result))?;
        result?;
        self.lock().holder = Some(request);
        Ok(())
    }

    /// Switch the gateway into DRC mode and start the heartbeat. Only legal from
    /// `AUTHORITY_HELD`.
    ///
    /// The broker settings are validated before anything is published.
    pub async fn enter_mode(&self, request: DrcModeRequest) -> SessionResult<()> {
        request.validate(EpochMillis::generate())?;
        let data = request.to_data()?;
        let (transition, _) = self.begin(ControlOp::EnterMode)?;

        let result = self.correlator.call_default(METHOD_DRC_ENTER, data).await;

        transition.finish(outcome_of(&result))?;
        result?;
        self.lock().broker = Some(request.broker);
        Ok(())
    }

    /// Stop the heartbeat, then leave DRC mode. Only legal from `ACTIVE`.
    ///
    /// The session returns to `AUTHORITY_HELD` even if the gateway never confirms; the error is
    /// still returned.
    pub async fn exit_mode(&self) -> SessionResult<()> {
        let (transition, heartbeat) = self.begin(ControlOp::ExitMode)?;
        if let Some(heartbeat) = heartbeat {
            let stats = heartbeat.stop().await;
            debug!(unit_id = %self.unit_id, last_seq = stats.last_seq, sent = stats.sent, "heartbeat joined");
        }

        let result = self.correlator.call_default(METHOD_DRC_EXIT, json!({})).await;

        transition.finish(outcome_of(&result))?;
        self.lock().broker = None;
        result.map(drop)
    }

    /// Give up flight control authority. Only legal from `AUTHORITY_HELD`.
    ///
    /// The session returns to `IDLE` even if the gateway never confirms; the error is still
    /// returned.
    pub async fn release_authority(&self) -> SessionResult<()> {
        let (transition, _) = self.begin(ControlOp::ReleaseAuthority)?;

        let result = self
            .correlator
            .call_default(METHOD_AUTH_RELEASE, json!({}))
            .await;

        transition.finish(outcome_of(&result))?;
        self.lock().holder = None;
        result.map(drop)
    }

    /// Publish one virtual stick sample. Only legal in `ACTIVE`.
    pub fn send_stick(&self, command: StickCommand) -> SessionResult<()> {
        command.validate()?;

        // Held across the publish so no sample can follow the start of an exit.
        let inner = self.lock();
        let state = inner.machine.state();
        if state != ControlState::Active {
            return Err(SessionError::InvalidState {
                operation: "send stick commands",
                state,
            });
        }

        let seq = self.stick_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let payload = json!({
            "seq": seq,
            "method": "stick_control",
            "data": command,
        });
        self.transport.publish(
            &self.drc_down,
            Bytes::from(payload.to_string()),
            QoS::AtMostOnce,
        )?;
        Ok(())
    }

    /// Walk back to `IDLE` from wherever the session is: exit DRC mode if active, then release
    /// authority if held. Every step is attempted; the first error is returned.
    pub async fn shutdown(&self) -> SessionResult<()> {
        let state = self.state();
        if state.is_transitional() {
            return Err(SessionError::InvalidState {
                operation: "shut down",
                state,
            });
        }

        let mut first_error = None;
        if state == ControlState::Active {
            if let Err(e) = self.exit_mode().await {
                warn!(unit_id = %self.unit_id, error = %e, "exit during shutdown failed");
                first_error.get_or_insert(e);
            }
        }
        if self.state() == ControlState::AuthorityHeld {
            if let Err(e) = self.release_authority().await {
                warn!(unit_id = %self.unit_id, error = %e, "release during shutdown failed");
                first_error.get_or_insert(e);
            }
        }

        info!(unit_id = %self.unit_id, state = %self.state(), "control session shut down");
        first_error.map_or(Ok(()), Err)
    }

    pub fn unit_id(&self) -> &UnitId {
        &self.unit_id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start `op`, handing back the in-flight transition and the heartbeat if the machine asked
    /// for it to stop.
    fn begin(&self, op: ControlOp) -> SessionResult<(Transition<'_>, Option<HeartbeatTask>)> {
        let mut inner = self.lock();
        inner.machine.process_input(ControlInput::Begin(op));

        let mut stopped = None;
        let mut rejected = None;
        while let Some(output) = inner.machine.poll_output() {
            match output {
                ControlOutput::Transitioned { from, to, .. } => {
                    info!(unit_id = %self.unit_id, %from, %to, "{}", op.describe());
                }
                ControlOutput::StopHeartbeat => stopped = inner.heartbeat.take(),
                ControlOutput::Rejected { state, .. } => rejected = Some(state),
                ControlOutput::Stale { .. } | ControlOutput::StartHeartbeat => {}
            }
        }

        if let Some(state) = rejected {
            debug!(unit_id = %self.unit_id, %state, "refused to {}", op.describe());
            return Err(SessionError::InvalidState {
                operation: op.describe(),
                state,
            });
        }

        Ok((
            Transition {
                session: self,
                op,
                finished: false,
            },
            stopped,
        ))
    }

    fn finish(&self, op: ControlOp, outcome: Outcome) -> SessionResult<()> {
        let mut inner = self.lock();
        inner.machine.process_input(ControlInput::Finish { op, outcome });

        let mut result = Ok(());
        while let Some(output) = inner.machine.poll_output() {
            match output {
                ControlOutput::Transitioned { from, to, .. } => {
                    info!(unit_id = %self.unit_id, %from, %to, ?outcome, "{} finished", op.describe());
                }
                ControlOutput::StartHeartbeat => {
                    // Spawned under the lock so ACTIVE is never observable without a heartbeat.
                    if let Some(existing) = inner.heartbeat.as_ref() {
                        warn!(unit_id = %self.unit_id, stats = ?existing.stats(), "heartbeat already running");
                        result = Err(SessionError::InvalidState {
                            operation: "start a second heartbeat",
                            state: inner.machine.state(),
                        });
                        continue;
                    }
                    inner.heartbeat = Some(HeartbeatTask::spawn(
                        self.unit_id.clone(),
                        Arc::clone(&self.transport),
                        self.drc_down.clone(),
                        self.heartbeat_config.clone(),
                    ));
                }
                ControlOutput::Stale { state, .. } => {
                    warn!(unit_id = %self.unit_id, %state, "stale finish for {}", op.describe());
                }
                ControlOutput::Rejected { .. } | ControlOutput::StopHeartbeat => {}
            }
        }
        result
    }
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("unit_id", &self.unit_id)
            .field("state", &self.state())
            .finish()
    }
}

/// An in-flight transition. Finishing it is mandatory; if the owning future is dropped first,
/// the transition is abandoned and the machine falls back to the stable state it came from.
struct Transition<'a> {
    session: &'a ControlSession,
    op: ControlOp,
    finished: bool,
}

impl Transition<'_> {
    fn finish(mut self, outcome: Outcome) -> SessionResult<()> {
        self.finished = true;
        self.session.finish(self.op, outcome)
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(unit_id = %self.session.unit_id, "{} abandoned", self.op.describe());
            let _ = self.session.finish(self.op, Outcome::Abandoned);
        }
    }
}

fn outcome_of(result: &SessionResult<Value>) -> Outcome {
    if result.is_ok() {
        Outcome::Succeeded
    } else {
        Outcome::Failed
    }
}
