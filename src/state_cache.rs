//! Latest known telemetry for one gateway.
//!
//! The cache is fed by the link's dispatch task and read by anyone. Every message is applied
//! under a single write lock, so the fields a message carries are replaced together and a
//! [`StateSnapshot`] never mixes halves of two messages. Malformed telemetry is logged and
//! dropped; readers only ever see a value or nothing.
//!
//! Reads never wait on the network or on the gateway. They can wait on the lock while the
//! dispatch task applies one message, which is bounded by the cost of decoding that message.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::state_machine::StateMachine;
use crate::state_machine::telemetry::{
    Field, Observation, StateSnapshot, TelemetryInput, TelemetryMachine, TelemetryOutput,
};
use crate::state_machine::wrappers::system::Stamped;

/// Aircraft position as last reported. Components may be missing without satellite fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub height: Option<f64>,
}

#[derive(Debug)]
pub struct StateCache {
    machine: RwLock<TelemetryMachine>,
    updates: watch::Sender<u64>,
}

impl StateCache {
    /// Create an empty cache computing OSD frequency over `frequency_window`.
    pub fn new(frequency_window: Duration) -> Self {
        let (updates, _) = watch::channel(0);
        Self {
            machine: RwLock::new(TelemetryMachine::new(frequency_window)),
            updates,
        }
    }

    fn read_machine(&self) -> RwLockReadGuard<'_, TelemetryMachine> {
        // A panicking writer can only have left whole fields behind.
        self.machine.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_machine(&self) -> RwLockWriteGuard<'_, TelemetryMachine> {
        self.machine.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one inbound message. Unknown methods are ignored, malformed payloads are logged.
    pub fn update(&self, topic: &str, payload: Bytes) {
        let input = TelemetryInput::Message(Stamped::now((topic.to_string(), payload)));

        let outputs: Vec<TelemetryOutput> = {
            let mut machine = self.write_machine();
            machine.process_input(input);
            std::iter::from_fn(|| machine.poll_output()).collect()
        };

        for output in outputs {
            match output {
                TelemetryOutput::Applied { method, fields } => {
                    trace!(method = %method, fields = fields.len(), "telemetry applied");
                    self.updates.send_modify(|version| *version += 1);
                }
                TelemetryOutput::Ignored { topic, method } => {
                    debug!(topic = %topic, method = %method, "ignoring untracked message");
                }
                TelemetryOutput::Malformed { topic, reason } => {
                    warn!(topic = %topic, reason = %reason, "dropping malformed telemetry");
                }
            }
        }
    }

    /// The last observation of `field`, or `None` if it was never seen.
    pub fn read(&self, field: Field) -> Option<Observation> {
        self.read_machine().read(field).cloned()
    }

    /// Copy every cached field.
    pub fn snapshot(&self) -> StateSnapshot {
        self.read_machine().snapshot(None)
    }

    /// Copy only `fields`.
    pub fn snapshot_of(&self, fields: &[Field]) -> StateSnapshot {
        self.read_machine().snapshot(Some(fields))
    }

    /// A receiver whose value changes every time a message is applied.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.updates.subscribe()
    }

    pub fn position(&self) -> Position {
        let snapshot = self.snapshot_of(&Field::POSITION);
        Position {
            latitude: snapshot.f64(Field::Latitude),
            longitude: snapshot.f64(Field::Longitude),
            height: snapshot.f64(Field::Height),
        }
    }

    pub fn takeoff_height(&self) -> Option<f64> {
        self.read_machine().takeoff_height()
    }

    /// Height above the takeoff point.
    pub fn relative_height(&self) -> Option<f64> {
        let machine = self.read_machine();
        let height = machine.read(Field::Height).and_then(Observation::as_f64)?;
        Some(height - machine.takeoff_height()?)
    }

    pub fn battery_percent(&self) -> Option<i64> {
        self.read(Field::BatteryPercent)?.as_i64()
    }

    pub fn flight_mode(&self) -> Option<i64> {
        self.read(Field::ModeCode)?.as_i64()
    }

    /// Whether the downward sensor reports a usable local height.
    pub fn is_local_height_ok(&self) -> bool {
        let snapshot = self.snapshot_of(&[Field::DownEnable, Field::DownWork]);
        snapshot.value(Field::DownEnable).and_then(|v| v.as_bool()) == Some(true)
            && snapshot.value(Field::DownWork).and_then(|v| v.as_bool()) == Some(true)
    }

    /// Serial number of the aircraft behind the gateway, from the last topology update.
    pub fn aircraft_sn(&self) -> Option<String> {
        let topology = self.read(Field::Topology)?;
        topology
            .value
            .get("sub_devices")?
            .get(0)?
            .get("sn")?
            .as_str()
            .map(str::to_string)
    }

    /// OSD messages per second over the configured window.
    pub fn osd_frequency(&self) -> f64 {
        self.read_machine().osd_frequency(Instant::now())
    }

    /// Whether OSD telemetry arrived within `timeout`.
    pub fn is_online(&self, timeout: Duration) -> bool {
        self.read_machine().is_online(Instant::now(), timeout)
    }
}

/// Display name for a `mode_code`.
pub fn flight_mode_name(mode_code: i64) -> &'static str {
    match mode_code {
        0 => "standby",
        1 => "takeoff preparation",
        2 => "takeoff ready",
        3 => "manual",
        4 => "auto takeoff",
        5 => "wayline",
        6 => "panorama",
        7 => "active track",
        8 => "ADS-B avoidance",
        9 => "return to home",
        10 => "auto landing",
        11 => "forced landing",
        12 => "three-propeller landing",
        13 => "upgrading",
        14 => "disconnected",
        15 => "APAS",
        16 => "virtual stick",
        17 => "live flight control",
        _ => "unknown",
    }
}
