use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use super::StateMachine;
use super::wrappers::system::Stamped;

/// A telemetry field tracked by the state cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Latitude,
    Longitude,
    Height,
    AttitudeHead,
    HorizontalSpeed,
    SpeedX,
    SpeedY,
    SpeedZ,
    DownDistance,
    DownEnable,
    DownWork,
    BatteryPercent,
    ModeCode,
    RthAltitude,
    DistanceLimit,
    HeightLimit,
    IsInFixedSpeed,
    NightLightsState,
    Topology,
    PayloadIndex,
    GimbalPitch,
    GimbalRoll,
    GimbalYaw,
    FlyToId,
    FlyToStatus,
    FlyToResult,
    WayPointIndex,
    RemainingDistance,
    RemainingTime,
    PlannedPathPoints,
}

impl Field {
    pub const POSITION: [Field; 3] = [Field::Latitude, Field::Longitude, Field::Height];

    pub const FLY_TO: [Field; 7] = [
        Field::FlyToId,
        Field::FlyToStatus,
        Field::FlyToResult,
        Field::WayPointIndex,
        Field::RemainingDistance,
        Field::RemainingTime,
        Field::PlannedPathPoints,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::Latitude => "latitude",
            Field::Longitude => "longitude",
            Field::Height => "height",
            Field::AttitudeHead => "attitude_head",
            Field::HorizontalSpeed => "horizontal_speed",
            Field::SpeedX => "speed_x",
            Field::SpeedY => "speed_y",
            Field::SpeedZ => "speed_z",
            Field::DownDistance => "down_distance",
            Field::DownEnable => "down_enable",
            Field::DownWork => "down_work",
            Field::BatteryPercent => "battery_percent",
            Field::ModeCode => "mode_code",
            Field::RthAltitude => "rth_altitude",
            Field::DistanceLimit => "distance_limit",
            Field::HeightLimit => "height_limit",
            Field::IsInFixedSpeed => "is_in_fixed_speed",
            Field::NightLightsState => "night_lights_state",
            Field::Topology => "topology",
            Field::PayloadIndex => "payload_index",
            Field::GimbalPitch => "gimbal_pitch",
            Field::GimbalRoll => "gimbal_roll",
            Field::GimbalYaw => "gimbal_yaw",
            Field::FlyToId => "fly_to_id",
            Field::FlyToStatus => "flyto_status",
            Field::FlyToResult => "flyto_result",
            Field::WayPointIndex => "way_point_index",
            Field::RemainingDistance => "remaining_distance",
            Field::RemainingTime => "remaining_time",
            Field::PlannedPathPoints => "planned_path_points",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a field lives inside a message's `data` object. An empty path means the whole object.
type Extract = (Field, &'static [&'static str]);

const OSD: &[Extract] = &[
    (Field::Latitude, &["latitude"]),
    (Field::Longitude, &["longitude"]),
    (Field::Height, &["height"]),
    (Field::AttitudeHead, &["attitude_head"]),
    (Field::HorizontalSpeed, &["horizontal_speed"]),
    (Field::SpeedX, &["speed_x"]),
    (Field::SpeedY, &["speed_y"]),
    (Field::SpeedZ, &["speed_z"]),
];

const HSI: &[Extract] = &[
    (Field::DownDistance, &["down_distance"]),
    (Field::DownEnable, &["down_enable"]),
    (Field::DownWork, &["down_work"]),
];

const BATTERIES: &[Extract] = &[(Field::BatteryPercent, &["capacity_percent"])];

const DRONE_STATE: &[Extract] = &[
    (Field::ModeCode, &["mode_code"]),
    (Field::RthAltitude, &["rth_altitude"]),
    (Field::DistanceLimit, &["limit", "distance_limit"]),
    (Field::HeightLimit, &["limit", "height_limit"]),
    (Field::IsInFixedSpeed, &["is_in_fixed_speed"]),
    (Field::NightLightsState, &["night_lights_state"]),
];

const TOPOLOGY: &[Extract] = &[(Field::Topology, &[])];

const CAMERA_OSD: &[Extract] = &[
    (Field::PayloadIndex, &["payload_index"]),
    (Field::GimbalPitch, &["gimbal_pitch"]),
    (Field::GimbalRoll, &["gimbal_roll"]),
    (Field::GimbalYaw, &["gimbal_yaw"]),
];

const FLY_TO_PROGRESS: &[Extract] = &[
    (Field::FlyToId, &["fly_to_id"]),
    (Field::FlyToStatus, &["status"]),
    (Field::FlyToResult, &["result"]),
    (Field::WayPointIndex, &["way_point_index"]),
    (Field::RemainingDistance, &["remaining_distance"]),
    (Field::RemainingTime, &["remaining_time"]),
    (Field::PlannedPathPoints, &["planned_path_points"]),
];

pub const OSD_METHOD: &str = "osd_info_push";

/// The fields a telemetry `method` carries, or `None` if the method is not telemetry.
fn catalogue(method: &str) -> Option<&'static [Extract]> {
    match method {
        OSD_METHOD => Some(OSD),
        "hsi_info_push" => Some(HSI),
        "drc_batteries_info_push" => Some(BATTERIES),
        "drc_drone_state_push" => Some(DRONE_STATE),
        "update_topo" => Some(TOPOLOGY),
        "drc_camera_osd_info_push" => Some(CAMERA_OSD),
        "fly_to_point_progress" => Some(FLY_TO_PROGRESS),
        _ => None,
    }
}

fn extract(data: &Value, path: &[&str]) -> Value {
    path.iter()
        .try_fold(data, |node, key| node.get(key))
        .cloned()
        .unwrap_or(Value::Null)
}

/// The last value observed for a field and when it was observed.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub value: Value,
    pub observed_at: Instant,
}

impl Observation {
    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.value.as_i64()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.value.as_bool()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    /// Age of the observation relative to `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.observed_at)
    }
}

/// A point-in-time copy of some or all cached fields.
///
/// Fields that were never observed are simply missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    fields: HashMap<Field, Observation>,
}

impl StateSnapshot {
    pub fn get(&self, field: Field) -> Option<&Observation> {
        self.fields.get(&field)
    }

    /// The observed value, treating an observed `null` the same as a missing field.
    pub fn value(&self, field: Field) -> Option<&Value> {
        self.get(field).map(|o| &o.value).filter(|v| !v.is_null())
    }

    pub fn f64(&self, field: Field) -> Option<f64> {
        self.value(field).and_then(Value::as_f64)
    }

    pub fn i64(&self, field: Field) -> Option<i64> {
        self.value(field).and_then(Value::as_i64)
    }

    pub fn str(&self, field: Field) -> Option<&str> {
        self.value(field).and_then(Value::as_str)
    }

    pub fn contains(&self, field: Field) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Field, &Observation)> {
        self.fields.iter().map(|(field, obs)| (*field, obs))
    }
}

#[derive(Debug, Deserialize)]
struct TelemetryEnvelope {
    method: String,
    #[serde(default)]
    data: Value,
}

/// Machine backing the state cache: the latest observation of every known field.
#[derive(Debug)]
pub struct TelemetryMachine {
    fields: HashMap<Field, Observation>,
    takeoff_height: Option<f64>,
    osd_arrivals: VecDeque<Instant>,
    frequency_window: Duration,
    pending: VecDeque<TelemetryOutput>,
}

impl TelemetryMachine {
    pub fn new(frequency_window: Duration) -> Self {
        Self {
            fields: HashMap::new(),
            takeoff_height: None,
            osd_arrivals: VecDeque::new(),
            frequency_window,
            pending: VecDeque::new(),
        }
    }

    pub fn read(&self, field: Field) -> Option<&Observation> {
        self.fields.get(&field)
    }

    /// Copy `fields`, or every field when `None`.
    pub fn snapshot(&self, fields: Option<&[Field]>) -> StateSnapshot {
        let fields = match fields {
            Some(wanted) => wanted
                .iter()
                .filter_map(|f| self.fields.get(f).map(|obs| (*f, obs.clone())))
                .collect(),
            None => self.fields.clone(),
        };
        StateSnapshot { fields }
    }

    /// First non-null height ever observed.
    pub fn takeoff_height(&self) -> Option<f64> {
        self.takeoff_height
    }

    /// OSD messages per second over the trailing frequency window.
    pub fn osd_frequency(&self, now: Instant) -> f64 {
        let mut in_window = self
            .osd_arrivals
            .iter()
            .filter(|t| now.saturating_duration_since(**t) <= self.frequency_window);

        let Some(first) = in_window.next() else {
            return 0.0;
        };
        let (count, last) = in_window.fold((1usize, first), |(n, _), t| (n + 1, t));

        let span = last.saturating_duration_since(*first).as_secs_f64();
        if count < 2 || span == 0.0 {
            return 0.0;
        }
        (count - 1) as f64 / span
    }

    pub fn last_osd(&self) -> Option<Instant> {
        self.osd_arrivals.back().copied()
    }

    /// Whether an OSD message arrived within `timeout` of `now`.
    pub fn is_online(&self, now: Instant, timeout: Duration) -> bool {
        self.last_osd()
            .is_some_and(|t| now.saturating_duration_since(t) < timeout)
    }

    fn ingest(&mut self, topic: String, payload: &[u8], received_at: Instant) {
        let envelope: TelemetryEnvelope = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.pending.push_back(TelemetryOutput::Malformed {
                    topic,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let Some(extracts) = catalogue(&envelope.method) else {
            self.pending.push_back(TelemetryOutput::Ignored {
                topic,
                method: envelope.method,
            });
            return;
        };

        if !envelope.data.is_object() {
            self.pending.push_back(TelemetryOutput::Malformed {
                topic,
                reason: format!("'{}' data is not an object", envelope.method),
            });
            return;
        }

        let mut updated = Vec::with_capacity(extracts.len());
        for (field, path) in extracts {
            let value = extract(&envelope.data, path);
            self.fields.insert(
                *field,
                Observation {
                    value,
                    observed_at: received_at,
                },
            );
            updated.push(*field);
        }

        if envelope.method == OSD_METHOD {
            self.record_osd(received_at);
        }

        self.pending.push_back(TelemetryOutput::Applied {
            method: envelope.method,
            fields: updated,
        });
    }

    fn record_osd(&mut self, at: Instant) {
        if self.takeoff_height.is_none() {
            self.takeoff_height = self.fields.get(&Field::Height).and_then(Observation::as_f64);
        }

        self.osd_arrivals.push_back(at);
        while let Some(oldest) = self.osd_arrivals.front() {
            if at.saturating_duration_since(*oldest) > self.frequency_window {
                self.osd_arrivals.pop_front();
            } else {
                break;
            }
        }
    }
}

pub enum TelemetryInput {
    /// A raw message from a telemetry topic, stamped with its arrival time.
    Message(Stamped<(String, Bytes), Instant>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryOutput {
    /// The message was applied; `fields` were replaced together.
    Applied { method: String, fields: Vec<Field> },
    /// Well-formed, but not a telemetry method this cache tracks.
    Ignored { topic: String, method: String },
    /// Dropped because it could not be parsed.
    Malformed { topic: String, reason: String },
}

impl StateMachine for TelemetryMachine {
    type Input = TelemetryInput;
    type Output = TelemetryOutput;

    fn process_input(&mut self, input: Self::Input) {
        match input {
            TelemetryInput::Message(Stamped {
                input: (topic, payload),
                system: received_at,
            }) => self.ingest(topic, &payload, received_at),
        }
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.pending.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const WINDOW: Duration = Duration::from_secs(2);

    fn message(value: Value, at: Instant) -> TelemetryInput {
        TelemetryInput::Message(Stamped {
            input: ("thing/product/SN/drc/up".to_string(), Bytes::from(value.to_string())),
            system: at,
        })
    }

    fn osd(lat: f64, height: Option<f64>) -> Value {
        json!({
            "method": "osd_info_push",
            "data": { "latitude": lat, "longitude": 113.9, "height": height }
        })
    }

    #[test]
    fn test_initial_state() {
        let machine = TelemetryMachine::new(WINDOW);
        assert!(machine.read(Field::Latitude).is_none());
        assert!(machine.snapshot(None).is_empty());
        assert!(!machine.is_online(Instant::now(), WINDOW));
    }

    #[test]
    fn test_applies_every_catalogued_field() {
        let mut machine = TelemetryMachine::new(WINDOW);
        let now = Instant::now();

        machine.process_input(message(osd(22.5, Some(70.0)), now));

        let output = machine.poll_output();
        assert!(matches!(
            output,
            Some(TelemetryOutput::Applied { ref method, ref fields })
                if method == "osd_info_push" && fields.len() == 8
        ));
        assert!(machine.poll_output().is_none());

        assert_eq!(machine.read(Field::Latitude).unwrap().as_f64(), Some(22.5));
        assert_eq!(machine.read(Field::Latitude).unwrap().observed_at, now);
        // Catalogued but absent in the message: observed as null.
        assert_eq!(machine.read(Field::SpeedX).unwrap().value, Value::Null);
    }

    #[test]
    fn test_latest_update_wins_and_other_fields_untouched() {
        let mut machine = TelemetryMachine::new(WINDOW);
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(10);

        machine.process_input(message(osd(22.0, Some(50.0)), t0));
        machine.process_input(message(
            json!({ "method": "drc_batteries_info_push", "data": { "capacity_percent": 87 } }),
            t1,
        ));
        machine.process_input(message(osd(23.0, Some(55.0)), t1));

        assert_eq!(machine.read(Field::Latitude).unwrap().as_f64(), Some(23.0));
        assert_eq!(machine.read(Field::Latitude).unwrap().observed_at, t1);
        assert_eq!(machine.read(Field::BatteryPercent).unwrap().as_i64(), Some(87));
    }

    #[test]
    fn test_nested_limits_and_whole_topology() {
        let mut machine = TelemetryMachine::new(WINDOW);
        let now = Instant::now();

        machine.process_input(message(
            json!({
                "method": "drc_drone_state_push",
                "data": { "mode_code": 3, "limit": { "distance_limit": 5000, "height_limit": 120 } }
            }),
            now,
        ));
        machine.process_input(message(
            json!({ "method": "update_topo", "data": { "sub_devices": [{ "sn": "AC1" }] } }),
            now,
        ));

        assert_eq!(machine.read(Field::ModeCode).unwrap().as_i64(), Some(3));
        assert_eq!(machine.read(Field::HeightLimit).unwrap().as_i64(), Some(120));
        assert_eq!(
            machine.read(Field::Topology).unwrap().value,
            json!({ "sub_devices": [{ "sn": "AC1" }] })
        );
    }

    #[test]
    fn test_malformed_and_unknown_messages_do_not_touch_state() {
        let mut machine = TelemetryMachine::new(WINDOW);
        let now = Instant::now();

        machine.process_input(TelemetryInput::Message(Stamped {
            input: ("t".to_string(), Bytes::from_static(b"not json")),
            system: now,
        }));
        machine.process_input(message(json!({ "method": "osd_info_push", "data": 5 }), now));
        machine.process_input(message(json!({ "method": "something_else", "data": {} }), now));

        assert!(matches!(machine.poll_output(), Some(TelemetryOutput::Malformed { .. })));
        assert!(matches!(machine.poll_output(), Some(TelemetryOutput::Malformed { .. })));
        assert!(matches!(
            machine.poll_output(),
            Some(TelemetryOutput::Ignored { ref method, .. }) if method == "something_else"
        ));
        assert!(machine.snapshot(None).is_empty());
    }

    #[test]
    fn test_takeoff_height_is_first_non_null_height() {
        let mut machine = TelemetryMachine::new(WINDOW);
        let now = Instant::now();

        machine.process_input(message(osd(22.0, None), now));
        assert_eq!(machine.takeoff_height(), None);

        machine.process_input(message(osd(22.0, Some(40.0)), now));
        machine.process_input(message(osd(22.0, Some(90.0)), now));
        assert_eq!(machine.takeoff_height(), Some(40.0));
    }

    #[test]
    fn test_osd_frequency_and_online() {
        let mut machine = TelemetryMachine::new(WINDOW);
        let start = Instant::now();

        for i in 0..11 {
            machine.process_input(message(osd(22.0, None), start + Duration::from_millis(i * 100)));
        }
        let last = start + Duration::from_millis(1000);

        let hz = machine.osd_frequency(last);
        assert!((hz - 10.0).abs() < 1e-6, "got {hz}");
        assert!(machine.is_online(last, WINDOW));

        let much_later = last + Duration::from_secs(5);
        assert_eq!(machine.osd_frequency(much_later), 0.0);
        assert!(!machine.is_online(much_later, WINDOW));
    }

    #[test]
    fn test_snapshot_subset() {
        let mut machine = TelemetryMachine::new(WINDOW);
        let now = Instant::now();
        machine.process_input(message(osd(22.0, Some(10.0)), now));

        let snapshot = machine.snapshot(Some(&Field::POSITION));
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.f64(Field::Height), Some(10.0));
        assert!(!snapshot.contains(Field::SpeedX));

        let fly_to = machine.snapshot(Some(&Field::FLY_TO));
        assert!(fly_to.is_empty());
    }
}
