//! One-shot flight services that don't change the control session's state.

use std::time::Duration;

use bon::Builder;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};
use crate::link::DeviceLink;
use crate::progress::{self, MonitorTimeout};
use crate::state_machine::telemetry::{Field, StateSnapshot};

pub const METHOD_FLY_TO_POINT: &str = "fly_to_point";
pub const METHOD_RETURN_HOME: &str = "return_home";

/// How often [`wait_for_fly_to`] reads the cache.
const FLY_TO_POLL: Duration = Duration::from_millis(500);

/// A single fly-to destination.
#[derive(Debug, Clone, Copy, PartialEq, Builder)]
pub struct FlyToTarget {
    /// Degrees, -90..=90.
    pub latitude: f64,
    /// Degrees, -180..=180.
    pub longitude: f64,
    /// Meters, ellipsoid height.
    pub height: f64,
    /// Meters per second, 0..=15.
    #[builder(default = 12.0)]
    pub max_speed: f64,
}

impl FlyToTarget {
    pub fn validate(&self) -> SessionResult<()> {
        let checks = [
            ("latitude", self.latitude, -90.0, 90.0),
            ("longitude", self.longitude, -180.0, 180.0),
            ("max_speed", self.max_speed, 0.0, 15.0),
        ];
        for (name, value, min, max) in checks {
            if !(min..=max).contains(&value) {
                return Err(SessionError::invalid_argument(format!(
                    "{name} must be within {min}..={max}, got {value}"
                )));
            }
        }
        if !self.height.is_finite() {
            return Err(SessionError::invalid_argument("height must be finite"));
        }
        Ok(())
    }
}

/// Terminal `flyto_status` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlyToStatus {
    Ok,
    Failed,
    Cancelled,
}

impl FlyToStatus {
    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "wayline_ok" => Some(FlyToStatus::Ok),
            "wayline_failed" => Some(FlyToStatus::Failed),
            "wayline_cancel" => Some(FlyToStatus::Cancelled),
            _ => None,
        }
    }
}

/// How a fly-to ended.
#[derive(Debug, Clone)]
pub struct FlyToOutcome {
    pub status: FlyToStatus,
    /// The gateway's `result` code, 0 on success.
    pub result: Option<i64>,
    pub snapshot: StateSnapshot,
}

impl FlyToOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == FlyToStatus::Ok
    }
}

/// Send the aircraft to `target`. Returns the generated `fly_to_id` that progress reports carry.
pub async fn fly_to_point(link: &DeviceLink, target: FlyToTarget) -> SessionResult<String> {
    target.validate()?;

    let fly_to_id = Uuid::new_v4().to_string();
    let data = json!({
        "fly_to_id": fly_to_id,
        "max_speed": target.max_speed,
        "points": [{
            "latitude": target.latitude,
            "longitude": target.longitude,
            "height": target.height,
        }],
    });

    link.call_default(METHOD_FLY_TO_POINT, data).await?;
    info!(
        unit_id = %link.unit_id(),
        fly_to_id = %fly_to_id,
        latitude = target.latitude,
        longitude = target.longitude,
        height = target.height,
        "fly-to accepted"
    );
    Ok(fly_to_id)
}

/// Wait until the progress reports for `fly_to_id` reach a terminal status.
///
/// Reports for other fly-to ids are not terminal, so a stale report from an earlier flight
/// doesn't end the wait.
pub async fn wait_for_fly_to(
    link: &DeviceLink,
    fly_to_id: &str,
    timeout: Duration,
) -> SessionResult<FlyToOutcome> {
    let is_terminal = |snapshot: &StateSnapshot| {
        snapshot.str(Field::FlyToId) == Some(fly_to_id)
            && snapshot
                .str(Field::FlyToStatus)
                .and_then(FlyToStatus::parse)
                .is_some()
    };

    let snapshot = progress::await_completion(
        link.cache(),
        &Field::FLY_TO,
        is_terminal,
        FLY_TO_POLL.min(timeout),
        timeout,
    )
    .await
    .map_err(|e: MonitorTimeout| SessionError::Timeout {
        method: METHOD_FLY_TO_POINT.to_string(),
        after: e.after,
    })?;

    let status = snapshot
        .str(Field::FlyToStatus)
        .and_then(FlyToStatus::parse)
        .ok_or_else(|| SessionError::invalid_argument("terminal snapshot without status"))?;
    let result = snapshot.i64(Field::FlyToResult);

    info!(unit_id = %link.unit_id(), fly_to_id = %fly_to_id, ?status, ?result, "fly-to finished");
    Ok(FlyToOutcome {
        status,
        result,
        snapshot,
    })
}

/// Ask the aircraft to return to its home point.
pub async fn return_home(link: &DeviceLink) -> SessionResult<()> {
    link.call_default(METHOD_RETURN_HOME, json!({})).await?;
    info!(unit_id = %link.unit_id(), "return home accepted");
    Ok(())
}
