use std::ops::RangeInclusive;

use serde::Serialize;

use crate::error::{SessionError, SessionResult};

/// Valid stick channel values. 1024 is centered.
pub const STICK_RANGE: RangeInclusive<u16> = 364..=1684;
pub const STICK_NEUTRAL: u16 = 1024;

/// One virtual stick sample. The gateway expects 5-10 Hz while the sticks are deflected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StickCommand {
    /// Lateral translation, higher is right.
    pub roll: u16,
    /// Longitudinal translation, higher is forward.
    pub pitch: u16,
    /// Vertical, higher climbs.
    pub throttle: u16,
    /// Rotation, higher is clockwise.
    pub yaw: u16,
}

impl StickCommand {
    /// All channels centered: hover in place.
    pub const fn neutral() -> Self {
        Self {
            roll: STICK_NEUTRAL,
            pitch: STICK_NEUTRAL,
            throttle: STICK_NEUTRAL,
            yaw: STICK_NEUTRAL,
        }
    }

    pub fn validate(&self) -> SessionResult<()> {
        for (name, value) in [
            ("roll", self.roll),
            ("pitch", self.pitch),
            ("throttle", self.throttle),
            ("yaw", self.yaw),
        ] {
            if !STICK_RANGE.contains(&value) {
                return Err(SessionError::invalid_argument(format!(
                    "{name} must be within {}..={}, got {value}",
                    STICK_RANGE.start(),
                    STICK_RANGE.end()
                )));
            }
        }
        Ok(())
    }
}

impl Default for StickCommand {
    fn default() -> Self {
        Self::neutral()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neutral_is_valid() {
        assert!(StickCommand::neutral().validate().is_ok());
    }

    #[test]
    fn test_range_edges() {
        let low = StickCommand {
            roll: 364,
            ..StickCommand::neutral()
        };
        let high = StickCommand {
            yaw: 1684,
            ..StickCommand::neutral()
        };
        assert!(low.validate().is_ok());
        assert!(high.validate().is_ok());

        let out = StickCommand {
            throttle: 1685,
            ..StickCommand::neutral()
        };
        let err = out.validate().unwrap_err();
        assert!(err.to_string().contains("throttle"));
    }
}
