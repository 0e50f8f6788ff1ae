use std::fmt;
use std::time::Duration;

use bon::Builder;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::{SessionError, SessionResult};
use crate::state_machine::wrappers::system::{EpochMillis, SystemResource};
use crate::unit::UnitId;

/// Broker the gateway connects to for DRC traffic (`mqtt_broker` in `drc_mode_enter`).
#[derive(Clone, Serialize, Builder)]
pub struct BrokerConfig {
    /// `host:port` of the broker.
    #[builder(into)]
    pub address: String,
    #[builder(into)]
    pub client_id: String,
    #[builder(into)]
    pub username: String,
    #[builder(into)]
    pub password: String,
    /// Absolute expiry of the credentials, seconds since the Unix epoch.
    pub expire_time: u64,
    #[builder(default)]
    pub enable_tls: bool,
}

impl BrokerConfig {
    /// Credentials for `unit_id` valid for `ttl`, with a client id the gateway won't confuse
    /// with another operator instance.
    pub fn for_unit(
        unit_id: &UnitId,
        address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(3)
            .map(char::from)
            .collect();

        Self {
            address: address.into(),
            client_id: format!("drc-{unit_id}-{suffix}"),
            username: username.into(),
            password: password.into(),
            expire_time: EpochMillis::generate().as_secs() + ttl.as_secs(),
            enable_tls: false,
        }
    }

    /// Check every field the gateway needs against the wall clock `now`.
    pub fn validate(&self, now: EpochMillis) -> SessionResult<()> {
        let required = [
            ("address", &self.address),
            ("client_id", &self.client_id),
            ("username", &self.username),
            ("password", &self.password),
        ];
        if let Some((name, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(SessionError::invalid_argument(format!(
                "broker {name} must not be empty"
            )));
        }

        if !self.address.contains(':') {
            return Err(SessionError::invalid_argument(format!(
                "broker address '{}' must be host:port",
                self.address
            )));
        }

        if self.expire_time <= now.as_secs() {
            return Err(SessionError::invalid_argument(format!(
                "broker credentials expired at {}",
                self.expire_time
            )));
        }

        Ok(())
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("address", &self.address)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("expire_time", &self.expire_time)
            .field("enable_tls", &self.enable_tls)
            .finish()
    }
}

/// Everything `drc_mode_enter` carries.
#[derive(Debug, Clone, Builder)]
pub struct DrcModeRequest {
    pub broker: BrokerConfig,
    /// OSD push rate in Hz.
    #[builder(default = 30)]
    pub osd_frequency: u32,
    /// HSI push rate in Hz.
    #[builder(default = 10)]
    pub hsi_frequency: u32,
}

impl DrcModeRequest {
    pub fn validate(&self, now: EpochMillis) -> SessionResult<()> {
        self.broker.validate(now)?;
        for (name, hz) in [
            ("osd_frequency", self.osd_frequency),
            ("hsi_frequency", self.hsi_frequency),
        ] {
            if !(1..=100).contains(&hz) {
                return Err(SessionError::invalid_argument(format!(
                    "{name} must be within 1..=100 Hz, got {hz}"
                )));
            }
        }
        Ok(())
    }

    pub fn to_data(&self) -> SessionResult<Value> {
        Ok(json!({
            "mqtt_broker": serde_json::to_value(&self.broker)?,
            "osd_frequency": self.osd_frequency,
            "hsi_frequency": self.hsi_frequency,
        }))
    }
}

/// Identity presented when asking for control authority.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct AuthorityRequest {
    #[builder(into, default = "default_user".to_string())]
    pub user_id: String,
    #[builder(into, default = "Cloud Pilot".to_string())]
    pub user_callsign: String,
}

impl AuthorityRequest {
    pub fn validate(&self) -> SessionResult<()> {
        if self.user_id.trim().is_empty() {
            return Err(SessionError::invalid_argument("user_id must not be empty"));
        }
        if self.user_callsign.trim().is_empty() {
            return Err(SessionError::invalid_argument(
                "user_callsign must not be empty",
            ));
        }
        Ok(())
    }

    pub fn to_data(&self) -> Value {
        json!({
            "user_id": self.user_id,
            "user_callsign": self.user_callsign,
            "control_keys": ["flight"],
        })
    }
}

impl Default for AuthorityRequest {
    fn default() -> Self {
        Self::builder().build()
    }
}
