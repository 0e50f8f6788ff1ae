use std::time::Duration;

use bon::Builder;

/// Configuration for the request/response correlator.
#[derive(Debug, Clone, Builder)]
pub struct CorrelatorConfig {
    /// Timeout applied by [`call_default`](super::Correlator::call_default).
    #[builder(default = Duration::from_secs(10))]
    pub default_timeout: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
