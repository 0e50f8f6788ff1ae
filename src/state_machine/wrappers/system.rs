use std::time::{Instant, SystemTime, UNIX_EPOCH};

use impl_trait_for_tuples::impl_for_tuples;

/// The [`SystemResource`] trait indicates that a type is a resource inherently provided by the
/// system context of the application.
///
/// Runners call [`generate`](SystemResource::generate) at the edge and hand the value to their
/// state machine as input, so the machine itself never reads the clock.
pub trait SystemResource {
    /// Produce an instance of this resource with no direct input, drawing only from the implicitly
    /// available global system context.
    fn generate() -> Self;
}

#[impl_for_tuples(2, 4)]
impl SystemResource for Tuple {
    fn generate() -> Self {
        for_tuples!( ( #( Tuple::generate() ),* ) )
    }
}

impl SystemResource for Instant {
    fn generate() -> Self {
        Instant::now()
    }
}

/// Wall clock time in milliseconds since the Unix epoch, as carried in protocol envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpochMillis(pub u64);

impl EpochMillis {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Seconds since the epoch, truncated.
    pub fn as_secs(self) -> u64 {
        self.0 / 1000
    }
}

impl SystemResource for EpochMillis {
    fn generate() -> Self {
        // A clock set before 1970 reads as the epoch rather than failing.
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        EpochMillis(millis)
    }
}

/// An input paired with the system resources observed when it was received.
#[derive(Debug, Clone)]
pub struct Stamped<I, S> {
    pub input: I,
    pub system: S,
}

impl<I, S: SystemResource> Stamped<I, S> {
    /// Stamp `input` with freshly generated resources.
    pub fn now(input: I) -> Self {
        Self {
            input,
            system: S::generate(),
        }
    }
}
