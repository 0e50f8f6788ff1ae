//! Waiting on long-running maneuvers through the state cache.
//!
//! The gateway reports maneuver progress as telemetry, not as a reply, so completion is
//! observed by polling the cache until a caller-supplied predicate holds. Fields that have not
//! been reported yet read as absent and count as "not done".
//!
//! Dropping the returned future or stream stops the polling; nothing keeps running behind it.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::error::SessionError;
use crate::state_cache::StateCache;
use crate::state_machine::telemetry::{Field, StateSnapshot};

/// Lower bound on the poll interval; a zero period would spin.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Stand-in deadline for timeouts too large to add to the clock, such as `Duration::MAX`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

/// No terminal snapshot was observed before the deadline.
#[derive(Debug, Error)]
#[error("no terminal state after {after:?}")]
pub struct MonitorTimeout {
    /// The last snapshot read before giving up.
    pub last: StateSnapshot,
    pub after: Duration,
}

impl From<MonitorTimeout> for SessionError {
    fn from(e: MonitorTimeout) -> Self {
        SessionError::Timeout {
            method: "await_completion".to_string(),
            after: e.after,
        }
    }
}

/// Poll `fields` every `poll_interval` until `is_terminal` holds, or fail after `timeout`.
///
/// The first read happens immediately.
pub async fn await_completion<F>(
    cache: &StateCache,
    fields: &[Field],
    mut is_terminal: F,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<StateSnapshot, MonitorTimeout>
where
    F: FnMut(&StateSnapshot) -> bool,
{
    let deadline = deadline_after(timeout);
    let mut ticker = tokio::time::interval(poll_interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut polls: u64 = 0;
    loop {
        let expired = tokio::select! {
            _ = ticker.tick() => false,
            _ = tokio::time::sleep_until(deadline) => true,
        };

        let snapshot = cache.snapshot_of(fields);
        polls += 1;
        if is_terminal(&snapshot) {
            debug!(polls, "terminal state observed");
            return Ok(snapshot);
        }

        if expired {
            debug!(polls, timeout_ms = timeout.as_millis() as u64, "monitor timed out");
            return Err(MonitorTimeout {
                last: snapshot,
                after: timeout,
            });
        }
    }
}

/// What a [`monitor`] stream reports.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// The watched fields changed but the maneuver is not done.
    Update(StateSnapshot),
    /// `is_terminal` held. Last item of the stream.
    Completed(StateSnapshot),
    /// The deadline passed first. Last item of the stream.
    TimedOut(StateSnapshot),
}

impl ProgressEvent {
    pub fn snapshot(&self) -> &StateSnapshot {
        match self {
            ProgressEvent::Update(s) | ProgressEvent::Completed(s) | ProgressEvent::TimedOut(s) => s,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, ProgressEvent::Update(_))
    }
}

/// Streaming form of [`await_completion`]: yields an [`ProgressEvent::Update`] for every poll
/// that saw new telemetry, then one final event.
pub fn monitor<F>(
    cache: Arc<StateCache>,
    fields: Vec<Field>,
    mut is_terminal: F,
    poll_interval: Duration,
    timeout: Duration,
) -> impl Stream<Item = ProgressEvent> + Send + 'static
where
    F: FnMut(&StateSnapshot) -> bool + Send + 'static,
{
    stream! {
        let deadline = deadline_after(timeout);
        let mut updates = cache.subscribe();
        let mut ticker = tokio::time::interval(poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut first = true;

        loop {
            let expired = tokio::select! {
                _ = ticker.tick() => false,
                _ = tokio::time::sleep_until(deadline) => true,
            };

            let changed = updates.has_changed().unwrap_or(false);
            if changed {
                let _ = updates.borrow_and_update();
            }

            let snapshot = cache.snapshot_of(&fields);
            if is_terminal(&snapshot) {
                yield ProgressEvent::Completed(snapshot);
                break;
            }
            if expired {
                yield ProgressEvent::TimedOut(snapshot);
                break;
            }
            if changed || first {
                yield ProgressEvent::Update(snapshot);
            }
            first = false;
        }
    }
}

/// Every change of `fields`, starting with their current values. Never ends on its own.
pub fn snapshots(
    cache: Arc<StateCache>,
    fields: Vec<Field>,
) -> impl Stream<Item = StateSnapshot> + Send + 'static {
    WatchStream::new(cache.subscribe()).map(move |_| cache.snapshot_of(&fields))
}
