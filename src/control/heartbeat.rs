use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bon::Builder;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::state_machine::wrappers::system::{EpochMillis, SystemResource};
use crate::transport::{QoS, Transport};
use crate::unit::UnitId;

/// Heartbeat cadence and failure tolerance while DRC mode is active.
#[derive(Debug, Clone, Builder)]
pub struct HeartbeatConfig {
    /// Time between heartbeats. The gateway drops DRC mode after a few seconds of silence.
    #[builder(default = Duration::from_millis(200))]
    pub interval: Duration,
    /// Consecutive publish failures before the session is reported degraded.
    #[builder(default = 5)]
    pub failure_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Counters kept by a running heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    /// Sequence number of the last heartbeat attempted. Starts at 1.
    pub last_seq: u64,
    pub sent: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    /// Set once `consecutive_failures` reaches the threshold, cleared by the next success.
    pub degraded: bool,
}

/// A periodic `heart_beat` publisher on the unit's `drc/down` topic.
///
/// Dropping the task aborts it; [`stop`](Self::stop) also waits until the last tick has finished
/// so nothing is published after it returns.
#[derive(Debug)]
pub struct HeartbeatTask {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<Mutex<HeartbeatStats>>,
}

impl HeartbeatTask {
    pub fn spawn(
        unit_id: UnitId,
        transport: Arc<dyn Transport>,
        topic: String,
        config: HeartbeatConfig,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let stats = Arc::new(Mutex::new(HeartbeatStats::default()));

        let handle = tokio::spawn(run(
            unit_id,
            transport,
            topic,
            config,
            Arc::clone(&stats),
            stop_rx,
        ));

        Self {
            stop: Some(stop_tx),
            handle: Some(handle),
            stats,
        }
    }

    pub fn stats(&self) -> HeartbeatStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop publishing and wait for the task to exit.
    pub async fn stop(mut self) -> HeartbeatStats {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            // The task only ends by being told to, a join error here means it panicked.
            if let Err(e) = handle.await {
                warn!(error = %e, "heartbeat task ended abnormally");
            }
        }
        self.stats()
    }
}

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run(
    unit_id: UnitId,
    transport: Arc<dyn Transport>,
    topic: String,
    config: HeartbeatConfig,
    stats: Arc<Mutex<HeartbeatStats>>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(unit_id = %unit_id, interval_ms = config.interval.as_millis() as u64, "heartbeat started");

    let mut seq: u64 = 0;
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }

        seq += 1;
        let payload = json!({
            "seq": seq,
            "method": "heart_beat",
            "data": { "timestamp": EpochMillis::generate().as_u64() },
        });
        let result = transport.publish(&topic, Bytes::from(payload.to_string()), QoS::AtMostOnce);

        let mut stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.last_seq = seq;
        match result {
            Ok(()) => {
                stats.sent += 1;
                stats.consecutive_failures = 0;
                if stats.degraded {
                    stats.degraded = false;
                    info!(unit_id = %unit_id, seq, "heartbeat recovered");
                }
            }
            Err(e) => {
                stats.failures += 1;
                stats.consecutive_failures += 1;
                debug!(unit_id = %unit_id, seq, error = %e, "heartbeat publish failed");
                if !stats.degraded && stats.consecutive_failures >= config.failure_threshold {
                    stats.degraded = true;
                    warn!(
                        unit_id = %unit_id,
                        consecutive_failures = stats.consecutive_failures,
                        "heartbeat degraded, gateway may drop DRC mode"
                    );
                }
            }
        }
    }

    info!(unit_id = %unit_id, last_seq = seq, "heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{self, GatewayEnd};

    fn spawn(config: HeartbeatConfig) -> (HeartbeatTask, GatewayEnd) {
        let (transport, _events, gateway) = memory::pair(16);
        let task = HeartbeatTask::spawn(
            UnitId::from("SN1"),
            Arc::new(transport),
            "thing/product/SN1/drc/down".to_string(),
            config,
        );
        (task, gateway)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_starts_at_one_and_increases() {
        let (task, mut gateway) = spawn(HeartbeatConfig::default());

        let mut seqs = Vec::new();
        for _ in 0..3 {
            let beat = gateway.recv().await.unwrap();
            assert_eq!(beat.topic, "thing/product/SN1/drc/down");
            assert_eq!(beat.qos, QoS::AtMostOnce);
            let body = beat.json().unwrap();
            assert_eq!(body["method"], "heart_beat");
            assert!(body["data"]["timestamp"].as_u64().unwrap() > 0);
            seqs.push(body["seq"].as_u64().unwrap());
        }
        assert_eq!(seqs, vec![1, 2, 3]);

        let stats = task.stop().await;
        assert!(stats.sent >= 3);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_published_after_stop() {
        let (task, mut gateway) = spawn(HeartbeatConfig::default());
        gateway.recv().await.unwrap();

        task.stop().await;
        while gateway.try_recv().is_some() {}

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(gateway.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_after_threshold_and_recovers() {
        let config = HeartbeatConfig::builder().failure_threshold(3).build();
        let (task, mut gateway) = spawn(config);
        gateway.recv().await.unwrap();

        gateway.set_publish_failure(true);
        tokio::time::sleep(Duration::from_millis(700)).await;
        let stats = task.stats();
        assert!(stats.consecutive_failures >= 3);
        assert!(stats.degraded);

        gateway.set_publish_failure(false);
        tokio::time::sleep(Duration::from_millis(250)).await;
        let stats = task.stats();
        assert_eq!(stats.consecutive_failures, 0);
        assert!(!stats.degraded);

        // Failed ticks still consumed their sequence numbers.
        let seqs: Vec<u64> = std::iter::from_fn(|| gateway.try_recv())
            .map(|p| p.json().unwrap()["seq"].as_u64().unwrap())
            .collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert!(seqs[0] > 2);

        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts() {
        let (task, mut gateway) = spawn(HeartbeatConfig::default());
        gateway.recv().await.unwrap();

        drop(task);
        tokio::task::yield_now().await;
        while gateway.try_recv().is_some() {}

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(gateway.try_recv().is_none());
    }
}
