//! Request/response correlation over the gateway's service topics.
//!
//! A call publishes `{tid, bid, timestamp, method, data}` on the request topic and waits for the
//! reply carrying the same `tid` on the reply topic. Replies are matched on `tid` alone and the
//! first one wins; later replies with that id, and replies for calls that already timed out, are
//! logged as orphans and dropped.
//!
//! ```ignore
//! let output = correlator
//!     .call("drc_mode_exit", json!({}), Duration::from_secs(5))
//!     .await?;
//! ```

mod config;
mod envelope;
mod transaction;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::state_machine::wrappers::system::{EpochMillis, SystemResource};
use crate::transport::{QoS, Transport};
use crate::unit::UnitId;

pub use config::CorrelatorConfig;
pub use envelope::{ReplyEnvelope, RequestEnvelope};
pub use transaction::TransactionId;

use envelope::{Verdict, reply_tid};
use transaction::{PendingGuard, PendingTable, Transaction};

/// Turns publishes into awaitable calls.
pub struct Correlator {
    unit_id: UnitId,
    request_topic: String,
    transport: Arc<dyn Transport>,
    pending: PendingTable,
    connected: AtomicBool,
    config: CorrelatorConfig,
}

impl Correlator {
    /// Create a correlator publishing requests for `unit_id` through `transport`.
    ///
    /// Replies must be fed in through [`handle_reply`](Self::handle_reply).
    pub fn new(unit_id: UnitId, transport: Arc<dyn Transport>, config: CorrelatorConfig) -> Self {
        let request_topic = unit_id.topics().services;
        Self {
            unit_id,
            request_topic,
            transport,
            pending: PendingTable::default(),
            connected: AtomicBool::new(true),
            config,
        }
    }

    /// Call `method` with `data` and wait up to `timeout` for the reply's `output`.
    ///
    /// # Errors
    ///
    /// * [`SessionError::InvalidArgument`] if `method` is empty.
    /// * [`SessionError::TransportLost`] if the transport is down or drops before the reply.
    /// * [`SessionError::Publish`] if the transport refused the request.
    /// * [`SessionError::RemoteRejected`] if the reply carries a nonzero result.
    /// * [`SessionError::MalformedReply`] if the reply matched but its body was unreadable.
    /// * [`SessionError::Timeout`] if no reply arrived within `timeout`.
    pub async fn call(&self, method: &str, data: Value, timeout: Duration) -> SessionResult<Value> {
        if method.is_empty() {
            return Err(SessionError::invalid_argument("method must not be empty"));
        }
        if !self.is_connected() {
            return Err(SessionError::TransportLost);
        }

        let id = TransactionId::generate();
        let payload = serde_json::to_vec(&RequestEnvelope {
            tid: id.as_str(),
            bid: id.as_str(),
            timestamp: EpochMillis::generate().as_u64(),
            method,
            data: &data,
        })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            Transaction {
                method: method.to_string(),
                created_at: Instant::now(),
                reply: reply_tx,
            },
        );
        let _guard = PendingGuard {
            table: &self.pending,
            id: id.clone(),
        };

        // A disconnect that raced the insert has already drained the table without us.
        if !self.is_connected() {
            return Err(SessionError::TransportLost);
        }

        self.transport
            .publish(&self.request_topic, Bytes::from(payload), QoS::AtLeastOnce)?;

        debug!(
            unit_id = %self.unit_id,
            method = %method,
            tid = %id.short(),
            "request published"
        );

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::TransportLost),
            Err(_) => {
                warn!(
                    unit_id = %self.unit_id,
                    method = %method,
                    tid = %id.short(),
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(SessionError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// [`call`](Self::call) with the configured default timeout.
    pub async fn call_default(&self, method: &str, data: Value) -> SessionResult<Value> {
        self.call(method, data, self.config.default_timeout).await
    }

    /// Match a payload from the reply topic to its pending call.
    ///
    /// Only `tid` has to be readable for a reply to resolve its call; a body that cannot be
    /// interpreted fails the call with [`SessionError::MalformedReply`].
    pub fn handle_reply(&self, payload: &[u8]) {
        let reply: Value = match serde_json::from_slice(payload) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(unit_id = %self.unit_id, error = %e, "dropping malformed reply");
                return;
            }
        };
        let Some(tid) = reply_tid(&reply) else {
            warn!(unit_id = %self.unit_id, "dropping reply without tid");
            return;
        };

        let id = TransactionId::from(tid);
        let Some((_, transaction)) = self.pending.remove(&id) else {
            debug!(
                unit_id = %self.unit_id,
                tid = %id.short(),
                method = reply.get("method").and_then(serde_json::Value::as_str).unwrap_or("?"),
                "orphaned reply"
            );
            return;
        };

        let elapsed_ms = transaction.created_at.elapsed().as_millis() as u64;
        let result = match Verdict::of(reply) {
            Verdict::Accepted(output) => {
                debug!(
                    unit_id = %self.unit_id,
                    method = %transaction.method,
                    tid = %id.short(),
                    elapsed_ms,
                    "reply received"
                );
                Ok(output)
            }
            Verdict::Rejected { code, message } => {
                warn!(
                    unit_id = %self.unit_id,
                    method = %transaction.method,
                    code,
                    message = message.as_deref().unwrap_or(""),
                    "request rejected by gateway"
                );
                Err(SessionError::RemoteRejected {
                    method: transaction.method,
                    code,
                    message,
                })
            }
            Verdict::Malformed(reason) => {
                warn!(
                    unit_id = %self.unit_id,
                    method = %transaction.method,
                    tid = %id.short(),
                    reason = %reason,
                    "unreadable reply"
                );
                Err(SessionError::MalformedReply {
                    method: transaction.method,
                    reason,
                })
            }
        };

        if transaction.reply.send(result).is_err() {
            debug!(unit_id = %self.unit_id, tid = %id.short(), "caller gone before reply");
        }
    }

    /// Fail every pending call with [`SessionError::TransportLost`] and refuse new calls until
    /// [`mark_connected`](Self::mark_connected). Returns how many calls were failed.
    pub fn fail_all(&self) -> usize {
        self.connected.store(false, Ordering::SeqCst);

        let ids: Vec<TransactionId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, transaction)) = self.pending.remove(&id) {
                let _ = transaction.reply.send(Err(SessionError::TransportLost));
                failed += 1;
            }
        }

        if failed > 0 {
            warn!(unit_id = %self.unit_id, failed, "transport lost, failed pending calls");
        }
        failed
    }

    /// Accept calls again after the transport reconnected.
    pub fn mark_connected(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!(unit_id = %self.unit_id, "transport reconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of calls waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn unit_id(&self) -> &UnitId {
        &self.unit_id
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("unit_id", &self.unit_id)
            .field("pending", &self.pending.len())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::memory::{self, GatewayEnd, Published};
    use serde_json::json;

    fn setup() -> (Arc<Correlator>, GatewayEnd) {
        let (transport, _events, gateway) = memory::pair(64);
        let correlator = Correlator::new(
            UnitId::from("SN1"),
            Arc::new(transport),
            CorrelatorConfig::default(),
        );
        (Arc::new(correlator), gateway)
    }

    fn reply_to(request: &Published, data: Value) -> Vec<u8> {
        let request = request.json().unwrap();
        serde_json::to_vec(&json!({
            "tid": request["tid"],
            "method": request["method"],
            "data": data,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_call_resolves_with_output() {
        let (correlator, mut gateway) = setup();

        let call = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .call("return_home", json!({}), Duration::from_secs(5))
                    .await
            })
        };

        let request = gateway.recv().await.unwrap();
        assert_eq!(request.topic, "thing/product/SN1/services");
        let body = request.json().unwrap();
        assert_eq!(body["method"], "return_home");
        assert_eq!(body["tid"], body["bid"]);
        assert!(body["timestamp"].as_u64().unwrap() > 0);

        correlator.handle_reply(&reply_to(
            &request,
            json!({ "result": 0, "output": { "status": "ok" } }),
        ));

        let output = call.await.unwrap().unwrap();
        assert_eq!(output, json!({ "status": "ok" }));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_nonzero_result_is_remote_rejected() {
        let (correlator, mut gateway) = setup();

        let call = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .call("drc_mode_enter", json!({}), Duration::from_secs(5))
                    .await
            })
        };

        let request = gateway.recv().await.unwrap();
        correlator.handle_reply(&reply_to(&request, json!({ "result": 319_042 })));

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteRejected);
        assert_eq!(err.remote_code(), Some(319_042));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_pending_and_late_reply_is_dropped() {
        let (correlator, mut gateway) = setup();

        let err = correlator
            .call("fly_to_point", json!({}), Duration::from_millis(500))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(correlator.pending_count(), 0);

        // The late reply finds nothing to resolve.
        let request = gateway.recv().await.unwrap();
        correlator.handle_reply(&reply_to(&request, json!({ "result": 0 })));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_replies_matched_by_tid_out_of_order() {
        let (correlator, mut gateway) = setup();

        let first = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator.call("a", json!({}), Duration::from_secs(5)).await
            })
        };
        let req_a = gateway.recv().await.unwrap();

        let second = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator.call("b", json!({}), Duration::from_secs(5)).await
            })
        };
        let req_b = gateway.recv().await.unwrap();
        assert_eq!(correlator.pending_count(), 2);

        correlator.handle_reply(&reply_to(&req_b, json!({ "result": 0, "output": "b" })));
        correlator.handle_reply(&reply_to(&req_a, json!({ "result": 0, "output": "a" })));

        assert_eq!(first.await.unwrap().unwrap(), json!("a"));
        assert_eq!(second.await.unwrap().unwrap(), json!("b"));
    }

    #[tokio::test]
    async fn test_duplicate_reply_is_ignored() {
        let (correlator, mut gateway) = setup();

        let call = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator.call("a", json!({}), Duration::from_secs(5)).await
            })
        };
        let request = gateway.recv().await.unwrap();

        correlator.handle_reply(&reply_to(&request, json!({ "result": 0, "output": 1 })));
        correlator.handle_reply(&reply_to(&request, json!({ "result": 5, "output": 2 })));

        assert_eq!(call.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_fail_all_fails_every_pending_call_immediately() {
        let (correlator, mut gateway) = setup();

        let calls: Vec<_> = (0..3)
            .map(|i| {
                let correlator = Arc::clone(&correlator);
                tokio::spawn(async move {
                    correlator
                        .call(&format!("m{i}"), json!({}), Duration::from_secs(3600))
                        .await
                })
            })
            .collect();
        for _ in 0..3 {
            gateway.recv().await.unwrap();
        }

        assert_eq!(correlator.fail_all(), 3);

        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TransportLost);
        }
        assert_eq!(correlator.pending_count(), 0);

        // Refused until the transport comes back.
        let err = correlator
            .call("m", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportLost);

        correlator.mark_connected();
        assert!(correlator.is_connected());
    }

    #[tokio::test]
    async fn test_publish_failure_surfaces_and_cleans_up() {
        let (correlator, gateway) = setup();
        gateway.set_publish_failure(true);

        let err = correlator
            .call("a", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Publish(_)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_call_releases_pending_entry() {
        let (correlator, mut gateway) = setup();

        let call = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator.call("a", json!({}), Duration::from_secs(3600)).await
            })
        };
        gateway.recv().await.unwrap();
        assert_eq!(correlator.pending_count(), 1);

        call.abort();
        let _ = call.await;

        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_method_is_rejected_locally() {
        let (correlator, mut gateway) = setup();

        let err = correlator
            .call("", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(gateway.try_recv().is_none());
    }

    #[test]
    fn test_malformed_reply_is_dropped() {
        let (correlator, _gateway) = setup();
        correlator.handle_reply(b"garbage");
        correlator.handle_reply(br#"{"no_tid": true}"#);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_reply_fails_its_call_immediately() {
        let (correlator, mut gateway) = setup();

        let bodies = [
            json!({ "method": "m", "info": { "message": "busy" }, "data": {} }),
            json!({ "method": "m", "data": { "result": "0" } }),
            json!({ "method": "m", "data": "oops" }),
        ];
        for body in bodies {
            let call = {
                let correlator = Arc::clone(&correlator);
                tokio::spawn(async move {
                    correlator.call("m", json!({}), Duration::from_secs(5)).await
                })
            };
            let request = gateway.recv().await.unwrap();
            let mut reply = body;
            reply["tid"] = request.json().unwrap()["tid"].clone();

            let started = tokio::time::Instant::now();
            correlator.handle_reply(&serde_json::to_vec(&reply).unwrap());
            assert_eq!(correlator.pending_count(), 0);

            let err = call.await.unwrap().unwrap_err();
            assert!(matches!(err, SessionError::MalformedReply { .. }), "{err:?}");
            assert_eq!(err.kind(), ErrorKind::RemoteRejected);
            assert!(started.elapsed() < Duration::from_secs(5));
        }
    }

    #[tokio::test]
    async fn test_null_data_reply_resolves() {
        let (correlator, mut gateway) = setup();

        let call = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator.call("m", json!({}), Duration::from_secs(5)).await
            })
        };
        let request = gateway.recv().await.unwrap();
        correlator.handle_reply(&reply_to(&request, Value::Null));

        assert_eq!(call.await.unwrap().unwrap(), Value::Null);
    }
}
