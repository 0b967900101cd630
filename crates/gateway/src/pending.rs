//! The Pending Request Table: correlates outstanding requests with the
//! handle needed to deliver their eventual result — an HTTP response
//! for locally-issued requests, or a forwarder channel for requests
//! relayed in from another replica (§3, §4.3, §4.5).
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;

use relay_protocol::{ErrorKind, RequestType, ShapeHints};

/// Monotonic, replica-local counter backing the `{type}_{monotonic}`
/// correlation id scheme (§4.3). This simply never repeats within the
/// process, which is the only property invariant I1 requires.
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The terminal outcome of a relayed request, handed back to whichever
/// sink is waiting on it.
#[derive(Debug)]
pub enum ResponseSink {
    /// The peer answered before the deadline elapsed.
    Ok(Value),
    /// The peer reported an application-level error for this request,
    /// or the waiter was reaped past its deadline.
    PeerError(String),
    /// A `download-file-result` resolved to raw bytes for a binary
    /// HTTP response, per §4.6's special handler.
    Binary {
        /// `Content-Type` to send.
        content_type: String,
        /// Suggested filename for `Content-Disposition`, if the peer
        /// supplied one.
        filename: Option<String>,
        /// Decoded file contents.
        bytes: Vec<u8>,
    },
}

/// What happens when a waiter resolves: deliver straight to the HTTP
/// edge that registered it, or publish the outcome back across the
/// Inter-Replica Forwarder to whichever replica it was forwarded from.
enum Sink {
    Local(oneshot::Sender<ResponseSink>),
    Forward {
        origin_replica: String,
        origin_request_id: String,
    },
}

/// A single outstanding request.
struct Waiter {
    deadline: DateTime<Utc>,
    sink: Sink,
    /// The originating request's formatting hints (§3), consulted by the
    /// Response Router's special handlers — never echoed by the peer.
    shape_hints: ShapeHints,
}

/// What a caller must do to complete a resolved waiter. Forwarding is
/// reported back rather than performed under the lock, since the PRT
/// holds no I/O handles (§5: "no I/O under the lock").
pub enum Resolution {
    /// No waiter was registered for this id (already taken, or never
    /// existed); the caller should log and discard.
    NotFound,
    /// The outcome was handed directly to the registered HTTP waiter.
    DeliveredLocally,
    /// The caller must publish `outcome` to `origin_replica`'s results
    /// topic, tagged with `origin_request_id`.
    Forward {
        origin_replica: String,
        origin_request_id: String,
        outcome: ResponseSink,
    },
}

/// Thread-safe map of `requestId -> Waiter`, guarded by a single lock
/// per the teacher's narrow-API convention (no raw map exposure).
#[derive(Default)]
pub struct PendingRequestTable {
    waiters: tokio::sync::Mutex<HashMap<String, Waiter>>,
}

impl PendingRequestTable {
    /// Construct an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh, replica-unique request id of the form
    /// `{type}_{monotonic}` (§4.3, invariant I1).
    pub fn new_request_id(kind: RequestType) -> String {
        let n = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{}_{n}", kind.as_str())
    }

    /// Register a waiter whose resolution must reach an HTTP response
    /// directly (this replica issued the request), returning the
    /// receiving half of its resolution channel.
    pub async fn register(
        &self,
        request_id: String,
        timeout: Duration,
        shape_hints: ShapeHints,
    ) -> oneshot::Receiver<ResponseSink> {
        let (tx, rx) = oneshot::channel();
        self.insert(request_id, timeout, Sink::Local(tx), shape_hints).await;
        rx
    }

    /// Register a waiter whose resolution must instead be published
    /// back across the forwarder to `origin_replica` (this replica is
    /// merely relaying on behalf of another, §4.5 step 2).
    pub async fn register_forward(
        &self,
        request_id: String,
        timeout: Duration,
        origin_replica: String,
        origin_request_id: String,
        shape_hints: ShapeHints,
    ) {
        self.insert(
            request_id,
            timeout,
            Sink::Forward {
                origin_replica,
                origin_request_id,
            },
            shape_hints,
        )
        .await;
    }

    async fn insert(&self, request_id: String, timeout: Duration, sink: Sink, shape_hints: ShapeHints) {
        let deadline = Utc::now() + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
        self.waiters
            .lock()
            .await
            .insert(request_id, Waiter { deadline, sink, shape_hints });
    }

    /// Look up the formatting hints the originating request carried,
    /// without disturbing the waiter. Returns the default (no hints) if
    /// no waiter is registered under this id — callers fall back to the
    /// fully generic pass-through path in that case.
    pub async fn shape_hints(&self, request_id: &str) -> ShapeHints {
        self.waiters
            .lock()
            .await
            .get(request_id)
            .map(|w| w.shape_hints.clone())
            .unwrap_or_default()
    }

    /// Resolve a waiter exactly once (invariant I4): the first
    /// resolution wins; a later resolution for the same id observes
    /// [`Resolution::NotFound`].
    pub async fn resolve(&self, request_id: &str, outcome: ResponseSink) -> Resolution {
        let waiter = self.waiters.lock().await.remove(request_id);
        match waiter {
            None => Resolution::NotFound,
            Some(Waiter { sink: Sink::Local(tx), .. }) => {
                let _ = tx.send(outcome);
                Resolution::DeliveredLocally
            }
            Some(Waiter {
                sink: Sink::Forward { origin_replica, origin_request_id },
                ..
            }) => Resolution::Forward {
                origin_replica,
                origin_request_id,
                outcome,
            },
        }
    }

    /// Cancel a waiter without resolving it (caller gave up first, e.g.
    /// the HTTP connection closed).
    pub async fn cancel(&self, request_id: &str) {
        self.waiters.lock().await.remove(request_id);
    }

    /// Sweep and resolve every waiter whose deadline has passed with a
    /// timeout, returning the forwards the caller must still publish
    /// (locally-sunk timeouts are delivered directly and need no further
    /// action).
    pub async fn reap_expired(&self) -> Vec<Resolution> {
        let now = Utc::now();
        let expired: Vec<Waiter> = {
            let mut waiters = self.waiters.lock().await;
            let expired_ids: Vec<String> = waiters
                .iter()
                .filter(|(_, w)| w.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            expired_ids.into_iter().filter_map(|id| waiters.remove(&id)).collect()
        };
        expired
            .into_iter()
            .map(|waiter| match waiter.sink {
                Sink::Local(tx) => {
                    let _ = tx.send(ResponseSink::PeerError(ErrorKind::Timeout.to_string()));
                    Resolution::DeliveredLocally
                }
                Sink::Forward { origin_replica, origin_request_id } => Resolution::Forward {
                    origin_replica,
                    origin_request_id,
                    outcome: ResponseSink::PeerError(ErrorKind::Timeout.to_string()),
                },
            })
            .collect()
    }

    /// Number of currently outstanding requests.
    pub async fn len(&self) -> usize {
        self.waiters.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_to_the_registered_receiver() {
        let prt = PendingRequestTable::new();
        let id = PendingRequestTable::new_request_id(RequestType::Roll);
        let rx = prt
            .register(id.clone(), Duration::from_secs(5), ShapeHints::default())
            .await;
        assert!(matches!(
            prt.resolve(&id, ResponseSink::Ok(Value::Bool(true))).await,
            Resolution::DeliveredLocally
        ));
        match rx.await.unwrap() {
            ResponseSink::Ok(Value::Bool(true)) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_is_exactly_once() {
        let prt = PendingRequestTable::new();
        let id = PendingRequestTable::new_request_id(RequestType::Roll);
        let _rx = prt
            .register(id.clone(), Duration::from_secs(5), ShapeHints::default())
            .await;
        assert!(matches!(
            prt.resolve(&id, ResponseSink::Ok(Value::Null)).await,
            Resolution::DeliveredLocally
        ));
        assert!(matches!(
            prt.resolve(&id, ResponseSink::Ok(Value::Null)).await,
            Resolution::NotFound
        ));
    }

    #[tokio::test]
    async fn forwarded_waiter_resolves_as_a_forward_instruction() {
        let prt = PendingRequestTable::new();
        let id = "roll_7".to_string();
        prt.register_forward(
            id.clone(),
            Duration::from_secs(5),
            "replica-a".into(),
            "roll_1".into(),
            ShapeHints::default(),
        )
        .await;
        match prt.resolve(&id, ResponseSink::Ok(Value::from(20))).await {
            Resolution::Forward { origin_replica, origin_request_id, outcome: ResponseSink::Ok(v) } => {
                assert_eq!(origin_replica, "replica-a");
                assert_eq!(origin_request_id, "roll_1");
                assert_eq!(v, Value::from(20));
            }
            _ => panic!("expected a forward resolution"),
        }
    }

    #[tokio::test]
    async fn shape_hints_are_retrievable_without_consuming_the_waiter() {
        let prt = PendingRequestTable::new();
        let id = PendingRequestTable::new_request_id(RequestType::GetSheet);
        let hints = ShapeHints {
            format: Some(relay_protocol::ResponseFormat::Json),
            active_tab: Some("inventory".to_string()),
        };
        let _rx = prt.register(id.clone(), Duration::from_secs(5), hints).await;
        let looked_up = prt.shape_hints(&id).await;
        assert_eq!(looked_up.active_tab.as_deref(), Some("inventory"));
        assert!(matches!(
            prt.resolve(&id, ResponseSink::Ok(Value::Null)).await,
            Resolution::DeliveredLocally
        ));
        assert_eq!(prt.shape_hints(&id).await.active_tab, None);
    }

    #[tokio::test]
    async fn reap_expired_resolves_local_waiters_with_timeout() {
        let prt = PendingRequestTable::new();
        let id = PendingRequestTable::new_request_id(RequestType::Roll);
        let rx = prt
            .register(id.clone(), Duration::from_millis(0), ShapeHints::default())
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reaped = prt.reap_expired().await;
        assert_eq!(reaped.len(), 1);
        assert!(matches!(reaped[0], Resolution::DeliveredLocally));
        assert!(matches!(rx.await.unwrap(), ResponseSink::PeerError(_)));
        assert_eq!(prt.len().await, 0);
    }

    #[tokio::test]
    async fn reap_expired_reports_forwards_for_the_caller_to_publish() {
        let prt = PendingRequestTable::new();
        let id = "roll_9".to_string();
        prt.register_forward(
            id,
            Duration::from_millis(0),
            "replica-a".into(),
            "roll_2".into(),
            ShapeHints::default(),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reaped = prt.reap_expired().await;
        assert_eq!(reaped.len(), 1);
        assert!(matches!(reaped[0], Resolution::Forward { .. }));
    }
}
