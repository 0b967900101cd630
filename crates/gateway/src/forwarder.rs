//! The Inter-Replica Forwarder: ships requests and results between
//! replicas over `relay/replica/{id}/...` pub/sub topics (§4.5).
use futures::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use relay_protocol::ShapeHints;

/// A request forwarded from an origin replica to the replica that owns
/// the target peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedRequest {
    /// The origin replica's own `requestId`, carried back unchanged in
    /// the eventual result so it can re-key its local waiter.
    pub request_id: String,
    /// The replica the request was issued from.
    pub origin_replica: String,
    /// Target peer's client id.
    pub target_client_id: String,
    /// Wire `type` field for the outbound message to the peer.
    pub request_type: String,
    /// Opaque request payload.
    pub payload: Value,
    /// The originating request's formatting hints (§3), re-registered
    /// against the owning replica's own local waiter (§4.5 step 2) so
    /// its Response Router can apply the right special handler.
    pub shape_hints: ShapeHints,
}

/// The outcome of a forwarded request, published back to the origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedResult {
    /// Matches [`ForwardedRequest::request_id`].
    pub request_id: String,
    /// `Ok` payload, or an `error` string — never both.
    pub payload: Value,
    /// Present when the remote replica failed to service the request.
    pub error: Option<String>,
}

fn requests_topic(replica_id: &str) -> String {
    format!("relay/replica/{replica_id}/requests")
}

fn results_topic(replica_id: &str) -> String {
    format!("relay/replica/{replica_id}/results")
}

/// Publish half of the forwarder: every replica holds one of these to
/// ship work to peers owned elsewhere.
#[derive(Clone)]
pub struct Forwarder {
    conn: ConnectionManager,
}

impl Forwarder {
    /// Wrap an existing multiplexed connection for publishing.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Publish a request to the replica that owns the target peer.
    pub async fn publish_request(&self, target_replica: &str, request: &ForwardedRequest) -> crate::Result<()> {
        let payload = serde_json::to_string(request)?;
        let mut conn = self.conn.clone();
        let _: () = conn.publish(requests_topic(target_replica), payload).await?;
        Ok(())
    }

    /// Publish a result back to the replica that originated the request.
    pub async fn publish_result(&self, origin_replica: &str, result: &ForwardedResult) -> crate::Result<()> {
        let payload = serde_json::to_string(result)?;
        let mut conn = self.conn.clone();
        let _: () = conn.publish(results_topic(origin_replica), payload).await?;
        Ok(())
    }
}

/// Spawn a subscriber task listening on this replica's two topics,
/// forwarding decoded messages onto the returned channels. The task
/// runs until its client is dropped or the connection errors out.
pub async fn subscribe(
    client: redis::Client,
    this_replica: &str,
) -> crate::Result<(mpsc::Receiver<ForwardedRequest>, mpsc::Receiver<ForwardedResult>)> {
    let (req_tx, req_rx) = mpsc::channel(256);
    let (res_tx, res_rx) = mpsc::channel(256);

    let requests_channel = requests_topic(this_replica);
    let results_channel = results_topic(this_replica);

    let pubsub_conn = client.get_async_pubsub().await?;
    let mut pubsub = pubsub_conn;
    pubsub.subscribe(&requests_channel).await?;
    pubsub.subscribe(&results_channel).await?;

    tokio::spawn(async move {
        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel: String = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(err) => {
                    tracing::warn!(error = %err, "forwarder received non-utf8 payload");
                    continue;
                }
            };
            if channel.ends_with("/requests") {
                match serde_json::from_str::<ForwardedRequest>(&payload) {
                    Ok(req) => {
                        if req_tx.send(req).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "malformed forwarded request"),
                }
            } else if channel.ends_with("/results") {
                match serde_json::from_str::<ForwardedResult>(&payload) {
                    Ok(res) => {
                        if res_tx.send(res).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "malformed forwarded result"),
                }
            }
        }
    });

    Ok((req_rx, res_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_match_the_wire_layout() {
        assert_eq!(requests_topic("b"), "relay/replica/b/requests");
        assert_eq!(results_topic("a"), "relay/replica/a/results");
    }

    #[test]
    fn forwarded_request_round_trips_through_json() {
        let req = ForwardedRequest {
            request_id: "roll_1".into(),
            origin_replica: "a".into(),
            target_client_id: "c2".into(),
            request_type: "roll".into(),
            payload: serde_json::json!({"formula": "1d20"}),
            shape_hints: ShapeHints::default(),
        };
        let encoded = serde_json::to_string(&req).unwrap();
        let decoded: ForwardedRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.request_id, "roll_1");
        assert_eq!(decoded.target_client_id, "c2");
    }
}
