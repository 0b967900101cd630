//! The Dispatcher: resolves a target client id to local-vs-remote and
//! routes the request accordingly (§4.4).
use std::{sync::Arc, time::Duration};

use relay_protocol::{ErrorKind, OutboundEnvelope, RequestType, ShapeHints};
use serde_json::{Map, Value};

use crate::{
    auth::{Auth, AuthDecision},
    directory::GlobalDirectory,
    forwarder::{ForwardedRequest, Forwarder},
    pending::{PendingRequestTable, ResponseSink},
    registry::LocalClientTable,
};

/// A fully-formed outbound request, built by the HTTP edge and handed
/// to the Dispatcher. Mirrors §3's Waiter fields that originate at the
/// edge rather than from a forwarded message.
pub struct RelayRequest {
    /// Request type tag, used both for the wire `type` and for routing
    /// to special response handling.
    pub kind: RequestType,
    /// Caller's API key, already authenticated by the HTTP edge.
    pub api_key: String,
    /// The peer this request targets.
    pub target_client_id: String,
    /// Opaque request payload, merged onto the outbound envelope.
    pub payload: Map<String, Value>,
    /// How long to wait before the waiter resolves with a timeout.
    pub deadline: Duration,
    /// Formatting hints for the eventual response (§3), carried through
    /// to the Response Router's special handlers rather than read back
    /// off the peer's reply.
    pub shape_hints: ShapeHints,
}

/// A dispatched request's correlation id together with the receiver
/// that resolves once its waiter completes. The HTTP edge needs the id
/// back to stitch `requestId` into the response body (§4.6 step 3).
pub struct DispatchedRequest {
    /// The correlation id assigned to this request.
    pub request_id: String,
    /// Resolves with the eventual outcome.
    pub rx: tokio::sync::oneshot::Receiver<ResponseSink>,
}

/// Accepts outbound requests, resolves local-vs-remote ownership of the
/// target client id, and routes to the local Peer Session or to the
/// Inter-Replica Forwarder.
pub struct Dispatcher {
    registry: Arc<LocalClientTable>,
    directory: Arc<GlobalDirectory>,
    pending: Arc<PendingRequestTable>,
    forwarder: Option<Forwarder>,
    instance_id: String,
}

impl Dispatcher {
    /// Construct a dispatcher wired to this replica's registry,
    /// directory and pending table.
    pub fn new(
        registry: Arc<LocalClientTable>,
        directory: Arc<GlobalDirectory>,
        pending: Arc<PendingRequestTable>,
        forwarder: Option<Forwarder>,
        instance_id: String,
    ) -> Self {
        Self {
            registry,
            directory,
            pending,
            forwarder,
            instance_id,
        }
    }

    /// This replica's forwarder, if cross-replica routing is enabled.
    pub fn forwarder(&self) -> Option<Forwarder> {
        self.forwarder.clone()
    }

    /// Execute the dispatch algorithm in §4.4, returning a receiver that
    /// resolves with the eventual outcome.
    pub async fn dispatch(&self, auth: &dyn Auth, request: RelayRequest) -> crate::Result<DispatchedRequest> {
        match auth.authorize_client(&request.api_key, &request.target_client_id).await {
            AuthDecision::Allowed => {}
            _ => return Err(ErrorKind::AuthDenied("api key not authorized for client".into()).into()),
        }

        if self.registry.contains(&request.target_client_id).await {
            return self.dispatch_local(request).await;
        }

        match self.directory.get(&request.target_client_id).await {
            Some(replica) if replica != self.instance_id => self.dispatch_remote(replica, request).await,
            Some(_) => Err(ErrorKind::NotFound(request.target_client_id).into()),
            None => Err(ErrorKind::NotFound(request.target_client_id).into()),
        }
    }

    async fn dispatch_local(&self, request: RelayRequest) -> crate::Result<DispatchedRequest> {
        let request_id = PendingRequestTable::new_request_id(request.kind);
        let rx = self
            .pending
            .register(request_id.clone(), request.deadline, request.shape_hints.clone())
            .await;

        let mut extra = request.payload;
        extra.insert("clientId".into(), Value::String(request.target_client_id.clone()));
        let envelope = OutboundEnvelope {
            kind: request.kind.as_str().to_string(),
            request_id: request_id.clone(),
            extra,
        };
        let frame = serde_json::to_string(&envelope)?;

        let sent = self
            .registry
            .send_to_client(&request.target_client_id, frame)
            .await
            .unwrap_or(false);

        if !sent {
            self.pending.cancel(&request_id).await;
            return Err(ErrorKind::UpstreamUnavailable("peer send failed".into()).into());
        }

        Ok(DispatchedRequest { request_id, rx })
    }

    async fn dispatch_remote(&self, replica: String, request: RelayRequest) -> crate::Result<DispatchedRequest> {
        let Some(forwarder) = &self.forwarder else {
            return Err(ErrorKind::UpstreamUnavailable("forwarder not configured".into()).into());
        };

        let request_id = PendingRequestTable::new_request_id(request.kind);
        let rx = self
            .pending
            .register(request_id.clone(), request.deadline, request.shape_hints.clone())
            .await;

        let forwarded = ForwardedRequest {
            request_id: request_id.clone(),
            origin_replica: self.instance_id.clone(),
            target_client_id: request.target_client_id,
            request_type: request.kind.as_str().to_string(),
            payload: Value::Object(request.payload),
            shape_hints: request.shape_hints,
        };

        if forwarder.publish_request(&replica, &forwarded).await.is_err() {
            self.pending.cancel(&request_id).await;
            return Err(ErrorKind::UpstreamUnavailable("broker publish failed".into()).into());
        }

        Ok(DispatchedRequest { request_id, rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticApiKeyAuth;
    use crate::session::{PeerMetadata, PeerSession};
    use std::collections::HashSet;

    async fn dispatcher_with_local_peer() -> (Dispatcher, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let registry = Arc::new(LocalClientTable::new());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut keys = HashSet::new();
        keys.insert("k1".to_string());
        registry
            .insert(PeerSession::new(
                "conn1".into(),
                PeerMetadata {
                    client_id: "c1".into(),
                    api_keys: keys,
                    info: Value::Null,
                },
                tx,
            ))
            .await;

        let dispatcher = Dispatcher::new(
            registry,
            Arc::new(GlobalDirectory::disabled()),
            Arc::new(PendingRequestTable::new()),
            None,
            "replica-a".into(),
        );
        (dispatcher, rx)
    }

    #[tokio::test]
    async fn local_hit_sends_envelope_and_registers_waiter() {
        let (dispatcher, mut rx) = dispatcher_with_local_peer().await;
        let auth = StaticApiKeyAuth::permit_all();
        let request = RelayRequest {
            kind: RequestType::Roll,
            api_key: "k1".into(),
            target_client_id: "c1".into(),
            payload: {
                let mut m = Map::new();
                m.insert("formula".into(), Value::String("1d20".into()));
                m
            },
            deadline: Duration::from_secs(1),
            shape_hints: ShapeHints::default(),
        };
        let dispatched = dispatcher.dispatch(&auth, request).await.expect("dispatch ok");
        assert!(dispatched.request_id.starts_with("roll_"));
        let frame = rx.recv().await.expect("frame sent to peer");
        assert!(frame.contains("\"formula\":\"1d20\""));
        assert!(frame.contains("\"type\":\"roll\""));
    }

    #[tokio::test]
    async fn unknown_client_is_not_found() {
        let (dispatcher, _rx) = dispatcher_with_local_peer().await;
        let auth = StaticApiKeyAuth::permit_all();
        let request = RelayRequest {
            kind: RequestType::Rolls,
            api_key: "k1".into(),
            target_client_id: "cZ".into(),
            payload: Map::new(),
            deadline: Duration::from_secs(1),
            shape_hints: ShapeHints::default(),
        };
        let err = dispatcher.dispatch(&auth, request).await.unwrap_err();
        assert!(matches!(err, crate::Error::Relay(ErrorKind::NotFound(_))));
    }
}
