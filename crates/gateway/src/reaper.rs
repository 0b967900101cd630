//! The Reaper: four periodic sweeps over the PRT, the registry and the
//! directory (§4.1, §4.7).
use std::{sync::Arc, time::Duration};

use tokio::time::interval;

use crate::{
    config::SessionConfig,
    directory::GlobalDirectory,
    forwarder::{ForwardedResult, Forwarder},
    pending::{PendingRequestTable, Resolution},
    registry::LocalClientTable,
    websocket::CLOSE_DEAD_SOCKET,
};

/// Spawns the three independent sweep loops and returns their join
/// handles so the caller can await them (or let them run detached for
/// the lifetime of the process, as the teacher's `session_reaper` does).
pub struct Reaper {
    config: Arc<SessionConfig>,
    pending: Arc<PendingRequestTable>,
    registry: Arc<LocalClientTable>,
    directory: Arc<GlobalDirectory>,
    forwarder: Option<Forwarder>,
    instance_id: String,
}

impl Reaper {
    /// Construct a reaper over the shared core state.
    pub fn new(
        config: Arc<SessionConfig>,
        pending: Arc<PendingRequestTable>,
        registry: Arc<LocalClientTable>,
        directory: Arc<GlobalDirectory>,
        forwarder: Option<Forwarder>,
        instance_id: String,
    ) -> Self {
        Self {
            config,
            pending,
            registry,
            directory,
            forwarder,
            instance_id,
        }
    }

    /// Spawn all four sweeps as detached background tasks.
    pub fn spawn(self: Arc<Self>) {
        let prt_self = Arc::clone(&self);
        tokio::spawn(async move { prt_self.run_prt_sweep().await });

        let keepalive_self = Arc::clone(&self);
        tokio::spawn(async move { keepalive_self.run_keepalive_sweep().await });

        let idle_self = Arc::clone(&self);
        tokio::spawn(async move { idle_self.run_idle_sweep().await });

        let refresh_self = Arc::clone(&self);
        tokio::spawn(async move { refresh_self.run_directory_refresh().await });
    }

    async fn run_prt_sweep(&self) {
        let mut ticker = interval(Duration::from_secs(self.config.prt_sweep_interval_secs));
        loop {
            ticker.tick().await;
            let reaped = self.pending.reap_expired().await;
            if reaped.is_empty() {
                continue;
            }
            tracing::debug!(reaped = reaped.len(), "swept expired waiters");
            for resolution in reaped {
                if let Resolution::Forward { origin_replica, origin_request_id, outcome } = resolution {
                    self.publish_timeout(origin_replica, origin_request_id, outcome).await;
                }
            }
        }
    }

    async fn publish_timeout(
        &self,
        origin_replica: String,
        origin_request_id: String,
        outcome: crate::pending::ResponseSink,
    ) {
        let Some(forwarder) = &self.forwarder else { return };
        let (payload, error) = match outcome {
            crate::pending::ResponseSink::Ok(v) => (v, None),
            crate::pending::ResponseSink::PeerError(e) => (serde_json::Value::Null, Some(e)),
            crate::pending::ResponseSink::Binary { .. } => (serde_json::Value::Null, Some("binary timeout".to_string())),
        };
        let result = ForwardedResult {
            request_id: origin_request_id,
            payload,
            error,
        };
        if let Err(err) = forwarder.publish_result(&origin_replica, &result).await {
            tracing::warn!(%origin_replica, error = %err, "failed to publish forwarded timeout");
        }
    }

    /// Close peer sockets silent for 3x the ping interval (§4.1's MUST).
    /// Runs on the ping interval itself, distinct from
    /// [`Self::run_idle_sweep`]'s much longer ancillary-session timeout
    /// (§4.7) — the two sweep different notions of "stale" even though
    /// both read the same session's `lastSeen`.
    async fn run_keepalive_sweep(&self) {
        let mut ticker = interval(Duration::from_secs(self.config.ping_interval_secs.max(1)));
        let dead_after =
            chrono::Duration::from_std(self.config.dead_socket_after()).unwrap_or(chrono::Duration::zero());
        loop {
            ticker.tick().await;
            let dead = self.registry.dead_clients(dead_after).await;
            for client_id in dead {
                tracing::info!(%client_id, "closing dead socket, missed keep-alive");
                if let Some(session) = self.registry.remove(&client_id).await {
                    let _ = session.close(CLOSE_DEAD_SOCKET, "missed keep-alive");
                    let _ = self.directory.delete(&client_id, &self.instance_id, "").await;
                }
            }
        }
    }

    async fn run_idle_sweep(&self) {
        let mut ticker = interval(Duration::from_secs(self.config.idle_sweep_interval_secs));
        let idle_after = chrono::Duration::from_std(Duration::from_secs(self.config.idle_session_timeout_secs))
            .unwrap_or(chrono::Duration::zero());
        loop {
            ticker.tick().await;
            let dead = self.registry.dead_clients(idle_after).await;
            for client_id in dead {
                tracing::info!(%client_id, "closing idle session");
                if let Some(session) = self.registry.remove(&client_id).await {
                    let _ = session.close(CLOSE_DEAD_SOCKET, "idle timeout");
                    let _ = self
                        .directory
                        .delete(&client_id, &self.instance_id, "")
                        .await;
                }
            }
        }
    }

    async fn run_directory_refresh(&self) {
        let ttl = Duration::from_secs(self.config.directory_ttl_secs);
        let half = ttl / 2;
        let mut ticker = interval(half.max(Duration::from_millis(1)));
        loop {
            ticker.tick().await;
            for peer in self.registry.snapshot().await {
                if let Err(err) = self.directory.refresh(&peer.client_id, ttl).await {
                    tracing::warn!(client_id = %peer.client_id, error = %err, "directory refresh failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prt_sweep_reaps_expired_waiters() {
        let pending = Arc::new(PendingRequestTable::new());
        let id = PendingRequestTable::new_request_id(relay_protocol::RequestType::Roll);
        let _rx = pending
            .register(id.clone(), Duration::from_millis(0), relay_protocol::ShapeHints::default())
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(pending.reap_expired().await.len(), 1);
    }

    #[tokio::test]
    async fn dead_clients_by_keepalive_threshold_differs_from_idle_threshold() {
        use crate::session::{PeerMetadata, PeerSession};

        let registry = LocalClientTable::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut session = PeerSession::new(
            "conn1".into(),
            PeerMetadata {
                client_id: "c1".into(),
                api_keys: Default::default(),
                info: serde_json::Value::Null,
            },
            tx,
        );
        // Silent for 2 minutes: past 3x a 20s ping interval, nowhere
        // near the 10-minute ancillary-session idle default.
        session.last_seen = chrono::Utc::now() - chrono::Duration::seconds(120);
        registry.insert(session).await;

        let config = SessionConfig::default();
        let keepalive_after = chrono::Duration::from_std(config.dead_socket_after()).unwrap();
        let idle_after = chrono::Duration::seconds(config.idle_session_timeout_secs as i64);

        assert_eq!(registry.dead_clients(keepalive_after).await, vec!["c1".to_string()]);
        assert!(registry.dead_clients(idle_after).await.is_empty());
    }

    #[tokio::test]
    async fn keepalive_sweep_sends_a_dead_socket_close_before_removing_from_directory() {
        use crate::session::{OutgoingFrame, PeerMetadata, PeerSession};

        let registry = LocalClientTable::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let session = PeerSession::new(
            "conn1".into(),
            PeerMetadata {
                client_id: "c1".into(),
                api_keys: Default::default(),
                info: serde_json::Value::Null,
            },
            tx,
        );
        registry.insert(session).await;

        let removed = registry.remove("c1").await.expect("session present");
        let _ = removed.close(CLOSE_DEAD_SOCKET, "missed keep-alive");

        assert!(matches!(
            rx.try_recv().unwrap(),
            OutgoingFrame::Close { code: CLOSE_DEAD_SOCKET, .. }
        ));
    }
}
