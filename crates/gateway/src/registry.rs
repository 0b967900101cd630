//! The Local Client Table: this replica's map from client id to the
//! Peer Session that hosts it, plus the API-key index
//! `apiKey -> set<clientId>` (§3, §4.2).
use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::{session::PeerSession, websocket::CLOSE_DUPLICATE_CONNECTION};

#[derive(Default)]
struct Inner {
    by_client: HashMap<String, PeerSession>,
    /// API key -> client ids. Kept a subset of `{c : byClient[c].apiKey
    /// == a}` at all times, per invariant I3.
    by_api_key: HashMap<String, HashSet<String>>,
}

/// Thread-safe table of this replica's connected peers.
///
/// Mirrors the teacher's pattern of hiding a raw map behind a narrow,
/// lock-scoped API rather than exposing the lock to callers.
#[derive(Default)]
pub struct LocalClientTable {
    inner: RwLock<Inner>,
}

impl LocalClientTable {
    /// Construct an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly connected peer under its client id, indexing it
    /// under every API key it advertises. If a session already exists
    /// for this client id it is evicted and signaled to close with
    /// `4004 DuplicateConnection` before the new session is inserted, so
    /// the older session's close is observed strictly before the newer
    /// one becomes routable (§4.1 duplicate policy, §8). The evicted
    /// session is still returned, for the caller's own logging.
    pub async fn insert(&self, session: PeerSession) -> Option<PeerSession> {
        let mut inner = self.inner.write().await;
        let client_id = session.metadata.client_id.clone();
        let previous = inner.by_client.remove(&client_id);
        if let Some(prev) = &previous {
            for key in prev.metadata.api_keys.iter() {
                if let Some(set) = inner.by_api_key.get_mut(key) {
                    set.remove(&client_id);
                }
            }
            let _ = prev.close(CLOSE_DUPLICATE_CONNECTION, "duplicate connection");
        }
        for key in session.metadata.api_keys.iter() {
            inner
                .by_api_key
                .entry(key.clone())
                .or_default()
                .insert(client_id.clone());
        }
        inner.by_client.insert(client_id, session);
        previous
    }

    /// Remove a peer by client id, unwinding its API key index entries.
    pub async fn remove(&self, client_id: &str) -> Option<PeerSession> {
        let mut inner = self.inner.write().await;
        let removed = inner.by_client.remove(client_id)?;
        for key in removed.metadata.api_keys.iter() {
            if let Some(set) = inner.by_api_key.get_mut(key) {
                set.remove(client_id);
            }
        }
        Some(removed)
    }

    /// Remove a peer only if `connection_id` still matches its current
    /// session (guards against a stale disconnect racing a newer
    /// handshake for the same client id).
    pub async fn remove_if_current(&self, client_id: &str, connection_id: &str) -> Option<PeerSession> {
        let mut inner = self.inner.write().await;
        if inner.by_client.get(client_id).map(|s| s.connection_id.as_str()) != Some(connection_id) {
            return None;
        }
        let removed = inner.by_client.remove(client_id)?;
        for key in removed.metadata.api_keys.iter() {
            if let Some(set) = inner.by_api_key.get_mut(key) {
                set.remove(client_id);
            }
        }
        Some(removed)
    }

    /// Whether `client_id` is hosted locally on this replica.
    pub async fn contains(&self, client_id: &str) -> bool {
        self.inner.read().await.by_client.contains_key(client_id)
    }

    /// Client ids visible to an API key, for `GET /clients` and for
    /// authorization checks.
    pub async fn clients_for_key(&self, api_key: &str) -> HashSet<String> {
        self.inner
            .read()
            .await
            .by_api_key
            .get(api_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Send a frame to the peer hosting `client_id`, if connected
    /// locally. Returns `Ok(false)` if no such peer is connected; the
    /// Dispatcher treats that as a miss to resolve via the directory.
    pub async fn send_to_client(&self, client_id: &str, frame: String) -> crate::Result<bool> {
        let inner = self.inner.read().await;
        let Some(session) = inner.by_client.get(client_id) else {
            return Ok(false);
        };
        session.send(frame)?;
        Ok(true)
    }

    /// Record traffic from a connection, resetting its idle clock.
    pub async fn touch(&self, client_id: &str) {
        if let Some(session) = self.inner.write().await.by_client.get_mut(client_id) {
            session.touch();
        }
    }

    /// Snapshot the metadata of every connected peer, for `GET /clients`
    /// and directory refresh sweeps.
    pub async fn snapshot(&self) -> Vec<crate::session::PeerMetadata> {
        self.inner
            .read()
            .await
            .by_client
            .values()
            .map(|s| s.metadata.clone())
            .collect()
    }

    /// Client ids whose sessions have been silent longer than `after`
    /// (input to the Reaper's directory-refresh and liveness sweeps).
    pub async fn dead_clients(&self, after: chrono::Duration) -> Vec<String> {
        self.inner
            .read()
            .await
            .by_client
            .iter()
            .filter(|(_, s)| s.is_dead(after))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of connected peers.
    pub async fn len(&self) -> usize {
        self.inner.read().await.by_client.len()
    }

    /// Whether any peers are connected.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
