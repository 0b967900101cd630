//! Peer session state (§4.1, §4.5).
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

/// Per-peer metadata advertised at connect time and kept in the Local
/// Client Table and Global Directory.
#[derive(Debug, Clone)]
pub struct PeerMetadata {
    /// Stable client identifier chosen by the peer (e.g. a Foundry world
    /// id), unique within this gateway's directory.
    pub client_id: String,

    /// API keys this peer is permitted to answer requests for, forming
    /// the closure that §3's invariant I3 requires stay in sync between
    /// the registry and the directory.
    pub api_keys: HashSet<String>,

    /// Free-form descriptive fields the peer sent at connect time
    /// (system version, world title, and the like) that callers of
    /// `GET /clients` are entitled to see.
    pub info: Value,
}

/// A message pushed onto a peer socket's write task: either a text
/// frame to relay verbatim, or an instruction to close the socket with
/// a specific code and then exit (§4.1).
#[derive(Debug)]
pub enum OutgoingFrame {
    /// Forward this text frame to the peer.
    Text(String),
    /// Send a close frame with this code/reason and stop writing.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason string.
        reason: &'static str,
    },
}

/// Live state for one connected peer. Owned by the [`crate::registry::LocalClientTable`].
pub struct PeerSession {
    /// Unique id assigned to this socket at connect time.
    pub connection_id: String,

    /// The peer's advertised metadata.
    pub metadata: PeerMetadata,

    /// Channel used to push outbound frames to the socket's write task.
    pub outgoing: mpsc::UnboundedSender<OutgoingFrame>,

    /// Last time any frame (including a ping) was seen from this peer.
    pub last_seen: DateTime<Utc>,
}

impl PeerSession {
    /// Construct a new session record, stamping `last_seen` to now.
    pub fn new(
        connection_id: String,
        metadata: PeerMetadata,
        outgoing: mpsc::UnboundedSender<OutgoingFrame>,
    ) -> Self {
        Self {
            connection_id,
            metadata,
            outgoing,
            last_seen: Utc::now(),
        }
    }

    /// Record traffic from the peer, resetting the idle clock.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Whether this peer has gone silent for longer than `after`.
    pub fn is_dead(&self, after: chrono::Duration) -> bool {
        Utc::now() - self.last_seen > after
    }

    /// Send a raw text frame to this peer, failing if its socket task has
    /// already exited.
    pub fn send(&self, frame: String) -> crate::Result<()> {
        self.outgoing.send(OutgoingFrame::Text(frame))?;
        Ok(())
    }

    /// Instruct this peer's write task to close the socket with `code`
    /// and stop, failing if the task has already exited.
    pub fn close(&self, code: u16, reason: &'static str) -> crate::Result<()> {
        self.outgoing.send(OutgoingFrame::Close { code, reason })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(client_id: &str) -> PeerMetadata {
        PeerMetadata {
            client_id: client_id.to_string(),
            api_keys: HashSet::new(),
            info: Value::Null,
        }
    }

    #[test]
    fn fresh_session_is_not_dead() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = PeerSession::new("c1".into(), metadata("world-1"), tx);
        assert!(!session.is_dead(chrono::Duration::seconds(60)));
    }

    #[test]
    fn send_fails_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = PeerSession::new("c1".into(), metadata("world-1"), tx);
        drop(rx);
        assert!(session.send("{}".into()).is_err());
    }
}
