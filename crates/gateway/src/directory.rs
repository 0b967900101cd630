//! The Global Directory: the cross-replica map from client id to owning
//! replica, backed by an external key/value store with TTLs (§4.2, §6).
use std::time::Duration;

use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde_json::{Map, Value};

/// Metadata published alongside a directory record, mirroring the
/// `client:{id}:*` key layout from §6.
#[derive(Debug, Clone, Default)]
pub struct DirectoryMetadata {
    /// Free-form fields (`worldId`, `worldTitle`, `foundryVersion`,
    /// `systemId`, `systemTitle`, `systemVersion`, `customName`,
    /// `lastSeen`, `connectedSince`).
    pub fields: Map<String, Value>,
}

/// Cross-replica client directory, backed by Redis.
///
/// Every directory lookup has its own short deadline (§4.2 specifies
/// 250 ms default) so a slow or unreachable store degrades the
/// Dispatcher to local-only resolution rather than stalling requests.
pub struct GlobalDirectory {
    conn: Option<ConnectionManager>,
    lookup_deadline: Duration,
}

impl GlobalDirectory {
    /// Connect to a directory backend. `url` of `None` disables
    /// cross-replica routing entirely (§4.2): every method then behaves
    /// as though the store were unreachable.
    pub async fn connect(url: Option<&url::Url>, lookup_deadline: Duration) -> crate::Result<Self> {
        let conn = match url {
            Some(url) => {
                let client = Client::open(url.as_str())?;
                Some(ConnectionManager::new(client).await?)
            }
            None => None,
        };
        Ok(Self { conn, lookup_deadline })
    }

    /// A directory with no backing store: every operation reports
    /// "not found" / "unavailable", per §4.2's degraded mode.
    pub fn disabled() -> Self {
        Self {
            conn: None,
            lookup_deadline: Duration::from_millis(250),
        }
    }

    /// Whether this directory is backed by a reachable store, for the
    /// `/api/status` health flag.
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Run one Redis operation under this directory's short deadline
    /// (§4.2: "all GD operations... short deadlines, 250ms default"),
    /// surfacing a timeout as [`relay_protocol::ErrorKind::Timeout`].
    async fn with_deadline<F, T>(&self, fut: F) -> crate::Result<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.lookup_deadline, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(relay_protocol::ErrorKind::Timeout.into()),
        }
    }

    /// Run a deadline-bound operation for a read path, logging and
    /// degrading to `None`/empty rather than propagating the error.
    fn log_and_discard<T>(result: crate::Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(error = %err, "directory operation failed");
                None
            }
        }
    }

    /// Record `client_id` as owned by `replica_id` with the given TTL,
    /// and add it to its API key's client set.
    pub async fn put(
        &self,
        client_id: &str,
        replica_id: &str,
        api_key: &str,
        metadata: &DirectoryMetadata,
        ttl: Duration,
    ) -> crate::Result<()> {
        let Some(conn) = self.conn.clone() else {
            return Ok(());
        };
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let mut conn = conn;
        let _: () = self
            .with_deadline(
                redis::pipe()
                    .atomic()
                    .set_ex(format!("client:{client_id}:instance"), replica_id, ttl_secs as u64)
                    .sadd(format!("apikey:{api_key}:clients"), client_id)
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;
        for (field, value) in metadata.fields.iter() {
            let _: () = self
                .with_deadline(conn.set_ex(
                    format!("client:{client_id}:{field}"),
                    value.to_string(),
                    ttl_secs as u64,
                ))
                .await?;
        }
        Ok(())
    }

    /// Look up which replica owns `client_id`.
    pub async fn get(&self, client_id: &str) -> Option<String> {
        let conn = self.conn.clone()?;
        let mut conn = conn;
        Self::log_and_discard(self.with_deadline(conn.get(format!("client:{client_id}:instance"))).await).flatten()
    }

    /// List the client ids registered under an API key.
    pub async fn list_by_api_key(&self, api_key: &str) -> Vec<String> {
        let Some(conn) = self.conn.clone() else {
            return Vec::new();
        };
        let mut conn = conn;
        Self::log_and_discard(self.with_deadline(conn.smembers(format!("apikey:{api_key}:clients"))).await)
            .unwrap_or_default()
    }

    /// Refresh the TTL on a client's directory entry without changing
    /// its owning replica.
    pub async fn refresh(&self, client_id: &str, ttl: Duration) -> crate::Result<()> {
        let Some(conn) = self.conn.clone() else {
            return Ok(());
        };
        let mut conn = conn;
        let _: bool = self
            .with_deadline(conn.expire(format!("client:{client_id}:instance"), ttl.as_secs().max(1) as i64))
            .await?;
        Ok(())
    }

    /// Delete the directory record for `client_id`, but only if
    /// `replica_id` is still the recorded owner (conditional delete,
    /// §4.2).
    pub async fn delete(&self, client_id: &str, replica_id: &str, api_key: &str) -> crate::Result<()> {
        let Some(conn) = self.conn.clone() else {
            return Ok(());
        };
        let mut conn = conn;
        let key = format!("client:{client_id}:instance");
        let current: Option<String> = self.with_deadline(conn.get(&key)).await?;
        if current.as_deref() == Some(replica_id) {
            let _: () = self.with_deadline(conn.del(&key)).await?;
        }
        let _: () = self
            .with_deadline(conn.srem(format!("apikey:{api_key}:clients"), client_id))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_directory_reports_nothing() {
        let dir = GlobalDirectory::disabled();
        assert!(!dir.is_connected());
        assert_eq!(dir.get("c1").await, None);
        assert!(dir.list_by_api_key("k1").await.is_empty());
        assert!(dir.delete("c1", "r1", "k1").await.is_ok());
    }
}
