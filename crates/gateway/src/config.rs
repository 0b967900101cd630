//! Gateway configuration.
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tokio::fs;
use url::Url;

use crate::{Error, Result};
use relay_protocol::RequestType;

/// Top level gateway configuration, loaded from a TOML file and overridable
/// from the CLI (see §6's Configuration list).
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP/WebSocket listener on.
    pub bind: String,

    /// This replica's identifier, used as the key under which its
    /// forwarding topics are published (`relay/replica/{id}/...`).
    pub instance_id: String,

    /// URL of the directory store (e.g. `redis://127.0.0.1:6379`).
    ///
    /// Absent disables cross-replica routing: directory lookups always
    /// report "not found" and the dispatcher falls back to local-only
    /// resolution (§4.2).
    pub directory_url: Option<Url>,

    /// Settings for waiters, directory leases and the reaper.
    pub session: SessionConfig,

    /// Configuration for TLS encryption.
    pub tls: Option<TlsConfig>,

    /// Configuration for CORS.
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3010".to_string(),
            instance_id: "relay-0".to_string(),
            directory_url: None,
            session: SessionConfig::default(),
            tls: None,
            cors: CorsConfig::default(),
        }
    }
}

/// Certificate and key for TLS.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to the certificate.
    pub cert: PathBuf,
    /// Path to the certificate key file.
    pub key: PathBuf,
}

/// Configuration for CORS.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    /// List of additional CORS origins for the server.
    pub origins: Vec<Url>,
}

/// Settings for session management: waiters, directory leases, keep-alive
/// and the reaper's sweep intervals (§4.3, §4.7).
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SessionConfig {
    /// Default waiter deadline in milliseconds (§4.3).
    pub default_deadline_ms: u64,

    /// Per-request-type deadline overrides, in milliseconds.
    pub deadline_overrides_ms: HashMap<RequestType, u64>,

    /// How often the reaper sweeps the PRT for expired waiters.
    ///
    /// Default is every 10 seconds.
    pub prt_sweep_interval_secs: u64,

    /// How often the reaper sweeps idle ancillary sessions.
    ///
    /// Default is every 60 seconds.
    pub idle_sweep_interval_secs: u64,

    /// Idle timeout for ancillary (non-peer) sessions.
    ///
    /// Default is 10 minutes.
    pub idle_session_timeout_secs: u64,

    /// Directory TTL (T_dir), refreshed on keep-alive.
    ///
    /// Default is 60 seconds.
    pub directory_ttl_secs: u64,

    /// Interval at which the peer is expected to ping (and the relay
    /// expects one, or sends its own liveness check).
    ///
    /// Default is 20 seconds; 3x this with no traffic in either
    /// direction is a dead socket (§4.1).
    pub ping_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: 10_000,
            deadline_overrides_ms: HashMap::new(),
            prt_sweep_interval_secs: 10,
            idle_sweep_interval_secs: 60,
            idle_session_timeout_secs: 600,
            directory_ttl_secs: 60,
            ping_interval_secs: 20,
        }
    }
}

impl SessionConfig {
    /// Resolve the deadline for a request type, honoring per-type overrides.
    pub fn deadline_ms(&self, kind: RequestType) -> u64 {
        self.deadline_overrides_ms
            .get(&kind)
            .copied()
            .unwrap_or(self.default_deadline_ms)
    }

    /// Dead-socket threshold: 3x the configured ping interval (§4.1).
    pub fn dead_socket_after(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ping_interval_secs * 3)
    }
}

impl ServerConfig {
    /// Load a gateway config from a file path.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !fs::try_exists(path.as_ref()).await? {
            return Err(Error::NotFile(path.as_ref().to_path_buf()));
        }

        let contents = fs::read_to_string(path.as_ref()).await?;
        let mut config: ServerConfig = toml::from_str(&contents)?;

        if config.session.idle_sweep_interval_secs >= config.session.idle_session_timeout_secs {
            return Err(Error::SessionTimeoutConfig);
        }

        let dir = Self::directory(path.as_ref())?;
        if let Some(tls) = config.tls.as_mut() {
            if tls.cert.is_relative() {
                tls.cert = dir.join(&tls.cert).canonicalize()?;
            }
            if tls.key.is_relative() {
                tls.key = dir.join(&tls.key).canonicalize()?;
            }
        }

        Ok(config)
    }

    /// Parent directory of the configuration file.
    fn directory(file: impl AsRef<Path>) -> Result<PathBuf> {
        file.as_ref()
            .parent()
            .map(|p| p.to_path_buf())
            .ok_or(Error::NoParentDir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_deadline_applies_without_override() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.deadline_ms(RequestType::Roll), 10_000);
    }

    #[test]
    fn per_type_override_wins() {
        let mut cfg = SessionConfig::default();
        cfg.deadline_overrides_ms.insert(RequestType::DownloadFile, 30_000);
        assert_eq!(cfg.deadline_ms(RequestType::DownloadFile), 30_000);
        assert_eq!(cfg.deadline_ms(RequestType::Roll), 10_000);
    }

    #[test]
    fn dead_socket_after_is_triple_ping_interval() {
        let cfg = SessionConfig {
            ping_interval_secs: 5,
            ..SessionConfig::default()
        };
        assert_eq!(cfg.dead_socket_after(), std::time::Duration::from_secs(15));
    }

    #[tokio::test]
    async fn load_rejects_an_idle_sweep_interval_that_does_not_precede_the_timeout() {
        let path = std::env::temp_dir().join("relay-gateway-test-config-bad.toml");
        fs::write(
            &path,
            r#"
            [session]
            idle-sweep-interval-secs = 600
            idle-session-timeout-secs = 60
            "#,
        )
        .await
        .unwrap();

        let err = ServerConfig::load(&path).await.unwrap_err();
        assert!(matches!(err, Error::SessionTimeoutConfig));
        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn load_accepts_the_default_ordering() {
        let path = std::env::temp_dir().join("relay-gateway-test-config-ok.toml");
        fs::write(&path, "bind = \"0.0.0.0:3010\"\n").await.unwrap();

        let config = ServerConfig::load(&path).await.unwrap();
        assert_eq!(config.bind, "0.0.0.0:3010");
        let _ = fs::remove_file(&path).await;
    }
}
