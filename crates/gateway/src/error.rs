use thiserror::Error;

/// Errors generated by the gateway core.
#[derive(Debug, Error)]
pub enum Error {
    /// A classified relay error (auth/not-found/timeout/etc, see §7).
    #[error(transparent)]
    Relay(#[from] relay_protocol::ErrorKind),

    /// Error generated by the protocol crate's own fallible helpers.
    #[error(transparent)]
    Protocol(#[from] relay_protocol::Error),

    /// Error generated by input/output.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Error generated (de)serializing JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Error generated parsing the TOML config file.
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    /// Error generated by the directory store.
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    /// Error generated by the HTTP/TLS server.
    #[error(transparent)]
    Axum(#[from] axum::Error),

    /// Error generated sending an outbound frame to a closed socket task.
    #[error("peer socket channel closed")]
    ChannelClosed,

    /// The config file does not exist.
    #[error("configuration file not found: {0}")]
    NotFile(std::path::PathBuf),

    /// The config file has no parent directory to resolve relative paths
    /// against.
    #[error("could not determine configuration directory")]
    NoParentDir,

    /// `session.idle-sweep-interval-secs` must be less than
    /// `session.idle-session-timeout-secs`, or the sweep would check for
    /// idle sessions less often than the timeout it's enforcing.
    #[error("idle sweep interval must be less than the idle session timeout")]
    SessionTimeoutConfig,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}
