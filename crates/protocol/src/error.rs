use thiserror::Error;

/// Error taxonomy for the relay gateway (see §7 of the design).
///
/// Each variant carries the information needed to render the HTTP
/// response body; [`ErrorKind::status`] gives the HTTP status code.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// The API key was not authorized for the target client id.
    #[error("{0}")]
    AuthDenied(String),

    /// The target client id is unknown locally and in the directory,
    /// or the peer reported no such entity.
    #[error("{0}")]
    NotFound(String),

    /// The request shape was invalid, or the peer replied with
    /// `{error: "..."}` on an otherwise valid request type.
    #[error("{0}")]
    BadRequest(String),

    /// The waiter's deadline elapsed before a response arrived.
    #[error("request timed out")]
    Timeout,

    /// The peer socket write failed, the broker publish failed, or the
    /// peer's socket was closed while the waiter was still pending.
    #[error("{0}")]
    UpstreamUnavailable(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl ErrorKind {
    /// Map this error kind to the HTTP status code the edge should return.
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::AuthDenied(_) => 401,
            ErrorKind::NotFound(_) => 404,
            ErrorKind::BadRequest(_) => 400,
            ErrorKind::Timeout => 408,
            ErrorKind::UpstreamUnavailable(_) => 502,
            ErrorKind::Internal(_) => 500,
        }
    }
}

/// Top level error type for the relay crates.
#[derive(Debug, Error)]
pub enum Error {
    /// A classified relay error (see [`ErrorKind`]).
    #[error(transparent)]
    Kind(#[from] ErrorKind),

    /// Error generated by input/output.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Error generated (de)serializing JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Error decoding a base64 data URL.
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
}
