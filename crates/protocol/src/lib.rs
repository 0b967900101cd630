//! Wire types, request taxonomy and error kinds shared between the relay
//! gateway core and its HTTP/WebSocket edges.

#![deny(missing_docs)]

mod error;
mod message;
mod request_type;
mod sanitize;

pub use error::{Error, ErrorKind};
pub use message::{decode_data_url, InboundMessage, OutboundEnvelope, ResponseFormat, ShapeHints};
pub use request_type::RequestType;
pub use sanitize::strip_sensitive;

pub use serde_json;

/// Result type used across the relay crates.
pub type Result<T> = std::result::Result<T, Error>;
