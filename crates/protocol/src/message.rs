use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-type formatting hints the relay carries through opaquely from the
/// HTTP edge to the Response Router.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShapeHints {
    /// Desired response shape for this request, e.g. `"json"`, `"binary"`,
    /// `"raw"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<ResponseFormat>,

    /// For `get-sheet`, the tab index to activate in the rendered HTML.
    #[serde(skip_serializing_if = "Option::is_none", rename = "activeTab")]
    pub active_tab: Option<String>,
}

/// Desired response encoding for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// Return the JSON payload verbatim.
    Json,
    /// Decode embedded binary content and write raw bytes.
    Binary,
    /// Synonym for `Binary` used by some request types.
    Raw,
}

/// The envelope sent from the gateway to a peer for an outbound request.
///
/// `extra` holds the caller's payload, merged in opaquely: the relay never
/// inspects its shape beyond what is explicitly modeled here.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEnvelope {
    /// Request type tag, e.g. `"roll"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlation id the peer must echo back.
    #[serde(rename = "requestId")]
    pub request_id: String,
    /// Opaque request payload, flattened into the envelope.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A parsed inbound message received from a peer socket.
///
/// Only `type`, `requestId` and `error` are interpreted by the relay;
/// everything else is preserved in `extra` and passed through opaquely.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    /// Message type tag, e.g. `"ping"`, `"roll-result"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlation id, present on request-initiated replies.
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
    /// Error string set by the peer when the request failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Everything else in the message, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundMessage {
    /// Reconstruct the full JSON object for this message, including the
    /// interpreted fields, minus `requestId` (the edge re-adds its own).
    pub fn payload_without_request_id(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("type".to_string(), Value::String(self.kind.clone()));
        if let Some(err) = &self.error {
            map.insert("error".to_string(), Value::String(err.clone()));
        }
        Value::Object(map)
    }
}

/// Decode a `data:` URL of the form `data:{mime};base64,{payload}` into
/// its MIME type and raw bytes, per §4.6's `download-file-result`
/// handler.
pub fn decode_data_url(data_url: &str) -> crate::Result<(String, Vec<u8>)> {
    use base64::Engine;

    let rest = data_url
        .strip_prefix("data:")
        .ok_or_else(|| crate::ErrorKind::BadRequest("not a data URL".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| crate::ErrorKind::BadRequest("malformed data URL".to_string()))?;
    let mime = header.strip_suffix(";base64").unwrap_or(header).to_string();
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload)?;
    Ok((mime, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_message_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "type": "roll-result",
            "requestId": "roll_1",
            "result": 17,
        });
        let msg: InboundMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.kind, "roll-result");
        assert_eq!(msg.request_id.as_deref(), Some("roll_1"));
        assert_eq!(msg.extra.get("result"), Some(&Value::from(17)));
    }

    #[test]
    fn outbound_envelope_flattens_payload() {
        let mut extra = Map::new();
        extra.insert("formula".to_string(), Value::from("1d20"));
        let env = OutboundEnvelope {
            kind: "roll".to_string(),
            request_id: "roll_1".to_string(),
            extra,
        };
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "roll");
        assert_eq!(v["requestId"], "roll_1");
        assert_eq!(v["formula"], "1d20");
    }

    #[test]
    fn decode_data_url_splits_mime_and_bytes() {
        let (mime, bytes) = decode_data_url("data:image/png;base64,aGk=").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, b"hi");
    }

    #[test]
    fn decode_data_url_rejects_non_data_urls() {
        assert!(decode_data_url("https://example.com/x.png").is_err());
    }
}
