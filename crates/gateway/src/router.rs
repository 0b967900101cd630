//! The Response Router: ingests inbound peer messages, resolves the
//! matching waiter, and applies the two special response transforms
//! (§4.6).
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use relay_protocol::{InboundMessage, ResponseFormat, ShapeHints};
use serde_json::{Map, Value};

use crate::{
    forwarder::{ForwardedResult, Forwarder},
    pending::{PendingRequestTable, Resolution, ResponseSink},
    template::SheetTemplate,
};

/// Routes inbound peer messages to their waiters and applies the
/// `get-sheet-response` / `download-file-result` special handlers.
pub struct ResponseRouter {
    pending: Arc<PendingRequestTable>,
    forwarder: Option<Forwarder>,
    sheet_template: Arc<dyn SheetTemplate>,
}

impl ResponseRouter {
    /// Construct a router wired to this replica's pending table and
    /// (optionally) its forwarder, for publishing results that
    /// originated on another replica.
    pub fn new(
        pending: Arc<PendingRequestTable>,
        forwarder: Option<Forwarder>,
        sheet_template: Arc<dyn SheetTemplate>,
    ) -> Self {
        Self {
            pending,
            forwarder,
            sheet_template,
        }
    }

    /// Handle one inbound message from a peer session. `client_id` is
    /// the peer's own id, stitched into the payload the HTTP caller
    /// eventually sees (§4.6 step 3). The PRT's own bookkeeping decides
    /// whether the matching waiter belongs to this replica's HTTP edge
    /// or must be shipped back across the forwarder (§4.6 step 4).
    pub async fn route(&self, client_id: &str, message: InboundMessage) -> crate::Result<()> {
        let Some(request_id) = message.request_id.clone() else {
            tracing::debug!(%client_id, kind = %message.kind, "unsolicited event message, no requestId");
            return Ok(());
        };

        let hints = self.pending.shape_hints(&request_id).await;
        let sink = self.build_sink(client_id, &message, &hints);

        match self.pending.resolve(&request_id, sink).await {
            Resolution::NotFound => {
                tracing::debug!(%request_id, "no waiter for inbound message, discarding");
            }
            Resolution::DeliveredLocally => {}
            Resolution::Forward { origin_replica, origin_request_id, outcome } => {
                let Some(forwarder) = &self.forwarder else {
                    tracing::warn!(%origin_replica, "forwarder unavailable, cannot publish remote result");
                    return Ok(());
                };
                let (payload, error) = match outcome {
                    ResponseSink::Ok(v) => (v, None),
                    ResponseSink::PeerError(e) => (Value::Null, Some(e)),
                    ResponseSink::Binary { content_type, filename, bytes } => (
                        binary_result_as_json(&content_type, filename.as_deref(), &bytes),
                        None,
                    ),
                };
                let result = ForwardedResult {
                    request_id: origin_request_id,
                    payload,
                    error,
                };
                forwarder.publish_result(&origin_replica, &result).await?;
            }
        }
        Ok(())
    }

    fn build_sink(&self, client_id: &str, message: &InboundMessage, hints: &ShapeHints) -> ResponseSink {
        if let Some(error) = &message.error {
            return ResponseSink::PeerError(error.clone());
        }

        match message.kind.as_str() {
            "get-sheet-response" => self.build_sheet_sink(client_id, message, hints),
            "download-file-result" => build_download_sink(client_id, message, hints),
            _ => ResponseSink::Ok(generic_payload(client_id, message)),
        }
    }

    fn build_sheet_sink(&self, client_id: &str, message: &InboundMessage, hints: &ShapeHints) -> ResponseSink {
        let html = message.extra.get("html").and_then(Value::as_str).unwrap_or("");
        let css = message.extra.get("css").and_then(Value::as_str).unwrap_or("");

        let html = match hints.active_tab.as_deref() {
            Some(tab) => activate_tab(html, tab),
            None => html.to_string(),
        };

        if hints.format == Some(ResponseFormat::Json) {
            let mut body = generic_payload(client_id, message);
            if let Value::Object(map) = &mut body {
                map.insert("html".to_string(), Value::String(html));
                map.insert("css".to_string(), Value::String(css.to_string()));
            }
            ResponseSink::Ok(body)
        } else {
            let document = self.sheet_template.render(&html, css);
            let mut body = generic_payload(client_id, message);
            if let Value::Object(map) = &mut body {
                map.insert("html".to_string(), Value::String(document));
            }
            ResponseSink::Ok(body)
        }
    }
}

fn build_download_sink(client_id: &str, message: &InboundMessage, hints: &ShapeHints) -> ResponseSink {
    let Some(data_url) = message.extra.get("fileData").and_then(Value::as_str) else {
        return ResponseSink::Ok(generic_payload(client_id, message));
    };

    if !matches!(hints.format, Some(ResponseFormat::Binary) | Some(ResponseFormat::Raw)) {
        return ResponseSink::Ok(generic_payload(client_id, message));
    }

    match relay_protocol::decode_data_url(data_url) {
        Ok((content_type, bytes)) => {
            let filename = message
                .extra
                .get("filename")
                .and_then(Value::as_str)
                .map(str::to_string);
            let content_type = message
                .extra
                .get("mimeType")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(content_type);
            ResponseSink::Binary { content_type, filename, bytes }
        }
        Err(_) => ResponseSink::Ok(generic_payload(client_id, message)),
    }
}

fn binary_result_as_json(content_type: &str, filename: Option<&str>, bytes: &[u8]) -> Value {
    let mut map = Map::new();
    map.insert("contentType".to_string(), Value::String(content_type.to_string()));
    if let Some(name) = filename {
        map.insert("filename".to_string(), Value::String(name.to_string()));
    }
    map.insert(
        "fileData".to_string(),
        Value::String(format!("data:{content_type};base64,{}", base64_encode(bytes))),
    );
    Value::Object(map)
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// `{requestId, clientId, ...m minus requestId}` per §4.6 step 3.
fn generic_payload(client_id: &str, message: &InboundMessage) -> Value {
    let mut body = message.payload_without_request_id();
    if let Value::Object(map) = &mut body {
        map.remove("requestId");
        map.insert("clientId".to_string(), Value::String(client_id.to_string()));
    }
    body
}

static TAB_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r#"<[^>]*\bdata-tab="([^"]*)"[^>]*>"#).unwrap());
static CLASS_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"class="([^"]*)""#).unwrap());

/// Best-effort tab activation: toggle an `active` class onto the
/// element whose `data-tab` attribute matches `tab`, and off every
/// sibling. On any parse oddity, falls back to the unmodified HTML
/// (§4.6: "the transform is best-effort").
fn activate_tab(html: &str, tab: &str) -> String {
    TAB_TAG
        .replace_all(html, |caps: &regex::Captures| {
            let whole = &caps[0];
            let this_tab = &caps[1];
            toggle_active_class(whole, this_tab == tab)
        })
        .into_owned()
}

fn toggle_active_class(tag: &str, make_active: bool) -> String {
    if let Some(caps) = CLASS_ATTR.captures(tag) {
        let classes = &caps[1];
        let mut kept: Vec<String> = classes
            .split_whitespace()
            .filter(|c| *c != "active")
            .map(str::to_string)
            .collect();
        if make_active {
            kept.push("active".to_string());
        }
        CLASS_ATTR
            .replace(tag, format!("class=\"{}\"", kept.join(" ")).as_str())
            .into_owned()
    } else if make_active {
        tag.replacen('>', " class=\"active\">", 1)
    } else {
        tag.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::StaticSheetTemplate;

    fn inbound(kind: &str, request_id: &str, extra: Map<String, Value>) -> InboundMessage {
        InboundMessage {
            kind: kind.to_string(),
            request_id: Some(request_id.to_string()),
            error: None,
            extra,
        }
    }

    #[tokio::test]
    async fn generic_message_resolves_local_waiter_with_client_id_stitched_in() {
        let pending = Arc::new(PendingRequestTable::new());
        let id = PendingRequestTable::new_request_id(relay_protocol::RequestType::Roll);
        let rx = pending
            .register(id.clone(), std::time::Duration::from_secs(1), ShapeHints::default())
            .await;
        let router = ResponseRouter::new(pending, None, Arc::new(StaticSheetTemplate));

        let mut extra = Map::new();
        extra.insert("result".to_string(), Value::from(17));
        let msg = inbound("roll-result", &id, extra);
        router.route("c1", msg).await.unwrap();

        match rx.await.unwrap() {
            ResponseSink::Ok(Value::Object(map)) => {
                assert_eq!(map["clientId"], "c1");
                assert_eq!(map["result"], 17);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_error_resolves_as_peer_error() {
        let pending = Arc::new(PendingRequestTable::new());
        let id = PendingRequestTable::new_request_id(relay_protocol::RequestType::Delete);
        let rx = pending
            .register(id.clone(), std::time::Duration::from_secs(1), ShapeHints::default())
            .await;
        let router = ResponseRouter::new(pending, None, Arc::new(StaticSheetTemplate));

        let msg = InboundMessage {
            kind: "delete-result".to_string(),
            request_id: Some(id.clone()),
            error: Some("not found".to_string()),
            extra: Map::new(),
        };
        router.route("c1", msg).await.unwrap();
        assert!(matches!(rx.await.unwrap(), ResponseSink::PeerError(e) if e == "not found"));
    }

    #[tokio::test]
    async fn message_with_no_request_id_is_discarded_silently() {
        let pending = Arc::new(PendingRequestTable::new());
        let router = ResponseRouter::new(pending.clone(), None, Arc::new(StaticSheetTemplate));
        let msg = InboundMessage {
            kind: "chat".to_string(),
            request_id: None,
            error: None,
            extra: Map::new(),
        };
        router.route("c1", msg).await.unwrap();
        assert_eq!(pending.len().await, 0);
    }

    #[tokio::test]
    async fn sheet_response_honors_the_callers_shape_hints_not_the_peers_message() {
        let pending = Arc::new(PendingRequestTable::new());
        let id = PendingRequestTable::new_request_id(relay_protocol::RequestType::GetSheet);
        let hints = ShapeHints {
            format: Some(ResponseFormat::Json),
            active_tab: Some("b".to_string()),
        };
        let rx = pending
            .register(id.clone(), std::time::Duration::from_secs(1), hints)
            .await;
        let router = ResponseRouter::new(pending, None, Arc::new(StaticSheetTemplate));

        let mut extra = Map::new();
        extra.insert(
            "html".to_string(),
            Value::String(r#"<div class="tab" data-tab="a">A</div><div class="tab" data-tab="b">B</div>"#.to_string()),
        );
        extra.insert("css".to_string(), Value::String("body{}".to_string()));
        let msg = inbound("get-sheet-response", &id, extra);
        router.route("c1", msg).await.unwrap();

        match rx.await.unwrap() {
            ResponseSink::Ok(Value::Object(map)) => {
                assert_eq!(map["css"], "body{}");
                let html = map["html"].as_str().unwrap();
                assert!(html.contains(r#"data-tab="b""#));
                assert!(html.contains("active"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn download_result_decodes_to_bytes_when_the_caller_asked_for_binary() {
        let pending = Arc::new(PendingRequestTable::new());
        let id = PendingRequestTable::new_request_id(relay_protocol::RequestType::DownloadFile);
        let hints = ShapeHints {
            format: Some(ResponseFormat::Binary),
            active_tab: None,
        };
        let rx = pending
            .register(id.clone(), std::time::Duration::from_secs(1), hints)
            .await;
        let router = ResponseRouter::new(pending, None, Arc::new(StaticSheetTemplate));

        let mut extra = Map::new();
        extra.insert(
            "fileData".to_string(),
            Value::String("data:application/octet-stream;base64,aGk=".to_string()),
        );
        extra.insert("filename".to_string(), Value::String("x.bin".to_string()));
        extra.insert("mimeType".to_string(), Value::String("application/octet-stream".to_string()));
        let msg = inbound("download-file-result", &id, extra);
        router.route("c1", msg).await.unwrap();

        match rx.await.unwrap() {
            ResponseSink::Binary { content_type, filename, bytes } => {
                assert_eq!(content_type, "application/octet-stream");
                assert_eq!(filename.as_deref(), Some("x.bin"));
                assert_eq!(bytes, b"hi");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn download_result_falls_back_to_json_without_a_binary_hint() {
        let pending = Arc::new(PendingRequestTable::new());
        let id = PendingRequestTable::new_request_id(relay_protocol::RequestType::DownloadFile);
        let rx = pending
            .register(id.clone(), std::time::Duration::from_secs(1), ShapeHints::default())
            .await;
        let router = ResponseRouter::new(pending, None, Arc::new(StaticSheetTemplate));

        let mut extra = Map::new();
        extra.insert(
            "fileData".to_string(),
            Value::String("data:application/octet-stream;base64,aGk=".to_string()),
        );
        let msg = inbound("download-file-result", &id, extra);
        router.route("c1", msg).await.unwrap();

        assert!(matches!(rx.await.unwrap(), ResponseSink::Ok(Value::Object(_))));
    }

    #[test]
    fn activate_tab_moves_active_class_to_the_matching_element() {
        let html = r#"<div class="tab" data-tab="a">A</div><div class="tab active" data-tab="b">B</div>"#;
        let out = activate_tab(html, "a");
        assert!(out.contains(r#"data-tab="a""#));
        assert!(out.contains("class=\"tab active\" data-tab=\"a\"") || out.contains("class=\"tab active\"  data-tab=\"a\""));
        assert!(!out.contains(r#"class="tab active" data-tab="b""#));
    }

    #[test]
    fn activate_tab_falls_back_when_no_tabs_present() {
        let html = "<div>no tabs here</div>";
        assert_eq!(activate_tab(html, "a"), html);
    }

    #[test]
    fn download_result_as_json_round_trips_the_data_url() {
        let json = binary_result_as_json("image/png", Some("x.png"), b"hi");
        assert_eq!(json["contentType"], "image/png");
        assert_eq!(json["filename"], "x.png");
        assert!(json["fileData"].as_str().unwrap().starts_with("data:image/png;base64,"));
    }
}
