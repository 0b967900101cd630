//! The HTTP edge: one endpoint per request type, `GET /clients` and
//! `GET /api/status` (§6). This module is the "thin edge" the core spec
//! treats as out of scope for its own logic — its only job is to build
//! a [`RelayRequest`] and hand it to the [`crate::dispatcher::Dispatcher`].
use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{Extension, Path, Query},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{Map, Value};

use relay_protocol::{ErrorKind, RequestType, ResponseFormat, ShapeHints};

use crate::{
    dispatcher::RelayRequest,
    pending::ResponseSink,
    server::GatewayState,
    Error,
};

const API_KEY_HEADER: &str = "x-api-key";
const CLIENT_ID_PARAM: &str = "clientId";
const DEADLINE_PARAM: &str = "deadline";
const FORMAT_PARAM: &str = "format";
const ACTIVE_TAB_PARAM: &str = "activeTab";

/// The gateway's HTTP surface, merged onto the WebSocket router in
/// [`crate::server::RelayServer`].
pub fn routes() -> Router {
    Router::new()
        .route("/clients", get(list_clients))
        .route("/api/status", get(status))
        .route("/:request_type", get(handle_request).post(handle_request))
}

fn api_key(headers: &HeaderMap) -> crate::Result<String> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ErrorKind::AuthDenied("missing x-api-key header".to_string()).into())
}

async fn handle_request(
    Path(request_type): Path<String>,
    Extension(state): Extension<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let Some(kind) = RequestType::parse(&request_type) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("unknown request type: {request_type}")})),
        )
            .into_response();
    };

    let key = match api_key(&headers) {
        Ok(key) => key,
        Err(err) => return error_response(err),
    };

    let mut payload: Map<String, Value> = if body.is_empty() {
        Map::new()
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => Map::new(),
        }
    };

    let client_id = match payload.get(CLIENT_ID_PARAM).and_then(Value::as_str).map(str::to_string) {
        Some(id) => id,
        None => match query.get(CLIENT_ID_PARAM) {
            Some(id) => id.clone(),
            None => {
                return error_response(ErrorKind::BadRequest("missing clientId".to_string()).into());
            }
        },
    };
    payload.remove(CLIENT_ID_PARAM);

    let shape_hints = ShapeHints {
        format: query.get(FORMAT_PARAM).and_then(|s| parse_format(s)),
        active_tab: query.get(ACTIVE_TAB_PARAM).cloned(),
    };

    for (k, v) in &query {
        if k == CLIENT_ID_PARAM || k == DEADLINE_PARAM || k == FORMAT_PARAM || k == ACTIVE_TAB_PARAM {
            continue;
        }
        payload.entry(k.clone()).or_insert_with(|| Value::String(v.clone()));
    }

    let deadline = query
        .get(DEADLINE_PARAM)
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(state.session.deadline_ms(kind)));

    let request = RelayRequest {
        kind,
        api_key: key,
        target_client_id: client_id.clone(),
        payload,
        deadline,
        shape_hints,
    };

    let dispatched = match state.dispatcher.dispatch(state.auth.as_ref(), request).await {
        Ok(d) => d,
        Err(err) => return error_response(err),
    };

    match tokio::time::timeout(deadline, dispatched.rx).await {
        Ok(Ok(outcome)) => outcome_response(dispatched.request_id, client_id, outcome),
        Ok(Err(_)) => error_response(ErrorKind::Internal("waiter dropped without a response".to_string()).into()),
        Err(_) => {
            state.pending.cancel(&dispatched.request_id).await;
            error_response(ErrorKind::Timeout.into())
        }
    }
}

fn parse_format(s: &str) -> Option<ResponseFormat> {
    match s {
        "json" => Some(ResponseFormat::Json),
        "binary" => Some(ResponseFormat::Binary),
        "raw" => Some(ResponseFormat::Raw),
        _ => None,
    }
}

fn outcome_response(request_id: String, client_id: String, outcome: ResponseSink) -> Response {
    match outcome {
        ResponseSink::Ok(payload) => {
            let mut body = match payload {
                Value::Object(map) => map,
                other => {
                    let mut map = Map::new();
                    map.insert("payload".to_string(), other);
                    map
                }
            };
            body.insert("requestId".to_string(), Value::String(request_id));
            body.entry("clientId".to_string()).or_insert(Value::String(client_id));
            let mut value = Value::Object(body);
            relay_protocol::strip_sensitive(&mut value);
            (StatusCode::OK, Json(value)).into_response()
        }
        ResponseSink::PeerError(message) => {
            let mut value = serde_json::json!({
                "requestId": request_id,
                "clientId": client_id,
                "error": message,
            });
            relay_protocol::strip_sensitive(&mut value);
            (StatusCode::BAD_REQUEST, Json(value)).into_response()
        }
        ResponseSink::Binary { content_type, filename, bytes } => {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_str(&content_type).unwrap_or(HeaderValue::from_static("application/octet-stream")),
            );
            if let Some(name) = filename {
                if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{name}\"")) {
                    headers.insert(header::CONTENT_DISPOSITION, value);
                }
            }
            (StatusCode::OK, headers, bytes).into_response()
        }
    }
}

fn error_response(err: Error) -> Response {
    let (status, message) = match &err {
        Error::Relay(kind) => (kind.status(), kind.to_string()),
        other => (500, other.to_string()),
    };
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(serde_json::json!({"error": message}))).into_response()
}

async fn list_clients(Extension(state): Extension<Arc<GatewayState>>, headers: HeaderMap) -> Response {
    let key = match api_key(&headers) {
        Ok(key) => key,
        Err(err) => return error_response(err),
    };

    let clients = if state.directory.is_connected() {
        state.directory.list_by_api_key(&key).await
    } else {
        state.registry.clients_for_key(&key).await.into_iter().collect()
    };

    (StatusCode::OK, Json(serde_json::json!({ "clients": clients }))).into_response()
}

async fn status(Extension(state): Extension<Arc<GatewayState>>) -> Response {
    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "websocket": {
            "peers": state.registry.len().await,
            "directoryConnected": state.directory.is_connected(),
        },
    });
    (StatusCode::OK, Json(body)).into_response()
}
