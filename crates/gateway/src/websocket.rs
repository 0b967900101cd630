//! The WebSocket session state machine: handshake, keep-alive, message
//! dispatch, and close (§4.1, §6).
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Extension, Query,
    },
    http::StatusCode,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use relay_protocol::InboundMessage;

use crate::{
    auth::{Auth, AuthDecision},
    directory::DirectoryMetadata,
    server::GatewayState,
    session::{OutgoingFrame, PeerMetadata, PeerSession},
};

/// Maximum frame size accepted from a peer (§4.1 default: 250 MiB).
pub const MAX_MESSAGE_BYTES: usize = 250 * 1024 * 1024;

/// Close code: graceful shutdown requested by either side.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code: a send or internal failure tore the socket down.
pub const CLOSE_INTERNAL_ERROR: u16 = 4000;
/// Close code: the handshake omitted the required `id` parameter.
pub const CLOSE_NO_CLIENT_ID: u16 = 4001;
/// Close code: the handshake token failed authentication.
pub const CLOSE_NO_AUTH: u16 = 4002;
/// Close code: reserved for peer-side guild/session binding failures.
pub const CLOSE_NO_CONNECTED_GUILD: u16 = 4003;
/// Close code: a newer session for the same client id displaced this one.
pub const CLOSE_DUPLICATE_CONNECTION: u16 = 4004;
/// Close code: the gateway is shutting down.
pub const CLOSE_SERVER_SHUTDOWN: u16 = 4005;
/// Close code: no traffic in either direction for 3x the ping interval.
pub const CLOSE_DEAD_SOCKET: u16 = 4006;

/// Handshake query parameters from the peer's WebSocket upgrade
/// request (§4.1, `/relay`).
#[derive(Debug, Deserialize)]
pub struct HandshakeQuery {
    /// The peer-chosen client id.
    pub id: Option<String>,
    /// The peer's auth token, checked via the [`Auth`] collaborator.
    pub token: Option<String>,
    /// World id metadata.
    #[serde(default)]
    pub world_id: Option<String>,
    /// World title metadata.
    #[serde(default)]
    pub world_title: Option<String>,
    /// Foundry engine version metadata.
    #[serde(default)]
    pub foundry_version: Option<String>,
    /// System id metadata.
    #[serde(default)]
    pub system_id: Option<String>,
    /// System title metadata.
    #[serde(default)]
    pub system_title: Option<String>,
    /// System version metadata.
    #[serde(default)]
    pub system_version: Option<String>,
    /// Operator-chosen display name override.
    #[serde(default)]
    pub custom_name: Option<String>,
}

fn metadata_value(query: &HandshakeQuery) -> serde_json::Value {
    serde_json::json!({
        "worldId": query.world_id,
        "worldTitle": query.world_title,
        "foundryVersion": query.foundry_version,
        "systemId": query.system_id,
        "systemTitle": query.system_title,
        "systemVersion": query.system_version,
        "customName": query.custom_name,
    })
}

/// Drive the full lifecycle of one accepted peer socket: handshake
/// bookkeeping has already happened by the time this is called; this
/// owns the split read/write tasks until the socket closes.
pub async fn handle_socket(
    socket: WebSocket,
    state: Arc<GatewayState>,
    client_id: String,
    api_key: String,
    connection_id: String,
    handshake: HandshakeQuery,
) {
    let (mut sender, mut receiver) = socket.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<OutgoingFrame>();

    let info = metadata_value(&handshake);

    let metadata = PeerMetadata {
        client_id: client_id.clone(),
        api_keys: [api_key.clone()].into_iter().collect(),
        info: info.clone(),
    };

    if state
        .registry
        .insert(PeerSession::new(connection_id.clone(), metadata, outgoing_tx))
        .await
        .is_some()
    {
        tracing::info!(%client_id, "evicted older session for duplicate handshake");
    }

    let ttl = std::time::Duration::from_secs(state.session.directory_ttl_secs);
    let directory_metadata = DirectoryMetadata {
        fields: info.as_object().cloned().unwrap_or_default(),
    };
    let _ = state
        .directory
        .put(&client_id, &state.instance_id, &api_key, &directory_metadata, ttl)
        .await;

    let writer_state = Arc::clone(&state);
    let writer_client = client_id.clone();
    let write_task = tokio::spawn(async move {
        while let Some(frame) = outgoing_rx.recv().await {
            match frame {
                OutgoingFrame::Close { code, reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                        .await;
                    break;
                }
                OutgoingFrame::Text(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        tracing::warn!(client_id = %writer_client, "write failed, closing socket");
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_INTERNAL_ERROR,
                                reason: "write failure".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        }
        let _ = writer_state;
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if text.len() > MAX_MESSAGE_BYTES {
                    tracing::warn!(client_id = %client_id, "oversized frame refused");
                    continue;
                }
                handle_inbound_text(&state, &client_id, &text).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(client_id = %client_id, error = %err, "socket read error");
                break;
            }
        }
    }

    write_task.abort();
    cleanup(&state, &client_id, &connection_id, &api_key).await;
}

async fn handle_inbound_text(state: &Arc<GatewayState>, client_id: &str, text: &str) {
    let message: InboundMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(err) => {
            tracing::warn!(%client_id, error = %err, "malformed JSON frame dropped");
            return;
        }
    };

    state.registry.touch(client_id).await;

    match message.kind.as_str() {
        "ping" => {
            let _ = state.registry.send_to_client(client_id, r#"{"type":"pong"}"#.to_string()).await;
            let ttl = std::time::Duration::from_secs(state.session.directory_ttl_secs);
            let _ = state.directory.refresh(client_id, ttl).await;
        }
        "pong" => {}
        _ => {
            if let Err(err) = state.router.route(client_id, message).await {
                tracing::error!(%client_id, error = %err, "response router failed");
            }
        }
    }
}

async fn cleanup(state: &Arc<GatewayState>, client_id: &str, connection_id: &str, api_key: &str) {
    if state.registry.remove_if_current(client_id, connection_id).await.is_some() {
        let _ = state.directory.delete(client_id, &state.instance_id, api_key).await;
    }
}

/// Accept the WebSocket upgrade, authenticate the handshake, and either
/// hand the socket to [`handle_socket`] or close it immediately with the
/// appropriate code (§4.1).
pub async fn upgrade(
    Extension(state): Extension<Arc<GatewayState>>,
    Query(query): Query<HandshakeQuery>,
    ws: WebSocketUpgrade,
) -> std::result::Result<Response, StatusCode> {
    match authenticate_handshake(state.auth.as_ref(), &query).await {
        Ok((client_id, api_key)) => {
            let connection_id = uuid::Uuid::new_v4().to_string();
            Ok(ws.on_upgrade(move |socket| {
                handle_socket(socket, state, client_id, api_key, connection_id, query)
            }))
        }
        Err(code) => Ok(ws.on_upgrade(move |socket| close_immediately(socket, code))),
    }
}

async fn close_immediately(mut socket: WebSocket, code: u16) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: "handshake rejected".into(),
        })))
        .await;
}

/// Authenticate a handshake's token and extract the required `id`
/// parameter, returning the close code to use on failure.
pub async fn authenticate_handshake(
    auth: &dyn Auth,
    query: &HandshakeQuery,
) -> Result<(String, String), u16> {
    let client_id = query.id.clone().ok_or(CLOSE_NO_CLIENT_ID)?;
    let token = query.token.clone().ok_or(CLOSE_NO_AUTH)?;
    match auth.authenticate_peer(&token).await {
        AuthDecision::Allowed => Ok((client_id, token)),
        _ => Err(CLOSE_NO_AUTH),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_without_id_is_rejected() {
        let auth = crate::auth::StaticApiKeyAuth::permit_all();
        let query = HandshakeQuery {
            id: None,
            token: Some("tok".into()),
            world_id: None,
            world_title: None,
            foundry_version: None,
            system_id: None,
            system_title: None,
            system_version: None,
            custom_name: None,
        };
        let err = authenticate_handshake(&auth, &query).await.unwrap_err();
        assert_eq!(err, CLOSE_NO_CLIENT_ID);
    }

    #[tokio::test]
    async fn handshake_without_token_is_rejected() {
        let auth = crate::auth::StaticApiKeyAuth::permit_all();
        let query = HandshakeQuery {
            id: Some("c1".into()),
            token: None,
            world_id: None,
            world_title: None,
            foundry_version: None,
            system_id: None,
            system_title: None,
            system_version: None,
            custom_name: None,
        };
        let err = authenticate_handshake(&auth, &query).await.unwrap_err();
        assert_eq!(err, CLOSE_NO_AUTH);
    }

    #[tokio::test]
    async fn valid_handshake_returns_client_id_and_token() {
        let auth = crate::auth::StaticApiKeyAuth::new(["tok".to_string()]);
        let query = HandshakeQuery {
            id: Some("c1".into()),
            token: Some("tok".into()),
            world_id: None,
            world_title: None,
            foundry_version: None,
            system_id: None,
            system_title: None,
            system_version: None,
            custom_name: None,
        };
        let (client_id, token) = authenticate_handshake(&auth, &query).await.unwrap();
        assert_eq!(client_id, "c1");
        assert_eq!(token, "tok");
    }
}
