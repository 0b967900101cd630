//! Wires the gateway's collaborators behind an axum HTTP/WebSocket
//! listener and spawns the inter-replica forwarder pumps (§4.5, §6).
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    http::{HeaderValue, Method},
    routing::get,
    Extension, Router,
};
use axum_server::{tls_rustls::RustlsConfig, Handle};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use relay_protocol::RequestType;

use crate::{
    auth::Auth,
    config::{ServerConfig, SessionConfig, TlsConfig},
    directory::GlobalDirectory,
    dispatcher::Dispatcher,
    forwarder::{self, ForwardedRequest, ForwardedResult, Forwarder},
    pending::{PendingRequestTable, ResponseSink},
    reaper::Reaper,
    registry::LocalClientTable,
    router::ResponseRouter,
    template::SheetTemplate,
    Error, Result,
};

/// Shared state handed to every axum handler via an [`Extension`].
pub struct GatewayState {
    /// This replica's connected peers.
    pub registry: Arc<LocalClientTable>,
    /// The cross-replica client directory.
    pub directory: Arc<GlobalDirectory>,
    /// Outstanding requests awaiting a peer's response.
    pub pending: Arc<PendingRequestTable>,
    /// Resolves outbound HTTP requests to a local peer or a remote replica.
    pub dispatcher: Dispatcher,
    /// Resolves inbound peer messages back to their waiters.
    pub router: ResponseRouter,
    /// Authentication/authorization collaborator.
    pub auth: Arc<dyn Auth>,
    /// Session, deadline and sweep configuration.
    pub session: Arc<SessionConfig>,
    /// This replica's own identifier.
    pub instance_id: String,
}

/// The gateway's HTTP/WebSocket server.
pub struct RelayServer {
    state: Arc<GatewayState>,
    bind: String,
    tls: Option<TlsConfig>,
    cors_origins: Vec<url::Url>,
}

impl RelayServer {
    /// Build the gateway's core state from configuration, connecting to
    /// the directory store and (when configured) the inter-replica
    /// forwarder, and spawning the reaper's sweeps.
    pub async fn new(
        config: ServerConfig,
        auth: Arc<dyn Auth>,
        sheet_template: Arc<dyn SheetTemplate>,
    ) -> Result<Self> {
        let session = Arc::new(config.session);
        let directory = Arc::new(
            GlobalDirectory::connect(config.directory_url.as_ref(), Duration::from_millis(250)).await?,
        );
        let registry = Arc::new(LocalClientTable::new());
        let pending = Arc::new(PendingRequestTable::new());

        let forwarder = match &config.directory_url {
            Some(url) => {
                let client = redis::Client::open(url.as_str())?;
                let conn = redis::aio::ConnectionManager::new(client).await?;
                Some(Forwarder::new(conn))
            }
            None => None,
        };

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&pending),
            forwarder.clone(),
            config.instance_id.clone(),
        );
        let router = ResponseRouter::new(Arc::clone(&pending), forwarder.clone(), sheet_template);

        let state = Arc::new(GatewayState {
            registry: Arc::clone(&registry),
            directory: Arc::clone(&directory),
            pending: Arc::clone(&pending),
            dispatcher,
            router,
            auth,
            session: Arc::clone(&session),
            instance_id: config.instance_id.clone(),
        });

        if let Some(url) = &config.directory_url {
            let pubsub_client = redis::Client::open(url.as_str())?;
            spawn_forwarder_pumps(Arc::clone(&state), pubsub_client, Arc::clone(&session)).await?;
        }

        let reaper = Arc::new(Reaper::new(
            session,
            pending,
            registry,
            directory,
            forwarder,
            config.instance_id,
        ));
        reaper.spawn();

        Ok(Self {
            state,
            bind: config.bind,
            tls: config.tls,
            cors_origins: config.cors.origins,
        })
    }

    /// Start serving, choosing TLS or plaintext based on configuration.
    pub async fn start(&self, handle: Handle) -> Result<()> {
        let addr: SocketAddr = self.bind.parse().map_err(|_| {
            Error::Relay(relay_protocol::ErrorKind::Internal(format!(
                "invalid bind address: {}",
                self.bind
            )))
        })?;

        if let Some(tls) = self.tls.clone() {
            self.run_tls(addr, handle, tls).await
        } else {
            self.run(addr, handle).await
        }
    }

    async fn run_tls(&self, addr: SocketAddr, handle: Handle, tls: TlsConfig) -> Result<()> {
        let tls_config = RustlsConfig::from_pem_file(&tls.cert, &tls.key).await?;
        let app = self.router()?;
        tracing::info!(%addr, instance_id = %self.state.instance_id, "listening (tls)");
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
        Ok(())
    }

    async fn run(&self, addr: SocketAddr, handle: Handle) -> Result<()> {
        let app = self.router()?;
        tracing::info!(%addr, instance_id = %self.state.instance_id, "listening");
        axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
        Ok(())
    }

    fn router(&self) -> Result<Router> {
        let mut origins = Vec::with_capacity(self.cors_origins.len());
        for url in &self.cors_origins {
            origins.push(
                HeaderValue::from_str(url.as_str().trim_end_matches('/'))
                    .map_err(|_| Error::Relay(relay_protocol::ErrorKind::Internal("invalid cors origin".into())))?,
            );
        }
        let cors = CorsLayer::new()
            .allow_methods(vec![Method::GET, Method::POST, Method::DELETE])
            .allow_headers(vec![axum::http::header::CONTENT_TYPE, axum::http::HeaderName::from_static("x-api-key")])
            .allow_origin(origins);

        let app = Router::new()
            .route("/relay", get(crate::websocket::upgrade))
            .merge(crate::http::routes())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(Extension(Arc::clone(&self.state)));
        Ok(app)
    }
}

/// Spawn the two halves of the inter-replica forwarding pump (§4.5):
///
/// - the R-side consumes [`ForwardedRequest`]s addressed to peers owned
///   here, remapping them onto a locally-scoped waiter;
/// - the O-side consumes [`ForwardedResult`]s and resolves the local
///   waiter this replica registered when it originated the request.
async fn spawn_forwarder_pumps(
    state: Arc<GatewayState>,
    client: redis::Client,
    session: Arc<SessionConfig>,
) -> Result<()> {
    let (mut requests, mut results) = forwarder::subscribe(client, &state.instance_id).await?;

    let request_state = Arc::clone(&state);
    let request_session = Arc::clone(&session);
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            handle_forwarded_request(&request_state, &request_session, request).await;
        }
    });

    tokio::spawn(async move {
        while let Some(result) = results.recv().await {
            handle_forwarded_result(&state, result).await;
        }
    });

    Ok(())
}

async fn handle_forwarded_request(state: &Arc<GatewayState>, session: &SessionConfig, request: ForwardedRequest) {
    let Some(kind) = RequestType::parse(&request.request_type) else {
        tracing::warn!(request_type = %request.request_type, "forwarded request names an unknown type");
        reject_forwarded_request(state, &request, "unknown request type").await;
        return;
    };

    let local_request_id = PendingRequestTable::new_request_id(kind);
    let deadline = Duration::from_millis(session.deadline_ms(kind));

    let mut extra = match request.payload {
        serde_json::Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("payload".to_string(), other);
            map
        }
    };
    extra.insert("clientId".to_string(), serde_json::Value::String(request.target_client_id.clone()));

    let envelope = relay_protocol::OutboundEnvelope {
        kind: request.request_type.clone(),
        request_id: local_request_id.clone(),
        extra,
    };
    let frame = match serde_json::to_string(&envelope) {
        Ok(f) => f,
        Err(err) => {
            tracing::error!(error = %err, "failed to encode forwarded envelope");
            reject_forwarded_request(state, &request, "encode failure").await;
            return;
        }
    };

    state
        .pending
        .register_forward(
            local_request_id.clone(),
            deadline,
            request.origin_replica.clone(),
            request.request_id.clone(),
            request.shape_hints.clone(),
        )
        .await;

    let sent = state
        .registry
        .send_to_client(&request.target_client_id, frame)
        .await
        .unwrap_or(false);

    if !sent {
        state.pending.cancel(&local_request_id).await;
        reject_forwarded_request(state, &request, "client not connected on this replica").await;
    }
}

async fn reject_forwarded_request(state: &Arc<GatewayState>, request: &ForwardedRequest, reason: &str) {
    let Some(forwarder) = state.router_forwarder() else { return };
    let result = ForwardedResult {
        request_id: request.request_id.clone(),
        payload: serde_json::Value::Null,
        error: Some(reason.to_string()),
    };
    if let Err(err) = forwarder.publish_result(&request.origin_replica, &result).await {
        tracing::warn!(error = %err, "failed to publish forwarded rejection");
    }
}

async fn handle_forwarded_result(state: &Arc<GatewayState>, result: ForwardedResult) {
    let outcome = match result.error {
        Some(message) => ResponseSink::PeerError(message),
        None => ResponseSink::Ok(result.payload),
    };
    let _ = state.pending.resolve(&result.request_id, outcome).await;
}

impl GatewayState {
    /// The forwarder used to publish results back to origin replicas,
    /// when cross-replica routing is enabled.
    pub fn router_forwarder(&self) -> Option<Forwarder> {
        self.dispatcher.forwarder()
    }
}
