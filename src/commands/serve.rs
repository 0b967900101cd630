//! Start the HTTP/WebSocket relay gateway.
use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use axum_server::Handle;
use relay_gateway_core::{Auth, RelayServer, ServerConfig, StaticApiKeyAuth, StaticSheetTemplate};

/// Run the gateway, applying CLI overrides on top of the loaded config.
pub async fn run(
    config: PathBuf,
    bind: Option<String>,
    instance_id: Option<String>,
    api_keys: Vec<String>,
) -> Result<()> {
    let mut config = ServerConfig::load(&config).await?;

    if let Some(bind) = bind {
        config.bind = bind;
    }
    if let Some(instance_id) = instance_id {
        config.instance_id = instance_id;
    }

    let auth: Arc<dyn Auth> = if api_keys.is_empty() {
        tracing::warn!("no --api-key provided, accepting every caller");
        Arc::new(StaticApiKeyAuth::permit_all())
    } else {
        Arc::new(StaticApiKeyAuth::new(api_keys))
    };

    let handle = Handle::new();
    let server = RelayServer::new(config, auth, Arc::new(StaticSheetTemplate)).await?;
    server.start(handle).await?;
    Ok(())
}
