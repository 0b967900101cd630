mod commands;

mod cli {
    use anyhow::Result;
    use clap::{Parser, Subcommand};
    use std::path::PathBuf;

    use super::commands;

    #[derive(Parser, Debug)]
    #[clap(author, version, about, long_about = None)]
    pub struct RelayGateway {
        #[clap(subcommand)]
        cmd: Command,
    }

    #[derive(Debug, Subcommand)]
    pub enum Command {
        /// Start the HTTP/WebSocket relay gateway.
        Serve {
            /// Config file to load.
            #[clap(short, long)]
            config: PathBuf,

            /// Override the configured bind address.
            #[clap(short, long)]
            bind: Option<String>,

            /// Override this replica's instance id.
            #[clap(long)]
            instance_id: Option<String>,

            /// Static API key to accept (repeatable). Omit to allow any
            /// caller, which is only suitable for local development.
            #[clap(long = "api-key")]
            api_keys: Vec<String>,
        },
    }

    pub(super) async fn run() -> Result<()> {
        let args = RelayGateway::parse();
        match args.cmd {
            Command::Serve { config, bind, instance_id, api_keys } => {
                commands::serve::run(config, bind, instance_id, api_keys).await?
            }
        }
        Ok(())
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "relay_gateway=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    if let Err(e) = cli::run().await {
        tracing::error!("{}", e);
    }

    Ok(())
}
