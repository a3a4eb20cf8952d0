use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use amcp_server::ServerState;

#[derive(Parser)]
#[command(name = "amcp", version, about = "AMCP coding-assistant runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP/WebSocket/SSE server
    Serve {
        /// Bind host (defaults to server.yaml, then 127.0.0.1)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (defaults to server.yaml, then 4096)
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,amcp=debug"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { host, port } => {
            let mut config = amcp_config::load_server_config();
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }

            let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
            let state = ServerState::build(config).await?;
            amcp_server::run_server(addr, state).await
        }
    }
}
