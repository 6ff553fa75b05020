use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::prelude::*;

use stream_broker::config::{self, BrokerConfig, FileConfig, ServerConfig};
use stream_broker::{AppState, Broker, BrokerMetrics, HttpUpstream, create_router};

#[derive(Parser)]
#[command(name = "broker")]
#[command(about = "Shared session stream broker for the agent dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.stream_broker)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file to use instead of <data-dir>/broker.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker in the foreground
    Serve(ServeArgs),

    /// Print the resolved configuration as TOML
    Config,
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Port for the web server (0 = auto-select)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Agent endpoint that streams each turn
    #[arg(long)]
    upstream_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl ServeArgs {
    /// CLI flags beat the file and the environment.
    fn apply(&self, fc: &mut FileConfig) {
        if let Some(port) = self.port {
            fc.server.port = port;
        }
        if let Some(host) = &self.host {
            fc.server.host = host.clone();
        }
        if let Some(url) = &self.upstream_url {
            fc.upstream.url = url.clone();
        }
    }
}

fn resolve_config(cli: &Cli) -> Result<FileConfig> {
    let data_dir = cli.data_dir.clone().unwrap_or_else(config::default_data_dir);
    config::load_config(&data_dir, cli.config.as_deref())
        .extract()
        .context("Invalid broker configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut file_config = resolve_config(&cli)?;

    let args = match cli.command {
        Some(Commands::Config) => {
            let rendered =
                toml::to_string_pretty(&file_config).context("Failed to render configuration")?;
            print!("{}", rendered);
            return Ok(());
        }
        Some(Commands::Serve(args)) => args,
        None => ServeArgs::default(),
    };

    let default_directive = if args.debug {
        "stream_broker=debug,broker=debug,tower_http=debug,info"
    } else {
        "stream_broker=info,broker=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    args.apply(&mut file_config);
    let server_config = ServerConfig::from_file(&file_config);
    let broker_config = BrokerConfig::from_file(&file_config);

    info!("Starting session stream broker");

    let upstream = HttpUpstream::new(&server_config.upstream_url, server_config.connect_timeout)
        .context("Failed to build upstream HTTP client")?;
    info!("Upstream: {}", upstream.url());
    let metrics = Arc::new(BrokerMetrics::new());
    let broker = Broker::spawn(broker_config, Arc::new(upstream), metrics.clone());

    let app = create_router(AppState {
        broker: broker.clone(),
        metrics,
    });

    let addr = server_config
        .bind_addr()
        .with_context(|| format!("Invalid bind address {}:{}", server_config.host, server_config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;
    info!("Listening on http://{}", actual_addr);
    info!("Subscriber WebSocket at ws://{}/api/ws", actual_addr);

    // Stop the broker first: that aborts live streams and closes every
    // subscriber socket, which lets the server drain.
    let shutdown_signal = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received shutdown signal, cleaning up...");
        let _ = broker.shutdown().await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}
