use anyhow::{Context, bail};
use chrono::Utc;
use clap::Parser;
use hostwatch::{config::read_config_file, server::ServerEngine, util::get_hostname};
use tokio::net::UdpSocket;
use tracing::{level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(about = "Configures hostwatch agents and collects their alerts")]
struct Args {
    /// Config file
    file: String,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("hostwatch", LevelFilter::DEBUG),
        ("hostwatch_server", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    let Some(server_port) = config.port.checked_add(1) else {
        bail!("port {} leaves no room for the server port", config.port);
    };

    let socket = UdpSocket::bind(("0.0.0.0", server_port))
        .await
        .with_context(|| format!("failed to bind port {server_port}"))?;
    socket
        .set_broadcast(true)
        .context("failed to enable broadcast")?;

    ServerEngine::new(&config, get_hostname(), Utc::now())
        .run(socket)
        .await;

    Ok(())
}
