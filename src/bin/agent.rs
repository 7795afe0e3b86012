use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use hostwatch::{
    agent::{AgentEngine, AgentSettings, command::SystemCommandRunner},
    util::{get_command_timeout, get_hostname},
};
use tokio::net::UdpSocket;
use tracing::{level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(about = "Watches this host and reports alerts to a hostwatch server")]
struct Args {
    /// UDP port to listen on for server broadcasts; the server listens on PORT + 1
    #[arg(value_parser = clap::value_parser!(u16).range(1..65535))]
    port: u16,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("hostwatch", LevelFilter::DEBUG),
        ("hostwatch_agent", LevelFilter::TRACE),
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

    let socket = UdpSocket::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("failed to bind port {}", args.port))?;

    let settings = AgentSettings::new(args.port, get_hostname());
    let runner = SystemCommandRunner::new(get_command_timeout());

    AgentEngine::new(settings, runner, Utc::now()).run(socket).await;

    Ok(())
}
