mod broker;
mod launcher;
mod messages;
mod registry;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleetlink_shared::reqrep::ReplySocket;

use broker::Broker;
use launcher::SystemLauncher;
use registry::Registry;

struct Config {
    ip: String,
    port: u16,
    snapshot_path: String,
    virgin: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".into(),
            port: 5556,
            snapshot_path: "clients.json".into(),
            virgin: false,
        }
    }
}

fn parse_args() -> anyhow::Result<Config> {
    let mut config = Config::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--ip" => config.ip = args.next().ok_or_else(|| anyhow::anyhow!("--ip needs a value"))?,
            "--port" => {
                let value = args.next().ok_or_else(|| anyhow::anyhow!("--port needs a value"))?;
                config.port = value.parse()?;
            }
            "--snapshot" => {
                config.snapshot_path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--snapshot needs a value"))?;
            }
            "--virgin" => config.virgin = true,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = parse_args()?;

    let registry = if config.virgin {
        info!("starting with an empty registry");
        Registry::new(&config.snapshot_path)
    } else {
        Registry::restore(&config.snapshot_path)?
    };

    let endpoint = format!("{}:{}", config.ip, config.port);
    info!("Broker starting on {endpoint}");

    let socket = ReplySocket::bind(&config.ip, config.port).await?;
    let broker = Broker::new(registry, Arc::new(SystemLauncher), endpoint);
    broker.run(socket).await
}
