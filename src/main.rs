mod arbitration;
mod broker_client;
mod config;
mod flightctl;
mod gcs;
mod messages;
mod mission;
mod server;
mod tasks;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleetlink_shared::pubsub::PubSocket;
use fleetlink_shared::reqrep::ReplySocket;

use broker_client::{BrokerClient, Registration};
use config::{parse_endpoint, Config};
use flightctl::monitor::spawn_flying_state_monitor;
use flightctl::sim::SimFlightController;
use flightctl::FlightController;
use gcs::GcsLink;
use server::VehicleServer;
use telemetry::spawn_telemetry;

const FLYING_MONITOR_INTERVAL: Duration = Duration::from_millis(200);

fn parse_args() -> anyhow::Result<Config> {
    let mut config = Config::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .ok_or_else(|| anyhow::anyhow!("{flag} needs a value"))
        };
        match arg.as_str() {
            "--id" => config.id = Some(value("--id")?),
            "--name" => config.name = value("--name")?,
            "--desc" => config.desc = value("--desc")?,
            "--ip" => config.ip = value("--ip")?,
            "--port" => config.port = value("--port")?.parse()?,
            "--broker" => config.broker = Some(parse_endpoint(&value("--broker")?)?),
            "--gcs" => config.gcs = Some(parse_endpoint(&value("--gcs")?)?),
            "--capability" => config.capabilities.push(value("--capability")?),
            "--speed" => config.default_speed = value("--speed")?.parse()?,
            "--no-midstick-check" => config.midstick_check = false,
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

    let fc: Arc<dyn FlightController> = Arc::new(SimFlightController::new());
    let flying = spawn_flying_state_monitor(fc.clone(), FLYING_MONITOR_INTERVAL);

    let socket = if config.port != 0 {
        ReplySocket::bind(&config.ip, config.port).await?
    } else {
        ReplySocket::bind_range(&config.ip, config.min_port, config.max_port).await?
    };
    let publisher = PubSocket::bind_range(&config.ip, config.min_port, config.max_port).await?;
    let info_port = publisher.port();

    let broker = match &config.broker {
        Some((broker_ip, broker_port)) => {
            let reg = Registration {
                id: config.id.clone(),
                name: config.name.clone(),
                desc: config.desc.clone(),
                ip: config.ip.clone(),
                port: socket.port(),
                capabilities: config.capabilities.clone(),
            };
            Some(BrokerClient::register(broker_ip, *broker_port, &reg).await?)
        }
        None => {
            info!("no broker configured, running standalone");
            None
        }
    };

    let id = broker
        .as_ref()
        .map(|b| b.id().to_string())
        .or(config.id.clone())
        .unwrap_or_else(|| config.name.clone());

    let mut server = VehicleServer::new(id, fc.clone(), flying)
        .with_info_port(info_port)
        .with_midstick_check(config.midstick_check)
        .with_default_speed(config.default_speed);
    if let Some((gcs_ip, gcs_port)) = &config.gcs {
        let link = GcsLink::connect(gcs_ip.clone(), *gcs_port);
        server = server.with_gcs(link.receiver());
    }
    if let Some(broker) = broker {
        server = server.with_broker(broker);
    }

    let (streams, init_point, plan) = server.telemetry_handles();
    let _telemetry = spawn_telemetry(fc, publisher, streams, init_point, plan);

    server.run(socket).await;
    Ok(())
}
