use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use room_relay::{
    bus::{Bus, MemoryBus, RedisBus},
    channel::ChannelNaming,
    cli::{BusKind, Cli},
    gateway::Gateway,
    registry::Registry,
    relay::Relay,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn connect_bus(cli: &Cli) -> Result<Arc<dyn Bus>> {
    Ok(match cli.bus {
        BusKind::Redis => {
            let bus = RedisBus::connect(&cli.redis_url).await?;
            info!(url = %cli.redis_url, "connected to redis");
            Arc::new(bus)
        }
        BusKind::Memory => {
            warn!("using the in-memory bus; messages stay inside this process");
            Arc::new(MemoryBus::new())
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let bus = connect_bus(&cli).await?;
    let registry = Arc::new(Registry::new());
    let relay = Relay::new(registry, bus, ChannelNaming::new(cli.channel_prefix.clone()))
        .with_backoff(cli.backoff());

    let relay_task = relay.clone().start(cli.shutdown_grace()).await?;

    let listener = TcpListener::bind(cli.listen).await?;
    let gateway = Gateway::new(listener, relay).with_send_timeout(cli.send_timeout());
    info!("gateway listening on {}", gateway.local_addr()?);

    let served = gateway.run_until_ctrl_c().await;
    if let Err(err) = &served {
        warn!("gateway exited with error: {err:?}");
    }

    let outcome = relay_task.shutdown().await;
    info!(?outcome, "relay shut down");

    served
}
