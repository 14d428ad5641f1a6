use std::{net::SocketAddr, time::Duration};

use clap::{Parser, ValueEnum};

use crate::{channel::DEFAULT_CHANNEL_PREFIX, relay::Backoff};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address the gateway should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "ROOM_RELAY_LISTEN", default_value = "127.0.0.1:8000")]
    pub listen: SocketAddr,

    /// Bus used to relay messages between processes.
    #[arg(long, value_enum, default_value_t = BusKind::Redis)]
    pub bus: BusKind,

    /// Redis server backing the bus when `--bus redis` is selected.
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379/0")]
    pub redis_url: String,

    /// Prefix that turns a room id into a bus channel name.
    #[arg(long, env = "CHANNEL_PREFIX", default_value = DEFAULT_CHANNEL_PREFIX)]
    pub channel_prefix: String,

    /// How long shutdown waits for an in-flight relay broadcast.
    #[arg(long, default_value_t = 1000)]
    pub shutdown_grace_ms: u64,

    /// First delay before resubscribing after the bus drops the subscription.
    #[arg(long, default_value_t = 100)]
    pub reconnect_min_ms: u64,

    /// Upper bound for the resubscribe delay.
    #[arg(long, default_value_t = 5000)]
    pub reconnect_max_ms: u64,

    /// How long a single client may stall a broadcast before it is dropped.
    #[arg(long, default_value_t = 5000)]
    pub send_timeout_ms: u64,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    /// Shared Redis pub/sub; required for more than one process.
    Redis,
    /// In-process bus; messages never leave this process.
    Memory,
}

impl Cli {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        // A zero floor would never grow and spin while the bus is down.
        let min = Duration::from_millis(self.reconnect_min_ms.max(1));
        Backoff {
            min,
            max: Duration::from_millis(self.reconnect_max_ms).max(min),
        }
    }
}
