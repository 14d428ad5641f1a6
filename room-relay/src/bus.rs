use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{
    StreamExt,
    future,
    stream::{self, BoxStream},
};
use redis::{AsyncCommands, aio::ConnectionManager};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

/// One item delivered by a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Control message confirming the subscription; carries no payload.
    Subscribed { pattern: String },
    Message { channel: String, payload: Vec<u8> },
}

/// Ends when the underlying bus connection goes away.
pub type BusSubscription = BoxStream<'static, BusEvent>;

/// The external publish/subscribe transport shared by every process.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    async fn psubscribe(&self, pattern: &str) -> Result<BusSubscription>;
}

/// Redis pub/sub. Publishes share one managed connection that is rebuilt
/// after the server drops it; the command that hit the drop still fails.
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).with_context(|| format!("invalid redis url {url}"))?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .with_context(|| format!("failed to connect to redis at {url}"))?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(channel, payload)
            .await
            .with_context(|| format!("failed to publish on {channel}"))?;
        debug!(channel, receivers, "published to redis");
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<BusSubscription> {
        // Subscriptions get their own connection; a RESP2 connection in
        // subscribe mode cannot issue PUBLISH.
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed to open redis pub/sub connection")?;
        pubsub
            .psubscribe(pattern)
            .await
            .with_context(|| format!("failed to psubscribe to {pattern}"))?;

        let ack = stream::once(future::ready(BusEvent::Subscribed {
            pattern: pattern.to_string(),
        }));
        let messages = pubsub.into_on_message().map(|msg| BusEvent::Message {
            channel: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });
        Ok(ack.chain(messages).boxed())
    }
}

const MEMORY_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Published {
    channel: String,
    payload: Vec<u8>,
}

/// In-process bus. Every [`Relay`](crate::relay::Relay) sharing one instance
/// behaves like a separate process attached to the same broker.
pub struct MemoryBus {
    sender: RwLock<broadcast::Sender<Published>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(MEMORY_BUS_CAPACITY);
        Self {
            sender: RwLock::new(sender),
        }
    }

    /// Ends every open subscription, as a dropped broker connection would.
    pub async fn sever(&self) {
        let (sender, _) = broadcast::channel(MEMORY_BUS_CAPACITY);
        *self.sender.write().await = sender;
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let sender = self.sender.read().await;
        // No subscribers is not an error; the message is simply dropped.
        let receivers = sender
            .send(Published {
                channel: channel.to_string(),
                payload,
            })
            .unwrap_or(0);
        debug!(channel, receivers, "published to memory bus");
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<BusSubscription> {
        let receiver = self.sender.read().await.subscribe();
        let pattern = pattern.to_string();

        let ack = stream::once(future::ready(BusEvent::Subscribed {
            pattern: pattern.clone(),
        }));
        let messages = stream::unfold(receiver, move |mut receiver| {
            let pattern = pattern.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(published) if pattern_matches(&pattern, &published.channel) => {
                            let event = BusEvent::Message {
                                channel: published.channel,
                                payload: published.payload,
                            };
                            return Some((event, receiver));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "memory bus subscriber fell behind");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(ack.chain(messages).boxed())
    }
}

/// Supports the two shapes the relay uses: `prefix*` and exact names.
fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}
