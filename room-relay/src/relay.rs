use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::{
    select,
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    bus::{Bus, BusEvent, BusSubscription},
    channel::ChannelNaming,
    message::{Payload, decode_payload, encode_payload},
    registry::Registry,
};

/// Delay schedule for resubscribing after the bus drops the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

impl Backoff {
    fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

/// Bridges the local [`Registry`] and the shared bus.
///
/// `publish` pushes a payload onto the room's channel; the task started by
/// [`Relay::start`] listens on every room channel and broadcasts whatever
/// arrives to local members. Rooms with no local members are a no-op, so
/// the subscription never has to track which rooms this process holds.
#[derive(Clone)]
pub struct Relay {
    registry: Arc<Registry>,
    bus: Arc<dyn Bus>,
    naming: ChannelNaming,
    backoff: Backoff,
}

impl Relay {
    pub fn new(registry: Arc<Registry>, bus: Arc<dyn Bus>, naming: ChannelNaming) -> Self {
        Self {
            registry,
            bus,
            naming,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn naming(&self) -> &ChannelNaming {
        &self.naming
    }

    /// Hands the payload to the bus. Success says nothing about delivery.
    pub async fn publish(&self, room_id: &str, payload: &Payload) -> Result<()> {
        let encoded = encode_payload(payload).context("failed to encode payload")?;
        self.bus
            .publish(&self.naming.channel(room_id), encoded)
            .await
    }

    pub async fn subscribe(&self) -> Result<BusSubscription> {
        self.bus.psubscribe(&self.naming.pattern()).await
    }

    /// Subscribes and spawns the relay loop. A failed initial subscription
    /// is returned so process startup can abort.
    pub async fn start(self, grace: Duration) -> Result<RelayTask> {
        let pattern = self.naming.pattern();
        let subscription = self
            .subscribe()
            .await
            .with_context(|| format!("failed to subscribe to {pattern}"))?;
        info!(%pattern, "relay subscribed");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(self.run_until(subscription, async move {
            let _ = shutdown_rx.await;
        }));

        Ok(RelayTask {
            shutdown: shutdown_tx,
            handle,
            grace,
        })
    }

    /// Forwards bus messages to the registry, one at a time, until
    /// `shutdown` resolves.
    pub async fn run_until<F>(self, mut subscription: BusSubscription, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        loop {
            select! {
                biased;
                _ = &mut shutdown => break,
                event = subscription.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => match self.resubscribe(shutdown.as_mut()).await {
                        Some(fresh) => subscription = fresh,
                        None => break,
                    },
                },
            }
        }

        info!("relay stopped");
    }

    async fn handle_event(&self, event: BusEvent) {
        let (channel, bytes) = match event {
            BusEvent::Subscribed { pattern } => {
                debug!(%pattern, "bus confirmed subscription");
                return;
            }
            BusEvent::Message { channel, payload } => (channel, payload),
        };

        let Some(room_id) = self.naming.room_id(&channel) else {
            warn!(%channel, "ignoring message outside the room namespace");
            return;
        };

        let payload = match decode_payload(&bytes) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(room_id, error = %err, "dropping malformed bus message");
                return;
            }
        };

        let delivery = self.registry.broadcast(room_id, &payload).await;
        debug!(
            room_id,
            delivered = delivery.delivered,
            pruned = delivery.pruned,
            "relayed message"
        );
    }

    async fn resubscribe<F>(&self, mut shutdown: Pin<&mut F>) -> Option<BusSubscription>
    where
        F: Future<Output = ()>,
    {
        let mut delay = self.backoff.min;
        warn!("bus subscription ended; resubscribing");

        loop {
            select! {
                _ = shutdown.as_mut() => return None,
                _ = sleep(delay) => {}
            }

            let attempt = select! {
                _ = shutdown.as_mut() => return None,
                attempt = self.subscribe() => attempt,
            };

            match attempt {
                Ok(subscription) => {
                    info!("relay resubscribed");
                    return Some(subscription);
                }
                Err(err) => {
                    delay = self.backoff.next(delay);
                    warn!(error = ?err, retry_in = ?delay, "resubscribe failed");
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The loop observed the signal and returned.
    Completed,
    /// The loop was still busy after the grace period and was aborted.
    Abandoned,
}

/// Handle to the spawned relay loop. Dropping it also stops the loop.
pub struct RelayTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    grace: Duration,
}

impl RelayTask {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn shutdown(self) -> ShutdownOutcome {
        let RelayTask {
            shutdown,
            mut handle,
            grace,
        } = self;
        let _ = shutdown.send(());

        match timeout(grace, &mut handle).await {
            Ok(Ok(())) => ShutdownOutcome::Completed,
            Ok(Err(err)) => {
                warn!(error = ?err, "relay task ended abnormally");
                ShutdownOutcome::Completed
            }
            Err(_) => {
                warn!(?grace, "relay did not stop in time; abandoning it");
                handle.abort();
                ShutdownOutcome::Abandoned
            }
        }
    }
}
