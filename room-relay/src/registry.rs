use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::message::Payload;

pub type ConnectionId = u64;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("connection is closed")]
    Closed,
    #[error("send timed out")]
    TimedOut,
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The outbound half of one client connection.
///
/// A send error means the connection is dead; the registry stops
/// delivering to it.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn send(&self, payload: &Payload) -> Result<(), SinkError>;
}

/// A sink tagged with the id the registry uses for membership.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    sink: Arc<dyn Sink>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

/// Outcome of one [`Registry::broadcast`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub pruned: usize,
}

type Room = HashMap<ConnectionId, Arc<dyn Sink>>;

/// Live connections of this process, grouped by room.
///
/// The lock covers structural changes and membership snapshots only. Sends
/// happen outside it, so a slow client never stalls joins or leaves.
pub struct Registry {
    rooms: Mutex<HashMap<String, Room>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn connect(&self, sink: Arc<dyn Sink>) -> Connection {
        Connection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            sink,
        }
    }

    pub async fn join(&self, room_id: &str, connection: &Connection) {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.entry(room_id.to_string()).or_default();
        room.insert(connection.id, Arc::clone(&connection.sink));
        debug!(room_id, connection_id = connection.id, total = room.len(), "joined room");
    }

    pub async fn leave(&self, room_id: &str, connection_id: ConnectionId) {
        let mut rooms = self.rooms.lock().await;
        if remove_member(&mut rooms, room_id, connection_id) {
            debug!(room_id, connection_id, "left room");
        }
    }

    /// Sends `payload` to everyone in the room as of this call and prunes
    /// connections whose send fails.
    pub async fn broadcast(&self, room_id: &str, payload: &Payload) -> Delivery {
        let snapshot: Vec<(ConnectionId, Arc<dyn Sink>)> = {
            let rooms = self.rooms.lock().await;
            match rooms.get(room_id) {
                Some(room) => room
                    .iter()
                    .map(|(id, sink)| (*id, Arc::clone(sink)))
                    .collect(),
                None => return Delivery::default(),
            }
        };

        let attempts = snapshot.iter().map(|(id, sink)| async move {
            match sink.send(payload).await {
                Ok(()) => None,
                Err(err) => {
                    debug!(room_id, connection_id = *id, error = %err, "dropping dead connection");
                    Some(*id)
                }
            }
        });
        let failed: Vec<ConnectionId> = join_all(attempts).await.into_iter().flatten().collect();

        if !failed.is_empty() {
            let mut rooms = self.rooms.lock().await;
            for id in &failed {
                remove_member(&mut rooms, room_id, *id);
            }
        }

        Delivery {
            delivered: snapshot.len() - failed.len(),
            pruned: failed.len(),
        }
    }

    pub async fn room_size(&self, room_id: &str) -> usize {
        let rooms = self.rooms.lock().await;
        rooms.get(room_id).map_or(0, HashMap::len)
    }

    pub async fn active_rooms(&self) -> HashSet<String> {
        let rooms = self.rooms.lock().await;
        rooms.keys().cloned().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

// Empty rooms are dropped in the same critical section that emptied them.
fn remove_member(
    rooms: &mut HashMap<String, Room>,
    room_id: &str,
    connection_id: ConnectionId,
) -> bool {
    let Some(room) = rooms.get_mut(room_id) else {
        return false;
    };
    let removed = room.remove(&connection_id).is_some();
    if room.is_empty() {
        rooms.remove(room_id);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        received: StdMutex<Vec<Payload>>,
    }

    #[async_trait]
    impl Sink for Recorder {
        async fn send(&self, payload: &Payload) -> Result<(), SinkError> {
            self.received
                .lock()
                .expect("recorder lock")
                .push(payload.clone());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Sink for Broken {
        async fn send(&self, _payload: &Payload) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }
    }

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let registry = Registry::new();
        let conn = registry.connect(Arc::new(Recorder::default()));

        registry.join("r1", &conn).await;
        registry.join("r1", &conn).await;

        assert_eq!(registry.room_size("r1").await, 1);
    }

    #[tokio::test]
    async fn leave_removes_empty_room() {
        let registry = Registry::new();
        let conn = registry.connect(Arc::new(Recorder::default()));

        registry.join("r1", &conn).await;
        registry.leave("r1", conn.id()).await;

        assert_eq!(registry.room_size("r1").await, 0);
        assert!(registry.active_rooms().await.is_empty());
    }

    #[tokio::test]
    async fn leave_of_unknown_member_is_a_noop() {
        let registry = Registry::new();
        let conn = registry.connect(Arc::new(Recorder::default()));
        registry.join("r1", &conn).await;

        registry.leave("r1", conn.id() + 100).await;
        registry.leave("missing", conn.id()).await;

        assert_eq!(registry.room_size("r1").await, 1);
    }

    #[tokio::test]
    async fn failing_sink_is_pruned_and_others_still_receive() {
        let registry = Registry::new();
        let good = Arc::new(Recorder::default());
        let a = registry.connect(Arc::new(Broken));
        let b = registry.connect(good.clone());
        registry.join("r1", &a).await;
        registry.join("r1", &b).await;

        let delivery = registry.broadcast("r1", &payload(json!({"x": 1}))).await;

        assert_eq!(delivery, Delivery { delivered: 1, pruned: 1 });
        assert_eq!(registry.room_size("r1").await, 1);
        let received = good.received.lock().expect("recorder lock").clone();
        assert_eq!(received, vec![payload(json!({"x": 1}))]);
    }

    #[tokio::test]
    async fn pruning_the_last_member_removes_the_room() {
        let registry = Registry::new();
        let conn = registry.connect(Arc::new(Broken));
        registry.join("r1", &conn).await;

        registry.broadcast("r1", &payload(json!({}))).await;

        assert!(registry.active_rooms().await.is_empty());
    }

    #[tokio::test]
    async fn broadcast_to_absent_room_creates_nothing() {
        let registry = Registry::new();

        let delivery = registry.broadcast("nobody", &payload(json!({"x": 1}))).await;

        assert_eq!(delivery, Delivery::default());
        assert!(registry.active_rooms().await.is_empty());
    }

    #[tokio::test]
    async fn connection_can_sit_in_several_rooms() {
        let registry = Registry::new();
        let conn = registry.connect(Arc::new(Recorder::default()));
        registry.join("r1", &conn).await;
        registry.join("r2", &conn).await;

        registry.leave("r1", conn.id()).await;

        let rooms = registry.active_rooms().await;
        assert!(rooms.contains("r2"));
        assert!(!rooms.contains("r1"));
    }
}
