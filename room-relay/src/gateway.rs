use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpListener, select, sync::mpsc, time::timeout};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    channel::{RoomIdError, validate_room_id},
    message::{ErrorBody, Health, Payload, PublishReceipt, PublishRequest, RoomList, RoomStatus},
    registry::{Sink, SinkError},
    relay::Relay,
};

// Messages queued per client before a send starts waiting on the socket.
const OUTBOUND_BUFFER: usize = 64;

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP and WebSocket front end for one process.
pub struct Gateway {
    listener: TcpListener,
    state: AppState,
}

impl Gateway {
    pub fn new(listener: TcpListener, relay: Relay) -> Self {
        Self {
            listener,
            state: AppState::new(relay),
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.state.send_timeout = send_timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Gateway { listener, state } = self;
        axum::serve(listener, router(state))
            .with_graceful_shutdown(shutdown)
            .await
            .context("gateway server failed")
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

#[derive(Clone)]
pub struct AppState {
    relay: Relay,
    send_timeout: Duration,
}

impl AppState {
    pub fn new(relay: Relay) -> Self {
        Self {
            relay,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/:room_id", get(ws_upgrade))
        .route("/publish/:room_id", post(publish))
        .route("/rooms", get(list_rooms))
        .route("/rooms/:room_id", get(room_status))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

enum ApiError {
    InvalidRoom(RoomIdError),
    Bus(anyhow::Error),
}

impl From<RoomIdError> for ApiError {
    fn from(err: RoomIdError) -> Self {
        ApiError::InvalidRoom(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::InvalidRoom(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            ApiError::Bus(err) => {
                warn!(error = ?err, "publish rejected by bus");
                (StatusCode::SERVICE_UNAVAILABLE, format!("{err:#}"))
            }
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    validate_room_id(&room_id)?;
    Ok(ws.on_upgrade(move |socket| run_connection(socket, state, room_id)))
}

async fn publish(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(request): Json<PublishRequest>,
) -> Result<(StatusCode, Json<PublishReceipt>), ApiError> {
    validate_room_id(&room_id)?;
    state
        .relay
        .publish(&room_id, &request.payload)
        .await
        .map_err(ApiError::Bus)?;

    let clients = state.relay.registry().room_size(&room_id).await;
    Ok((StatusCode::ACCEPTED, Json(PublishReceipt { room_id, clients })))
}

async fn list_rooms(State(state): State<AppState>) -> Json<RoomList> {
    let mut rooms: Vec<String> = state
        .relay
        .registry()
        .active_rooms()
        .await
        .into_iter()
        .collect();
    rooms.sort();
    Json(RoomList { rooms })
}

async fn room_status(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomStatus>, ApiError> {
    validate_room_id(&room_id)?;
    let clients = state.relay.registry().room_size(&room_id).await;
    Ok(Json(RoomStatus { room_id, clients }))
}

async fn health() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

/// Queues payloads for the connection task that owns the socket.
struct WsSink {
    outbound: mpsc::Sender<String>,
    send_timeout: Duration,
}

#[async_trait]
impl Sink for WsSink {
    async fn send(&self, payload: &Payload) -> Result<(), SinkError> {
        let text = serde_json::to_string(payload)?;
        match timeout(self.send_timeout, self.outbound.send(text)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SinkError::Closed),
            Err(_) => Err(SinkError::TimedOut),
        }
    }
}

async fn run_connection(socket: WebSocket, state: AppState, room_id: String) {
    let registry = Arc::clone(state.relay.registry());
    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let connection = registry.connect(Arc::new(WsSink {
        outbound: outbound_tx,
        send_timeout: state.send_timeout,
    }));
    let connection_id = connection.id();
    registry.join(&room_id, &connection).await;
    // From here the registry owns the only sender, so an eviction closes the queue.
    drop(connection);
    info!(room_id = %room_id, connection_id, "client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        select! {
            inbound = ws_rx.next() => match inbound {
                // Client frames only signal liveness.
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(
                        room_id = %room_id,
                        connection_id,
                        error = ?err,
                        "websocket read failed"
                    );
                    break;
                }
            },
            outbound = outbound_rx.recv() => match outbound {
                Some(text) => {
                    if let Err(err) = write_frame(&mut ws_tx, text, state.send_timeout).await {
                        debug!(
                            room_id = %room_id,
                            connection_id,
                            error = %err,
                            "websocket write failed"
                        );
                        break;
                    }
                }
                None => {
                    debug!(room_id = %room_id, connection_id, "connection evicted from room");
                    break;
                }
            },
        }
    }

    registry.leave(&room_id, connection_id).await;
    info!(room_id = %room_id, connection_id, "client disconnected");
}

/// Writes one text frame, giving up on a client that stops reading.
async fn write_frame<S>(ws_tx: &mut S, text: String, limit: Duration) -> Result<(), SinkError>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    match timeout(limit, ws_tx.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            debug!(error = ?err, "websocket sink rejected frame");
            Err(SinkError::Closed)
        }
        Err(_) => Err(SinkError::TimedOut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bus::MemoryBus, channel::ChannelNaming, registry::Registry};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let relay = Relay::new(
            Arc::new(Registry::new()),
            Arc::new(MemoryBus::new()),
            ChannelNaming::default(),
        );
        router(AppState::new(relay))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = test_router()
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let health: Health = body_json(response).await;
        assert_eq!(health.status, "ok");
    }

    #[tokio::test]
    async fn publish_to_empty_room_is_accepted() {
        let response = test_router()
            .oneshot(
                Request::post("/publish/r9")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"payload": {"msg": "hi"}}"#))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let receipt: PublishReceipt = body_json(response).await;
        assert_eq!(
            receipt,
            PublishReceipt {
                room_id: "r9".into(),
                clients: 0
            }
        );
    }

    #[tokio::test]
    async fn publish_rejects_pattern_characters() {
        let response = test_router()
            .oneshot(
                Request::post("/publish/r*")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"payload": {}}"#))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = body_json(response).await;
        assert!(body.error.contains('*'));
    }

    #[tokio::test]
    async fn unknown_room_reports_zero_clients() {
        let response = test_router()
            .oneshot(Request::get("/rooms/lobby").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        let status: RoomStatus = body_json(response).await;
        assert_eq!(status.clients, 0);
    }

    #[tokio::test]
    async fn sink_times_out_when_queue_is_full() {
        let (outbound, _receiver) = mpsc::channel(1);
        let sink = WsSink {
            outbound,
            send_timeout: Duration::from_millis(20),
        };
        let payload = Payload::new();

        sink.send(&payload).await.expect("first send fills the queue");
        let err = sink.send(&payload).await.expect_err("second send should time out");
        assert!(matches!(err, SinkError::TimedOut));
    }

    #[tokio::test]
    async fn sink_reports_closed_once_connection_is_gone() {
        let (outbound, receiver) = mpsc::channel(1);
        drop(receiver);
        let sink = WsSink {
            outbound,
            send_timeout: Duration::from_millis(20),
        };

        let err = sink.send(&Payload::new()).await.expect_err("send should fail");
        assert!(matches!(err, SinkError::Closed));
    }

    #[tokio::test]
    async fn room_status_rejects_pattern_characters() {
        let response = test_router()
            .oneshot(Request::get("/rooms/bad*room").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    /// Never accepts a frame, like a client whose TCP window stays full.
    struct StalledSocket;

    impl futures::Sink<Message> for StalledSocket {
        type Error = axum::Error;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }

        fn start_send(self: std::pin::Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn frame_write_gives_up_on_a_stalled_client() {
        let mut socket = StalledSocket;

        let started = std::time::Instant::now();
        let err = write_frame(&mut socket, "{}".into(), Duration::from_millis(20))
            .await
            .expect_err("stalled write should time out");

        assert!(matches!(err, SinkError::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn frame_write_passes_through_a_ready_socket() {
        let mut socket = futures::sink::drain::<Message>();

        write_frame(&mut socket, "{}".into(), Duration::from_millis(20))
            .await
            .expect("drain accepts every frame");
    }
}
