//! Connection handlers for the Fleetcast server.
//!
//! This module wires the engine together at startup and handles the
//! subscriber connection lifecycle.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, MetricsObserver};
use crate::telemetry::JsonLinesWriter;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use fleetcast_core::{
    Dispatcher, Fleet, FleetRng, NoopSink, QueuedSink, RouteData, RouteStore, Scheduler,
    SchedulerConfig, Subscription, TelemetrySink,
};
use fleetcast_protocol::{codec, Frame, PositionEvent, ProtocolError, PROTOCOL_VERSION};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Client sent something that does not decode.
pub const ERROR_MALFORMED_FRAME: u16 = 1000;
/// Client sent a frame the server does not accept.
pub const ERROR_UNSUPPORTED_FRAME: u16 = 1001;
/// Subscriber fell too far behind and was dropped.
pub const ERROR_EVICTED: u16 = 1002;

type WsSender = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    /// Position fan-out.
    pub dispatcher: Arc<Dispatcher>,
    /// Server configuration.
    pub config: Config,
    shutdown: watch::Receiver<bool>,
}

impl AppState {
    /// Create state for the router. Connections close once `shutdown` flips to `true`.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        config: Config,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            dispatcher,
            config,
            shutdown,
        }
    }
}

/// Encoding used on a subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// JSON text frames.
    #[default]
    Json,
    /// Length-prefixed MessagePack binary frames.
    Binary,
}

impl WireFormat {
    fn as_str(self) -> &'static str {
        match self {
            WireFormat::Json => "json",
            WireFormat::Binary => "binary",
        }
    }
}

/// Query parameters for `/ws`.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    format: WireFormat,
}

/// Load every route from the JSON file at `path`.
///
/// Invalid routes are skipped with a warning.
async fn load_routes(path: &str) -> Result<RouteStore> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read routes file: {path}"))?;
    let data = RouteData::from_json(&text)
        .with_context(|| format!("Failed to parse routes file: {path}"))?;

    let mut store = RouteStore::new(data);
    let skipped = store.load_all();

    for route in store.routes() {
        let stats = route.stats();
        info!(
            route = %route.id(),
            points = stats.points,
            total_km = format!("{:.1}", stats.total_km),
            avg_gap_m = format!("{:.0}", stats.avg_gap_m),
            max_gap_km = format!("{:.2}", stats.max_gap_km),
            "Route loaded"
        );
        if stats.large_gaps > 0 {
            warn!(
                route = %route.id(),
                large_gaps = stats.large_gaps,
                "Route has waypoint gaps over 500 m"
            );
        }
    }

    info!(loaded = store.len(), skipped = skipped.len(), "Routes ready");
    Ok(store)
}

/// Run the simulation and the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if routes cannot be loaded or the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let routes = Arc::new(load_routes(&config.routes_path).await?);

    let mut rng = FleetRng::from_seed_opt(config.seed);
    let (fleet, rejected) = Fleet::build(&config.vehicle_specs(), &routes, &mut rng);
    if fleet.is_empty() {
        warn!("Fleet is empty, no positions will be published");
    }
    info!(vehicles = fleet.len(), rejected = rejected.len(), "Fleet ready");

    let dispatcher = Arc::new(Dispatcher::with_config(config.dispatcher_config()));

    let telemetry = if config.telemetry.enabled {
        let writer = JsonLinesWriter::open(&config.telemetry.path)
            .await
            .with_context(|| format!("Failed to open telemetry file: {}", config.telemetry.path))?;
        info!(path = %writer.path().display(), "Writing telemetry");
        Some(QueuedSink::spawn(writer, config.telemetry.queue_capacity))
    } else {
        None
    };
    let sink: Arc<dyn TelemetrySink> = match &telemetry {
        Some((queued, _)) => Arc::new(queued.clone()),
        None => Arc::new(NoopSink),
    };

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let observer = MetricsObserver::new(
        Arc::clone(&dispatcher),
        telemetry.as_ref().map(|(queued, _)| queued.clone()),
    );
    let (scheduler, scheduler_handle) = Scheduler::new(
        fleet,
        routes,
        Arc::clone(&dispatcher),
        sink,
        rng,
        SchedulerConfig {
            tick_interval: config.tick_interval(),
        },
    );
    let scheduler_task = tokio::spawn(scheduler.run(observer));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState::new(dispatcher, config.clone(), shutdown_rx));
    let app = router(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Fleetcast server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    scheduler_handle.shutdown();
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Scheduler task failed");
    }

    // The scheduler held the other sink clones; this closes the queue
    if let Some((queued, writer_task)) = telemetry {
        let stats = queued.stats();
        drop(queued);
        if let Err(e) = writer_task.await {
            error!(error = %e, "Telemetry writer failed");
        }
        info!(
            submitted = stats.submitted,
            dropped = stats.dropped,
            "Telemetry closed"
        );
    }

    info!("Server stopped");
    Ok(())
}

/// HTTP routes served by Fleetcast.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/vehicles", get(vehicles_handler))
        .with_state(state)
}

/// Resolve on Ctrl-C and tell open connections to close.
async fn shutdown_signal(notify: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
    notify.send_replace(true);
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.dispatcher.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "subscribers": stats.subscribers,
        "vehicles": stats.vehicles,
        "evictions": stats.evictions,
    }))
}

/// Last-known position of every vehicle.
async fn vehicles_handler(State(state): State<Arc<AppState>>) -> Json<Vec<PositionEvent>> {
    Json(
        state
            .dispatcher
            .snapshot()
            .iter()
            .map(|event| PositionEvent::clone(event))
            .collect(),
    )
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, params.format))
}

/// Handle a subscriber connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, format: WireFormat) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let mut subscription = state.dispatcher.join();
    let id = subscription.id();
    let mut shutdown = state.shutdown.clone();

    debug!(subscriber = %id, format = format.as_str(), "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    if let Err(e) = send_greeting(&mut sender, &mut subscription, &state, format).await {
        debug!(subscriber = %id, error = %e, "Failed to send greeting");
        state.dispatcher.leave(id);
        return;
    }

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(1024);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            event = subscription.recv() => {
                let Some(event) = event else {
                    // The dispatcher evicted this subscriber
                    metrics::record_error("evicted");
                    let frame = Frame::error(ERROR_EVICTED, "Subscriber fell behind and was dropped");
                    let _ = send_frame(&mut sender, &frame, format).await;
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };

                let frame = Frame::position(PositionEvent::clone(&event));
                if send_frame(&mut sender, &frame, format).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                let result = match msg {
                    Some(Ok(Message::Text(text))) => match codec::decode_json(&text) {
                        Ok(frame) => handle_frame(&frame, &mut sender, format).await,
                        Err(e) => reject(&mut sender, &e, format).await,
                    },
                    Some(Ok(Message::Binary(data))) => {
                        read_buffer.extend_from_slice(&data);
                        handle_binary(&mut read_buffer, &mut sender, format).await
                    }
                    Some(Ok(Message::Ping(data))) => sender.send(Message::Pong(data)).await.map_err(Into::into),
                    Some(Ok(Message::Pong(_))) => Ok(()),
                    Some(Ok(Message::Close(_))) => {
                        debug!(subscriber = %id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(subscriber = %id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(subscriber = %id, "WebSocket stream ended");
                        break;
                    }
                };

                if let Err(e) = result {
                    debug!(subscriber = %id, error = %e, "Send failed");
                    break;
                }
            }
        }
    }

    state.dispatcher.leave(id);
    debug!(subscriber = %id, "WebSocket disconnected");
}

/// Send `Connected` followed by the snapshot.
async fn send_greeting(
    sender: &mut WsSender,
    subscription: &mut Subscription,
    state: &AppState,
    format: WireFormat,
) -> Result<()> {
    let connected = Frame::connected(
        subscription.id().to_string(),
        PROTOCOL_VERSION,
        state.config.tick_interval().as_millis() as u64,
    );
    send_frame(sender, &connected, format).await?;

    let snapshot = subscription
        .take_snapshot()
        .iter()
        .map(|event| PositionEvent::clone(event))
        .collect();
    send_frame(sender, &Frame::snapshot(snapshot), format).await
}

/// Decode and handle every complete frame in `buffer`.
async fn handle_binary(buffer: &mut BytesMut, sender: &mut WsSender, format: WireFormat) -> Result<()> {
    loop {
        match codec::decode_from(buffer) {
            Ok(Some(frame)) => handle_frame(&frame, sender, format).await?,
            Ok(None) => return Ok(()),
            Err(e) => {
                buffer.clear();
                return reject(sender, &e, format).await;
            }
        }
    }
}

/// Handle a decoded client frame.
async fn handle_frame(frame: &Frame, sender: &mut WsSender, format: WireFormat) -> Result<()> {
    match frame {
        Frame::Ping { timestamp } => send_frame(sender, &Frame::pong(*timestamp), format).await,
        Frame::Pong { .. } => Ok(()),
        _ => {
            debug!(frame_type = ?frame.frame_type(), "Unexpected frame type");
            let error = Frame::error(ERROR_UNSUPPORTED_FRAME, "Only ping frames are accepted");
            send_frame(sender, &error, format).await
        }
    }
}

/// Answer an undecodable client message with an error frame.
async fn reject(sender: &mut WsSender, error: &ProtocolError, format: WireFormat) -> Result<()> {
    debug!(error = %error, "Malformed client frame");
    metrics::record_error("decode");
    send_frame(sender, &Frame::error(ERROR_MALFORMED_FRAME, error.to_string()), format).await
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, frame: &Frame, format: WireFormat) -> Result<()> {
    let message = encode_message(frame, format)?;
    sender.send(message).await?;
    Ok(())
}

/// Encode a frame as a WebSocket message.
fn encode_message(frame: &Frame, format: WireFormat) -> Result<Message, ProtocolError> {
    let (message, len) = match format {
        WireFormat::Json => {
            let text = codec::encode_json(frame)?;
            let len = text.len();
            (Message::Text(text), len)
        }
        WireFormat::Binary => {
            let data = codec::encode(frame)?;
            let len = data.len();
            (Message::Binary(data.to_vec()), len)
        }
    };
    metrics::record_message(len, format.as_str());
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcast_core::DispatcherConfig;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn event() -> PositionEvent {
        PositionEvent {
            vehicle_id: "TN-01-AN-1001".to_string(),
            lat: 14.44,
            lng: 79.98,
            route: "TNSTC Exp 144".to_string(),
            kind: "TNSTC AC".to_string(),
            origin: "Nellore".to_string(),
            destination: "Chennai".to_string(),
            timestamp: 1_700_000_000_000,
        }
    }

    fn event_for(vehicle: &str) -> Arc<PositionEvent> {
        Arc::new(PositionEvent {
            vehicle_id: vehicle.to_string(),
            ..event()
        })
    }

    /// Serve the router on an ephemeral port. Connections stay open while the
    /// returned sender lives.
    async fn serve(dispatcher: Arc<Dispatcher>) -> (SocketAddr, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(AppState::new(dispatcher, Config::default(), shutdown_rx));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        (addr, shutdown_tx)
    }

    async fn connect(addr: SocketAddr, query: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}/ws{query}")).await.unwrap();
        ws
    }

    /// Next data message, or `None` once the server closes the socket.
    async fn next_message(ws: &mut Client) -> Option<ClientMessage> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for the server");
            match msg {
                Some(Ok(message @ (ClientMessage::Text(_) | ClientMessage::Binary(_)))) => {
                    return Some(message)
                }
                Some(Ok(ClientMessage::Ping(_) | ClientMessage::Pong(_) | ClientMessage::Frame(_))) => {}
                Some(Ok(ClientMessage::Close(_)) | Err(_)) | None => return None,
            }
        }
    }

    async fn next_json(ws: &mut Client) -> Frame {
        match next_message(ws).await {
            Some(ClientMessage::Text(text)) => codec::decode_json(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    async fn wait_for_subscribers(dispatcher: &Dispatcher, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.subscriber_count() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber count never settled");
    }

    #[test]
    fn test_wire_format_param() {
        let params: WsParams = serde_json::from_str(r#"{"format":"binary"}"#).unwrap();
        assert_eq!(params.format, WireFormat::Binary);

        let params: WsParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.format, WireFormat::Json);

        assert!(serde_json::from_str::<WsParams>(r#"{"format":"xml"}"#).is_err());
    }

    #[test]
    fn test_json_message_is_text() {
        let frame = Frame::position(event());
        let Message::Text(text) = encode_message(&frame, WireFormat::Json).unwrap() else {
            panic!("expected text message");
        };

        assert!(text.contains(r#""type":"position""#));
        assert!(text.contains(r#""vehicleId":"TN-01-AN-1001""#));
        assert_eq!(codec::decode_json(&text).unwrap(), frame);
    }

    #[test]
    fn test_binary_message_is_length_prefixed() {
        let frame = Frame::snapshot(vec![event(), event()]);
        let Message::Binary(data) = encode_message(&frame, WireFormat::Binary).unwrap() else {
            panic!("expected binary message");
        };

        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        assert_eq!(len + codec::LENGTH_PREFIX_SIZE, data.len());
        assert_eq!(codec::decode(&data).unwrap(), frame);
    }

    #[tokio::test]
    async fn test_connection_greets_then_streams() {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.publish(&[event_for("TN-01-AN-1001")]);
        let (addr, _shutdown) = serve(Arc::clone(&dispatcher)).await;

        let mut ws = connect(addr, "").await;

        let Frame::Connected {
            version,
            tick_interval_ms,
            ..
        } = next_json(&mut ws).await
        else {
            panic!("expected connected frame first");
        };
        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(tick_interval_ms, 1000);

        let Frame::Snapshot { events } = next_json(&mut ws).await else {
            panic!("expected snapshot frame second");
        };
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].vehicle_id, "TN-01-AN-1001");

        dispatcher.publish(&[event_for("TN-01-N-1002")]);
        let Frame::Position { event } = next_json(&mut ws).await else {
            panic!("expected position frame");
        };
        assert_eq!(event.vehicle_id, "TN-01-N-1002");

        ws.send(ClientMessage::Text(r#"{"type":"ping","timestamp":42}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut ws).await, Frame::pong(Some(42)));

        ws.send(ClientMessage::Text("not a frame".to_string())).await.unwrap();
        let Frame::Error { code, .. } = next_json(&mut ws).await else {
            panic!("expected error frame");
        };
        assert_eq!(code, ERROR_MALFORMED_FRAME);
    }

    #[tokio::test]
    async fn test_binary_format_sends_msgpack() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (addr, _shutdown) = serve(Arc::clone(&dispatcher)).await;

        let mut ws = connect(addr, "?format=binary").await;

        let mut frames = Vec::new();
        for _ in 0..2 {
            let Some(ClientMessage::Binary(data)) = next_message(&mut ws).await else {
                panic!("expected binary message");
            };
            frames.push(codec::decode(&data).unwrap());
        }
        assert!(matches!(frames[0], Frame::Connected { .. }));
        assert_eq!(frames[1], Frame::snapshot(Vec::new()));

        dispatcher.publish(&[event_for("TN-01-AN-1001")]);
        let Some(ClientMessage::Binary(data)) = next_message(&mut ws).await else {
            panic!("expected binary message");
        };
        assert_eq!(
            codec::decode(&data).unwrap(),
            Frame::position(PositionEvent::clone(&event_for("TN-01-AN-1001")))
        );
    }

    #[tokio::test]
    async fn test_evicted_subscriber_gets_error_and_close() {
        let dispatcher = Arc::new(Dispatcher::with_config(DispatcherConfig {
            queue_capacity: 1,
            max_consecutive_failures: 1,
            snapshot_on_join: true,
        }));
        let (addr, _shutdown) = serve(Arc::clone(&dispatcher)).await;

        let mut ws = connect(addr, "").await;
        assert!(matches!(next_json(&mut ws).await, Frame::Connected { .. }));
        assert!(matches!(next_json(&mut ws).await, Frame::Snapshot { .. }));

        // One event fits the queue, the rest overflow it in the same publish
        let report = dispatcher.publish(&[
            event_for("TN-01-AN-1001"),
            event_for("TN-01-N-1002"),
            event_for("TN-02-AN-1003"),
        ]);
        assert_eq!(report.evicted, 1);

        let Frame::Position { event } = next_json(&mut ws).await else {
            panic!("expected the queued position first");
        };
        assert_eq!(event.vehicle_id, "TN-01-AN-1001");

        let Frame::Error { code, .. } = next_json(&mut ws).await else {
            panic!("expected eviction error");
        };
        assert_eq!(code, ERROR_EVICTED);
        assert!(next_message(&mut ws).await.is_none());
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_dispatcher() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (addr, _shutdown) = serve(Arc::clone(&dispatcher)).await;

        let mut ws = connect(addr, "").await;
        next_json(&mut ws).await;
        next_json(&mut ws).await;
        assert_eq!(dispatcher.subscriber_count(), 1);

        ws.close(None).await.unwrap();
        wait_for_subscribers(&dispatcher, 0).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (addr, shutdown) = serve(Arc::clone(&dispatcher)).await;

        let mut ws = connect(addr, "").await;
        next_json(&mut ws).await;
        next_json(&mut ws).await;

        shutdown.send_replace(true);
        assert!(next_message(&mut ws).await.is_none());
        wait_for_subscribers(&dispatcher, 0).await;
    }
}
