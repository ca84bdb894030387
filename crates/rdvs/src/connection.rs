use crate::error::RdvsError;
use crate::lifecycle;
use crate::metrics::{counters, gauges, histograms};
use crate::registry::{Admission, Outbound};
use crate::router;
use crate::server::ServerState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rdv_common::envelope;
use rdv_common::Role;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Outbound queue depth per connection. Deliveries beyond this are
/// dropped (fire-and-forget semantics).
const DELIVER_QUEUE: usize = 256;

/// Accepts the WebSocket handshake, admits the connection into the
/// registry and drives it until either side closes. Disconnect handling
/// runs exactly once on the way out, whatever the exit path.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), RdvsError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_message),
        max_frame_size: Some(state.config.max_message),
        ..WebSocketConfig::default()
    };
    let ws_stream =
        tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (deliver_tx, mut deliver_rx) = mpsc::channel::<Outbound>(DELIVER_QUEUE);
    let admission = state.registry.admit(deliver_tx);

    gauges::inc_connections_active();
    counters::connections_total(admission.role);
    if admission.role == Role::User {
        gauges::inc_users_active();
    }
    info!(id = admission.id, role = %admission.role, peer = %peer_addr, "connection admitted");

    let result = drive(&mut ws_tx, &mut ws_rx, &mut deliver_rx, &state, &admission).await;

    lifecycle::disconnect(&state, &admission).await;
    gauges::dec_connections_active();
    info!(id = admission.id, "connection closed");

    result
}

/// Sends the greeting envelopes, then runs the message loop.
async fn drive(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    deliver_rx: &mut mpsc::Receiver<Outbound>,
    state: &ServerState,
    admission: &Admission,
) -> Result<(), RdvsError> {
    ws_tx
        .send(Message::Text(envelope::role_status(admission.role)))
        .await?;

    if admission.role == Role::User {
        if let Some(admin) = state.registry.admin_handle() {
            let notice = Outbound::Envelope(envelope::new_user(admission.id));
            if admin.tx.try_send(notice).is_err() {
                debug!(id = admission.id, "admin queue full, NEW_USER notice dropped");
            }
        }
    }

    run_message_loop(ws_tx, ws_rx, deliver_rx, state, admission).await
}

/// Drives the select loop for an admitted connection: inbound frames go
/// through the router, queued deliveries go out, and a ping interval
/// enforces the idle timeout.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    deliver_rx: &mut mpsc::Receiver<Outbound>,
    state: &ServerState,
    admission: &Admission,
) -> Result<(), RdvsError> {
    let mut ping_interval = interval(Duration::from_secs(state.config.ping_interval));
    let idle_timeout = Duration::from_secs(state.config.idle_timeout);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        route_timed(state, admission, &text, ws_tx).await?;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        // Some clients ship the JSON envelope as a binary
                        // frame; route it the same way.
                        match std::str::from_utf8(&data) {
                            Ok(text) => route_timed(state, admission, text, ws_tx).await?,
                            Err(_) => {
                                debug!(id = admission.id, "dropping non-utf8 binary frame");
                                counters::messages_dropped_total("malformed");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            debug!(id = admission.id, error = ?e, "failed to send pong");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(RdvsError::WebSocket(e)),
                    _ => {}
                }
            }
            Some(command) = deliver_rx.recv() => {
                last_activity = Instant::now();
                match command {
                    Outbound::Envelope(text) => {
                        ws_tx
                            .send(Message::Text(text))
                            .await
                            .map_err(RdvsError::WebSocket)?;
                    }
                    Outbound::Close => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
            _ = ping_interval.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    debug!(id = admission.id, "idle timeout reached, closing connection");
                    return Ok(());
                }
                if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                    debug!(id = admission.id, error = ?e, "failed to send ping");
                }
            }
        }
    }
}

async fn route_timed(
    state: &ServerState,
    admission: &Admission,
    text: &str,
    ws_tx: &mut WsSink,
) -> Result<(), RdvsError> {
    let start = Instant::now();
    router::route(state, admission, text, ws_tx).await?;
    histograms::route_latency_seconds(start.elapsed().as_secs_f64());
    Ok(())
}
