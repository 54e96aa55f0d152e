//! WebSocket signaling endpoint
//!
//! Each connection runs four cooperating pieces:
//! - the reader (this task) decodes frames and queues them
//! - a worker processes queued frames strictly in arrival order
//! - a writer owns the socket sink and sends heartbeat pings
//! - a forwarder turns session events for this peer into notifications
//!
//! On disconnect the peer is torn down at once. Queued requests are dropped;
//! a request already running finishes against a missing peer and is
//! discarded.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::SessionEvent;
use crate::signaling::protocol::{decode_client_frame, ClientFrame, ServerFrame};
use crate::signaling::SignalingHandler;
use crate::state::AppState;

/// WebSocket upgrade handler for the signaling channel
pub async fn signaling_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let signaling = state.config.get().signaling.clone();
    let context = state.session.clone();

    // Subscribe before registering the peer so no event for it is missed
    let event_rx = state.events.subscribe();
    let peer_id = context.connect_peer();
    let handler = Arc::new(SignalingHandler::new(context.clone(), peer_id.clone()));
    let cancel = CancellationToken::new();

    let (sink, mut receiver) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<ServerFrame>(signaling.outbound_queue);

    let _ = out_tx
        .send(handler.connection_success().into_frame())
        .await;

    let writer = tokio::spawn(write_loop(
        sink,
        out_rx,
        signaling.heartbeat_secs,
        cancel.clone(),
    ));
    let forwarder = tokio::spawn(forward_events(
        handler.clone(),
        event_rx,
        out_tx.clone(),
        cancel.clone(),
    ));
    let (req_tx, req_rx) = mpsc::unbounded_channel::<ClientFrame>();
    let worker = tokio::spawn(request_worker(
        handler.clone(),
        req_rx,
        out_tx.clone(),
        cancel.clone(),
    ));

    let mut shutdown_rx = state.shutdown_signal();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shutdown_rx.recv() => {
                debug!("Shutdown, closing signaling connection {}", peer_id);
                break;
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match decode_client_frame(&text) {
                        Ok(frame) => {
                            if req_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Peer {} sent malformed frame: {}", peer_id, e);
                            if let Some(id) = e.request_id() {
                                if out_tx.send(ServerFrame::error(id, e.to_string())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    },
                    Some(Ok(Message::Binary(_))) => {
                        debug!("Ignoring binary frame from peer {}", peer_id);
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket receive error from peer {}: {}", peer_id, e);
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    drop(req_tx);
    context.disconnect_peer(&peer_id).await;

    let _ = worker.await;
    let _ = forwarder.await;
    let _ = writer.await;
    info!("Signaling connection {} closed", peer_id);
}

/// Process queued frames one at a time
async fn request_worker(
    handler: Arc<SignalingHandler>,
    mut req_rx: mpsc::UnboundedReceiver<ClientFrame>,
    out_tx: mpsc::Sender<ServerFrame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = req_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // Not raced against cancellation: engine calls run to completion
        if let Some(response) = handler.handle_frame(frame).await {
            if cancel.is_cancelled() || out_tx.send(response).await.is_err() {
                break;
            }
        }
    }
}

/// Forward session events that concern this peer
async fn forward_events(
    handler: Arc<SignalingHandler>,
    mut event_rx: broadcast::Receiver<SessionEvent>,
    out_tx: mpsc::Sender<ServerFrame>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_rx.recv() => event,
        };
        match event {
            Ok(event) => {
                if let Some(notification) = handler.notification_for(&event) {
                    if out_tx.send(notification.into_frame()).await.is_err() {
                        break;
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(
                    "Signaling connection {} lagged by {} events",
                    handler.peer_id(),
                    n
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Own the socket sink: outbound frames and heartbeat pings
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<ServerFrame>,
    heartbeat_secs: u64,
    cancel: CancellationToken,
) {
    let mut heartbeat = (heartbeat_secs > 0).then(|| {
        let period = Duration::from_secs(heartbeat_secs);
        interval_at(Instant::now() + period, period)
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if sink.send(Message::Text(json)).await.is_err() {
                            warn!("Failed to send signaling frame, disconnecting");
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode signaling frame: {}", e),
                }
            }
            _ = tick(&mut heartbeat) => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    warn!("Failed to send ping, disconnecting");
                    break;
                }
            }
        }
    }

    // A dead writer takes the whole connection down
    cancel.cancel();
    let _ = sink.close().await;
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
