use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::events::WireMessage;
use crate::server::SharedState;
use crate::session::ConnectionId;

pub async fn device_socket(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: SharedState) {
    let Some(mut conn) = state.session.attach().await else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let heartbeat = state.heartbeat;
    let mut ping = interval(heartbeat.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ping.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            // Replaced by a newer connection, reset or shut down
            _ = &mut conn.closed => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            _ = ping.tick() => {
                if last_seen.elapsed() >= heartbeat.ping_timeout {
                    warn!(
                        "local-server: device connection {} silent for {:?}, dropping it",
                        conn.id,
                        last_seen.elapsed()
                    );
                    break;
                }
                if socket.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!("local-server: device connection {} error: {}", conn.id, e);
                        break;
                    }
                    None => break,
                };
                last_seen = Instant::now();

                match msg {
                    Message::Text(text) => handle_frame(&state, conn.id, text.as_str()).await,
                    Message::Ping(data) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                    Message::Binary(_) => {
                        debug!("local-server: ignoring binary frame from {}", conn.id);
                    }
                }
            }
        }
    }

    // No-op if the session already let go of this connection
    state.session.detach(conn.id).await;
}

async fn handle_frame(state: &SharedState, id: ConnectionId, text: &str) {
    let message: WireMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("local-server: malformed frame from {}: {}", id, e);
            return;
        }
    };

    let name = message.event.clone();
    match message.into_event() {
        Some(event) => {
            state.session.dispatch(id, event).await;
        }
        None => debug!("local-server: ignoring unknown event '{}'", name),
    }
}
