use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use botgate_auth::RequireAuth;
use botgate_hub::{Client, KEEPALIVE_INTERVAL, WRITE_DEADLINE};
use futures::{SinkExt, StreamExt};
use tokio::time::timeout;

use crate::AppState;

/// `WS /api/v1/ws` — text-frame JSON control plane plus event fan-out.
pub async fn ws_handler(
    State(state): State<AppState>,
    RequireAuth(principal): RequireAuth,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, principal))
}

async fn handle_socket(socket: WebSocket, state: AppState, principal: botgate_core::Principal) {
    let (client, queue) = Client::new(principal);
    state.hub.register(client.clone()).await;
    let client_id = client.id();
    tracing::debug!(%client_id, "websocket client connected");

    let (mut sink, mut stream) = socket.split();

    // Outbound pump: drains the send queue with a per-write deadline and
    // pings on the keepalive tick. Queue close terminates it.
    let pump = tokio::spawn(async move {
        let mut queue = queue;
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
            KEEPALIVE_INTERVAL,
        );
        loop {
            tokio::select! {
                frame = queue.recv() => {
                    let Some(frame) = frame else { break };
                    let write = sink.send(Message::Text(frame.to_text().into()));
                    match timeout(WRITE_DEADLINE, write).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                _ = keepalive.tick() => {
                    let ping = sink.send(Message::Ping(Vec::new().into()));
                    match timeout(WRITE_DEADLINE, ping).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    // Reader: control frames until transport error or close.
    while let Some(received) = stream.next().await {
        match received {
            Ok(Message::Text(text)) => state.hub.handle_control(&client, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(%client_id, error = %err, "websocket read error");
                break;
            }
        }
    }

    state.hub.unregister(client_id).await;
    let _ = pump.await;
    tracing::debug!(%client_id, "websocket client disconnected");
}
