//! WebSocket endpoints of the live relay.
//!
//! `/ws/video-input` takes binary frames from the edge camera and publishes
//! them; `/ws/stream` subscribes a viewer and forwards frames as binary
//! messages and check-in notices as text.

use crate::relay::{Broadcast, Relay, Subscription};
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use roster_core::viewer::PING_TEXT;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How a viewer's inbound message affects its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inbound {
    Keepalive,
    Ignored,
    Close,
}

fn classify(message: &Message) -> Inbound {
    match message {
        Message::Text(text) if text.as_str().trim() == PING_TEXT => Inbound::Keepalive,
        // Protocol-level pings count as liveness too.
        Message::Ping(_) | Message::Pong(_) => Inbound::Keepalive,
        Message::Close(_) => Inbound::Close,
        _ => Inbound::Ignored,
    }
}

pub async fn video_input(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| produce(socket, relay))
}

async fn produce(mut socket: WebSocket, relay: Relay) {
    tracing::info!("video producer connected");
    let mut frames: u64 = 0;
    while let Some(message) = socket.recv().await {
        match message {
            Ok(Message::Binary(frame)) => {
                relay.publish(frame);
                frames += 1;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "producer connection failed");
                break;
            }
        }
    }
    tracing::info!(frames, "video producer disconnected");
}

pub async fn stream(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let relay = state.relay.clone();
    let silence = state.config.relay_silence;
    ws.on_upgrade(move |socket| async move {
        let subscription = relay.subscribe();
        serve_viewer(socket, subscription, silence).await;
    })
}

async fn serve_viewer(mut socket: WebSocket, mut subscription: Subscription, silence: Duration) {
    let deadline = tokio::time::sleep(silence);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            outbound = subscription.recv() => {
                let message = match outbound {
                    Some(Broadcast::Frame(frame)) => Message::Binary(frame),
                    Some(Broadcast::Notice(text)) => Message::Text(text.to_string().into()),
                    // Dropped by the relay for falling behind.
                    None => break,
                };
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => match inbound {
                Some(Ok(message)) => match classify(&message) {
                    Inbound::Keepalive => deadline.as_mut().reset(Instant::now() + silence),
                    Inbound::Ignored => {}
                    Inbound::Close => break,
                },
                Some(Err(e)) => {
                    tracing::debug!(viewer = %subscription.id(), error = %e, "viewer connection failed");
                    break;
                }
                None => break,
            },
            _ = &mut deadline => {
                tracing::info!(viewer = %subscription.id(), ?silence, "viewer silent; closing");
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_ping_text_is_keepalive() {
        assert_eq!(classify(&Message::Text("ping".to_string().into())), Inbound::Keepalive);
        assert_eq!(classify(&Message::Text(" ping\n".to_string().into())), Inbound::Keepalive);
        assert_eq!(classify(&Message::Ping(Bytes::new())), Inbound::Keepalive);
    }

    #[test]
    fn test_other_messages_do_not_refresh() {
        assert_eq!(classify(&Message::Text("hello".to_string().into())), Inbound::Ignored);
        assert_eq!(classify(&Message::Binary(Bytes::from_static(b"ping"))), Inbound::Ignored);
        assert_eq!(classify(&Message::Close(None)), Inbound::Close);
    }
}
