//! Websocket front end: one subscriber per connection.
//!
//! Outbound frames are comment payloads, error objects for rejected posts,
//! and a final `{"detached": reason}` when the relay drops the connection
//! on its own. Inbound text frames are posted as comments.

use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use nicolive::LiveId;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::error::{ErrorResponse, RelayError};
use crate::subscriber::{ChannelSubscriber, Subscriber};

pub async fn comment_socket_handler(
    Path(live_id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let live_id = match LiveId::parse(&live_id) {
        Ok(id) => id,
        Err(e) => {
            let err = RelayError::from(e);
            return (StatusCode::BAD_REQUEST, Json(ErrorResponse::from(&err))).into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_comment_socket(socket, state, live_id))
}

pub async fn handle_comment_socket(socket: WebSocket, state: AppState, live_id: LiveId) {
    state.metrics.connection_opened();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (subscriber, mut feed) = ChannelSubscriber::new(state.subscriber_queue);
    let subscriber_id = subscriber.id();
    let subscribed = match state.account.auth_context().await {
        Ok(auth) => {
            state
                .registry
                .subscribe(&live_id, auth, Arc::new(subscriber))
                .await
        }
        Err(e) => Err(e.into()),
    };
    if let Err(e) = subscribed {
        warn!(live_id = %live_id, "Subscription failed: {}", e);
        let _ = ws_sender.send(Message::Text(error_frame(&e).into())).await;
        close(&mut ws_sender, close_code::ERROR, "subscription failed").await;
        state.metrics.connection_closed();
        return;
    }
    info!(live_id = %live_id, subscriber = %subscriber_id, "Websocket subscribed");

    // Replies to this client's own posts
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(16);

    let sender_task = async move {
        let detached = loop {
            tokio::select! {
                biased;
                comment = feed.comments.recv() => match comment {
                    Some(payload) => {
                        if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                            break None;
                        }
                    }
                    // The registry dropped us; the detach reason is already sent.
                    None => break (&mut feed.detached).await.ok(),
                },
                reply = reply_rx.recv() => match reply {
                    Some(text) => {
                        if ws_sender.send(Message::Text(text.into())).await.is_err() {
                            break None;
                        }
                    }
                    None => break None,
                },
                reason = &mut feed.detached => break reason.ok(),
            }
        };
        if let Some(reason) = detached {
            let notice = json!({ "detached": reason }).to_string();
            let _ = ws_sender.send(Message::Text(notice.into())).await;
            close(&mut ws_sender, close_code::NORMAL, &reason).await;
        }
    };

    let registry = state.registry.clone();
    let post_live_id = live_id.clone();
    let receiver_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let text = text.as_str().trim();
                    if text.is_empty() {
                        continue;
                    }
                    if let Err(e) = registry.forward(&post_live_id, subscriber_id, text).await {
                        debug!(live_id = %post_live_id, "Post rejected: {}", e);
                        if reply_tx.send(error_frame(&e)).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!("Websocket receive error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!("Sender task ended"),
        _ = receiver_task => debug!("Receiver task ended"),
    }

    state.registry.unsubscribe(&live_id, subscriber_id).await;
    state.metrics.connection_closed();
    info!(live_id = %live_id, subscriber = %subscriber_id, "Websocket closed");
}

fn error_frame(err: &RelayError) -> String {
    serde_json::to_string(&ErrorResponse::from(err)).unwrap_or_else(|_| {
        json!({ "error": err.error_code(), "message": err.to_string() }).to_string()
    })
}

async fn close(sender: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}
