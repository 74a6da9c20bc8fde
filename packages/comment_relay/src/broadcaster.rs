//! Per-session pump from the upstream comment stream to subscribers.

use std::sync::{Arc, Weak};

use nicolive::{ChatMessage, Comment, CommentStream, LiveSession};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::metrics::RelayMetrics;
use crate::registry::{SessionRegistry, Slot};

/// JSON object delivered to subscribers for every chat comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentPayload {
    pub body: String,
    pub no: u64,
    pub premium: Option<String>,
}

impl From<&ChatMessage> for CommentPayload {
    fn from(chat: &ChatMessage) -> Self {
        Self {
            body: chat.text.clone(),
            no: chat.no,
            premium: chat.premium.clone(),
        }
    }
}

pub(crate) fn spawn_pump(
    registry: Weak<SessionRegistry>,
    slot: Arc<Slot>,
    session: Weak<LiveSession>,
    stream: CommentStream,
    metrics: Arc<RelayMetrics>,
) -> JoinHandle<()> {
    tokio::spawn(run(registry, slot, session, stream, metrics))
}

async fn run(
    registry: Weak<SessionRegistry>,
    slot: Arc<Slot>,
    session: Weak<LiveSession>,
    mut stream: CommentStream,
    metrics: Arc<RelayMetrics>,
) {
    let live_id = stream.live_id().clone();
    debug!(live_id = %live_id, "Pump started");

    let reason = loop {
        let chat = match stream.next().await {
            None => break "session closed".to_string(),
            Some(Err(e)) => break format!("upstream error: {}", e),
            Some(Ok(Comment::Ack(_))) => continue,
            Some(Ok(Comment::Chat(chat))) => chat,
        };
        if chat.text == nicolive::DISCONNECT_COMMAND {
            break "broadcast ended".to_string();
        }
        metrics.comment_received();

        let payload = match serde_json::to_string(&CommentPayload::from(&chat)) {
            Ok(json) => json,
            Err(e) => {
                error!(live_id = %live_id, "Failed to serialize comment: {}", e);
                continue;
            }
        };
        let Some(relay) = registry.upgrade() else {
            break "relay stopped".to_string();
        };
        if !relay.deliver(&slot, &payload).await {
            break "no subscribers left".to_string();
        }
    };

    debug!(live_id = %live_id, "Pump stopped: {}", reason);
    match registry.upgrade() {
        Some(relay) => relay.teardown(&live_id, &slot, &session, &reason).await,
        None => {
            if let Some(session) = session.upgrade() {
                session.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_shape() {
        let chat = ChatMessage {
            no: 42,
            date: 0,
            vpos: Some(100),
            mail: vec!["184".to_string()],
            anonymous: true,
            premium: None,
            user_id: Some("abc".to_string()),
            text: "hello <world>".to_string(),
        };
        let json = serde_json::to_value(CommentPayload::from(&chat)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"body": "hello <world>", "no": 42, "premium": null})
        );
    }

    #[test]
    fn payload_keeps_premium_tier() {
        let chat = ChatMessage {
            no: 1,
            date: 0,
            vpos: None,
            mail: vec![],
            anonymous: false,
            premium: Some("3".to_string()),
            user_id: None,
            text: "/info 1".to_string(),
        };
        let payload = CommentPayload::from(&chat);
        assert_eq!(payload.premium.as_deref(), Some("3"));
        let json = serde_json::to_string(&payload).unwrap();
        let back: CommentPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
