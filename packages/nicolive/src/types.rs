use std::fmt;
use std::str::FromStr;

use crate::error::LiveError;

/// Public identifier of a live broadcast, always `lv` followed by digits.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct LiveId(String);

impl LiveId {
    pub fn parse(raw: &str) -> Result<Self, LiveError> {
        let valid = raw
            .strip_prefix("lv")
            .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()));
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(LiveError::InvalidIdentifier(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for LiveId {
    type Err = LiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LiveId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Where the comment socket for a broadcast lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaServer {
    pub addr: String,
    pub port: u16,
    pub thread: u64,
}

/// Snapshot of the player-status response.
///
/// `watch_count` and `comment_count` are the values at fetch time; the
/// session keeps its own live counters refreshed by the heartbeat.
#[derive(Clone, Debug)]
pub struct LiveInfo {
    pub live_id: String,
    /// Broadcast start, unix seconds
    pub start_time: i64,
    pub room_label: String,
    pub seat_no: u32,
    pub is_premium: bool,
    pub user_id: String,
    pub media_server: MediaServer,
    pub watch_count: u64,
    pub comment_count: u64,
}

impl LiveInfo {
    /// Centiseconds elapsed since the broadcast started, as used for `vpos`.
    pub fn vpos_at(&self, now_millis: i64) -> i64 {
        (now_millis - self.start_time * 1000) / 10
    }
}

/// Handshake result of one comment socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadInfo {
    pub last_res: u64,
    pub result_code: u32,
    pub revision: u32,
    pub server_time: i64,
    pub thread: u64,
    pub ticket: String,
}

impl ThreadInfo {
    /// Post-key block derived from the response-count watermark.
    pub fn block_no(&self) -> u64 {
        self.last_res / 100
    }
}

/// Counters carried by a heartbeat response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    pub watch_count: u64,
    pub comment_count: u64,
}

/// Text carried by the server to announce the end of a broadcast.
pub const DISCONNECT_COMMAND: &str = "/disconnect";

/// A chat message from the comment stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub no: u64,
    pub date: i64,
    pub vpos: Option<i64>,
    /// Space separated commands from the `mail` attribute (`184`, colors, ...)
    pub mail: Vec<String>,
    pub anonymous: bool,
    /// "1" is premium, "2"/"3" are owner or system messages
    pub premium: Option<String>,
    pub user_id: Option<String>,
    pub text: String,
}

/// Server acknowledgment of a posted comment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PostAck {
    pub status: u32,
}

impl PostAck {
    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// One decoded frame of the comment stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Comment {
    Chat(ChatMessage),
    Ack(PostAck),
}

impl Comment {
    /// Chat text; acknowledgments carry none.
    pub fn text(&self) -> Option<&str> {
        match self {
            Comment::Chat(chat) => Some(&chat.text),
            Comment::Ack(_) => None,
        }
    }

    pub fn is_disconnect(&self) -> bool {
        self.text() == Some(DISCONNECT_COMMAND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_id_accepts_lv_digits() {
        let id = LiveId::parse("lv123456").unwrap();
        assert_eq!(id.as_str(), "lv123456");
        assert_eq!(id.to_string(), "lv123456");
        assert_eq!("lv1".parse::<LiveId>().unwrap().as_str(), "lv1");
    }

    #[test]
    fn live_id_rejects_malformed() {
        for raw in ["", "lv", "123", "lvabc", "lv12a", "co123", " lv1", "lv1 "] {
            assert!(
                matches!(LiveId::parse(raw), Err(LiveError::InvalidIdentifier(_))),
                "{:?} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn block_no_floors_by_hundred() {
        let mut thread = ThreadInfo {
            last_res: 1299,
            result_code: 0,
            revision: 1,
            server_time: 0,
            thread: 1,
            ticket: "t".to_string(),
        };
        assert_eq!(thread.block_no(), 12);
        thread.last_res = 99;
        assert_eq!(thread.block_no(), 0);
    }

    #[test]
    fn vpos_is_centiseconds_since_start() {
        let info = LiveInfo {
            live_id: "lv1".to_string(),
            start_time: 1_000,
            room_label: "arena".to_string(),
            seat_no: 1,
            is_premium: false,
            user_id: "u".to_string(),
            media_server: MediaServer {
                addr: "127.0.0.1".to_string(),
                port: 1,
                thread: 1,
            },
            watch_count: 0,
            comment_count: 0,
        };
        assert_eq!(info.vpos_at(1_000_000 + 12_340), 1234);
    }

    #[test]
    fn disconnect_detection() {
        let chat = Comment::Chat(ChatMessage {
            no: 1,
            date: 0,
            vpos: None,
            mail: vec![],
            anonymous: false,
            premium: Some("3".to_string()),
            user_id: None,
            text: DISCONNECT_COMMAND.to_string(),
        });
        assert!(chat.is_disconnect());
        let ack = Comment::Ack(PostAck { status: 0 });
        assert!(!ack.is_disconnect());
        assert!(ack.text().is_none());
    }
}
