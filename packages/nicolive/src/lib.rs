//! nicolive - Live comment stream client
//!
//! This crate opens an authenticated session on a live broadcast, reads its
//! comment stream and posts comments. It knows nothing about who consumes
//! the comments; fan-out belongs to the caller.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use nicolive::{AuthContext, Endpoints, HttpConnector, LiveId, LiveSession, PostOptions, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let connector = HttpConnector::new(Endpoints::default(), Duration::from_secs(10));
//!     let auth = AuthContext::credentials("me@example.com", "password");
//!     let live_id = LiveId::parse("lv123456").unwrap();
//!
//!     let session = LiveSession::open(live_id, auth, &connector, SessionConfig::default())
//!         .await
//!         .unwrap();
//!
//!     let mut stream = session.receive().unwrap();
//!     let poster = session.clone();
//!     tokio::spawn(async move {
//!         poster.post("hello", &PostOptions::default()).await.unwrap();
//!     });
//!
//!     while let Some(Ok(comment)) = stream.next().await {
//!         if let Some(text) = comment.text() {
//!             println!("{}", text);
//!         }
//!     }
//! }
//! ```

pub mod api;
mod auth;
pub mod codec;
mod error;
mod session;
mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use api::{Connector, Endpoints, HttpConnector, HttpLiveApi, LiveApi};
pub use auth::AuthContext;
pub use error::LiveError;
pub use session::{CommentStream, LiveSession, PostOptions, SessionConfig, SessionState};
pub use types::{
    ChatMessage, Comment, DISCONNECT_COMMAND, Heartbeat, LiveId, LiveInfo, MediaServer, PostAck,
    ThreadInfo,
};
