//! Error types for the live comment client.

/// Everything that can go wrong while talking to the live service.
///
/// Server-reported states (`NotLoggedIn`, `ClosedStream`, `UnknownProtocol`)
/// are decided once by the codec from the response's status attribute.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("invalid live identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("login incorrect")]
    Login,

    #[error("not logged in")]
    NotLoggedIn,

    #[error("live stream is closed")]
    ClosedStream,

    #[error("unknown protocol error: {0}")]
    UnknownProtocol(String),

    #[error("stream ended after {partial} bytes without a frame terminator")]
    Frame { partial: usize },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("unexpected frame <{0}>")]
    UnexpectedFrame(String),

    #[error("comment post failed: {0}")]
    Post(String),

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("cookie file error: {0}")]
    Cookies(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl LiveError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::InvalidIdentifier(_) => "invalid_identifier",
            Self::Login => "login_error",
            Self::NotLoggedIn => "not_logged_in",
            Self::ClosedStream => "closed_stream",
            Self::UnknownProtocol(_) => "unknown_protocol_error",
            Self::Frame { .. } => "frame_error",
            Self::Decode(_) => "decode_error",
            Self::UnexpectedFrame(_) => "unexpected_frame",
            Self::Post(_) => "post_error",
            Self::Timeout(_) => "timeout",
            Self::Cookies(_) => "cookie_error",
            Self::Io(_) => "io_error",
            Self::Http(_) => "http_error",
        }
    }

    /// Map a server error code (`<error><code>..</code></error>`) to a variant.
    pub fn from_server_code(code: &str) -> Self {
        match code {
            "notlogin" => Self::NotLoggedIn,
            "closed" => Self::ClosedStream,
            other => Self::UnknownProtocol(other.to_string()),
        }
    }

    /// Whether this error ends the session it occurred on.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Post(_) | Self::UnexpectedFrame(_))
    }
}
