//! In-process fakes of the comment server and the HTTP API.
//!
//! The fake media server speaks the real framed protocol on a loopback
//! socket, so sessions under test exercise their actual socket code.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{Connector, LiveApi};
use crate::auth::AuthContext;
use crate::codec::{self, ChatPost, FRAME_TERMINATOR, Request, ThreadRequest};
use crate::error::LiveError;
use crate::session::lock;
use crate::types::{DISCONNECT_COMMAND, LiveId, MediaServer};

/// Comment server on `127.0.0.1:0`.
///
/// Every connection gets a `<thread>` reply to its thread request. Chat
/// posts are recorded and acknowledged on the socket they arrived on.
/// Pushed comments go to every open connection.
pub struct FakeMediaServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    cancel: CancellationToken,
}

struct ServerState {
    thread: u64,
    ticket: String,
    last_res: u64,
    ack_status: Mutex<Option<u32>>,
    accepted: AtomicUsize,
    peers: Mutex<Vec<Peer>>,
    thread_requests: Mutex<Vec<ThreadRequest>>,
    posts: Mutex<Vec<ChatPost>>,
}

struct Peer {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    closed: CancellationToken,
}

impl FakeMediaServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ServerState {
            thread: 1_000_001,
            ticket: "0xfeedbeef".to_string(),
            last_res: 1234,
            ack_status: Mutex::new(Some(0)),
            accepted: AtomicUsize::new(0),
            peers: Mutex::new(Vec::new()),
            thread_requests: Mutex::new(Vec::new()),
            posts: Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(listener, state.clone(), cancel.clone()));
        Ok(Self {
            addr,
            state,
            cancel,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn thread(&self) -> u64 {
        self.state.thread
    }

    pub fn ticket(&self) -> &str {
        &self.state.ticket
    }

    pub fn last_res(&self) -> u64 {
        self.state.last_res
    }

    /// Status of future `chat_result` replies; `None` stops acknowledging.
    pub fn ack_with(&self, status: Option<u32>) {
        *lock(&self.state.ack_status) = status;
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn thread_requests(&self) -> Vec<ThreadRequest> {
        lock(&self.state.thread_requests).clone()
    }

    pub fn received_posts(&self) -> Vec<ChatPost> {
        lock(&self.state.posts).clone()
    }

    pub fn push_chat(&self, no: u64, text: &str, premium: Option<&str>) {
        let premium = premium
            .map(|p| format!(r#" premium="{}""#, p))
            .unwrap_or_default();
        self.push_raw(&format!(
            r#"<chat thread="{}" no="{}" vpos="100" date="{}" user_id="fake{}"{}>{}</chat>"#,
            self.state.thread,
            no,
            chrono::Utc::now().timestamp(),
            no,
            premium,
            codec::escape_text(text)
        ));
    }

    /// Send one frame verbatim; the terminator is appended.
    pub fn push_raw(&self, xml: &str) {
        let mut frame = xml.as_bytes().to_vec();
        frame.push(FRAME_TERMINATOR);
        let mut peers = lock(&self.state.peers);
        peers.retain(|peer| !peer.closed.is_cancelled());
        for peer in peers.iter() {
            let _ = peer.tx.send(frame.clone());
        }
    }

    /// Announce the end of the broadcast.
    pub fn disconnect(&self) {
        self.push_chat(0, DISCONNECT_COMMAND, Some("2"));
    }

    /// Close every open connection without a goodbye.
    pub fn drop_connections(&self) {
        for peer in lock(&self.state.peers).drain(..) {
            peer.closed.cancel();
        }
    }
}

impl Drop for FakeMediaServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ServerState {
    fn thread_frame(&self) -> Vec<u8> {
        let mut frame = format!(
            r#"<thread resultcode="0" thread="{}" last_res="{}" ticket="{}" revision="1" server_time="{}"/>"#,
            self.thread,
            self.last_res,
            self.ticket,
            chrono::Utc::now().timestamp()
        )
        .into_bytes();
        frame.push(FRAME_TERMINATOR);
        frame
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>, cancel: CancellationToken) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    debug!("Fake media server accept failed: {}", e);
                    continue;
                }
            },
        };
        state.accepted.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve_peer(stream, state.clone(), cancel.child_token()));
    }
}

async fn serve_peer(stream: TcpStream, state: Arc<ServerState>, closed: CancellationToken) {
    let (read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    lock(&state.peers).push(Peer {
        tx: tx.clone(),
        closed: closed.clone(),
    });

    let writer_closed = closed.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                frame = rx.recv() => frame,
                _ = writer_closed.cancelled() => None,
            };
            let Some(frame) = frame else { break };
            if write.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = write.shutdown().await;
    });

    let mut reader = BufReader::new(read);
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = codec::read_frame(&mut reader) => frame,
        };
        let Ok(frame) = frame else { break };

        match codec::decode_request(&frame) {
            Ok(Request::Thread(request)) => {
                lock(&state.thread_requests).push(request);
                let _ = tx.send(state.thread_frame());
            }
            Ok(Request::Chat(post)) => {
                let thread = post.thread;
                lock(&state.posts).push(post);
                let status = *lock(&state.ack_status);
                if let Some(status) = status {
                    let mut ack =
                        format!(r#"<chat_result thread="{}" status="{}"/>"#, thread, status)
                            .into_bytes();
                    ack.push(FRAME_TERMINATOR);
                    let _ = tx.send(ack);
                }
            }
            Err(e) => debug!("Fake media server ignoring frame: {}", e),
        }
    }
    closed.cancel();
}

/// Scripted [`LiveApi`] pointing at a [`FakeMediaServer`].
pub struct FakeApi {
    media_server: MediaServer,
    start_time: i64,
    watch_count: u64,
    comment_count: u64,
    player_status: Mutex<Option<String>>,
    heartbeat: Mutex<Option<(u64, u64)>>,
    owner_response: Mutex<String>,
    heartbeats: AtomicUsize,
    logouts: AtomicUsize,
    post_keys: Mutex<Vec<(u64, u64)>>,
    owner_posts: Mutex<Vec<(String, String, String)>>,
}

impl FakeApi {
    pub const POST_KEY: &'static str = "fakepostkey.1234";
    pub const USER_ID: &'static str = "424242";

    pub fn new(server: &FakeMediaServer) -> Self {
        let watch_count = 10;
        let comment_count = 50;
        Self {
            media_server: MediaServer {
                addr: server.addr().ip().to_string(),
                port: server.addr().port(),
                thread: server.thread(),
            },
            start_time: chrono::Utc::now().timestamp() - 60,
            watch_count,
            comment_count,
            player_status: Mutex::new(None),
            heartbeat: Mutex::new(Some((watch_count, comment_count))),
            owner_response: Mutex::new("status=ok".to_string()),
            heartbeats: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
            post_keys: Mutex::new(Vec::new()),
            owner_posts: Mutex::new(Vec::new()),
        }
    }

    /// Watch count in the player status.
    pub fn watch_count(&self) -> u64 {
        self.watch_count
    }

    /// Comment count in the player status.
    pub fn comment_count(&self) -> u64 {
        self.comment_count
    }

    /// Replace the player-status body for every live id.
    pub fn set_player_status(&self, body: &str) {
        *lock(&self.player_status) = Some(body.to_string());
    }

    /// Counters the heartbeat reports; `None` makes the request fail.
    pub fn set_heartbeat(&self, counts: Option<(u64, u64)>) {
        *lock(&self.heartbeat) = counts;
    }

    pub fn set_owner_response(&self, body: &str) {
        *lock(&self.owner_response) = body.to_string();
    }

    pub fn heartbeats(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    /// `(thread, block_no)` of every post-key request.
    pub fn post_key_requests(&self) -> Vec<(u64, u64)> {
        lock(&self.post_keys).clone()
    }

    /// `(mail, body, name)` of every owner post.
    pub fn owner_posts(&self) -> Vec<(String, String, String)> {
        lock(&self.owner_posts).clone()
    }

    fn status_body(&self, live_id: &LiveId) -> String {
        if let Some(body) = lock(&self.player_status).clone() {
            return body;
        }
        format!(
            "<getplayerstatus status=\"ok\">\
             <stream><id>{}</id><watch_count>{}</watch_count><comment_count>{}</comment_count>\
             <start_time>{}</start_time></stream>\
             <user><room_label>arena</room_label><room_seetno>7</room_seetno>\
             <is_premium>1</is_premium><user_id>{}</user_id></user>\
             <ms><addr>{}</addr><port>{}</port><thread>{}</thread></ms>\
             </getplayerstatus>",
            live_id,
            self.watch_count,
            self.comment_count,
            self.start_time,
            Self::USER_ID,
            self.media_server.addr,
            self.media_server.port,
            self.media_server.thread
        )
    }
}

#[async_trait]
impl LiveApi for FakeApi {
    async fn player_status(&self, live_id: &LiveId) -> Result<String, LiveError> {
        Ok(self.status_body(live_id))
    }

    async fn heartbeat(&self, _live_id: &LiveId) -> Result<String, LiveError> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        let counts = *lock(&self.heartbeat);
        match counts {
            Some((watch, comments)) => Ok(format!(
                r#"<heartbeat status="ok"><watchCount>{}</watchCount><commentCount>{}</commentCount></heartbeat>"#,
                watch, comments
            )),
            None => Err(LiveError::Io(std::io::Error::other("heartbeat unavailable"))),
        }
    }

    async fn post_key(&self, thread: u64, block_no: u64) -> Result<String, LiveError> {
        lock(&self.post_keys).push((thread, block_no));
        Ok(format!("postkey={}", Self::POST_KEY))
    }

    async fn owner_post(
        &self,
        _live_id: &LiveId,
        mail: &str,
        body: &str,
        name: &str,
    ) -> Result<String, LiveError> {
        lock(&self.owner_posts).push((mail.to_string(), body.to_string(), name.to_string()));
        Ok(lock(&self.owner_response).clone())
    }

    async fn logout(&self) -> Result<(), LiveError> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// [`Connector`] handing out a shared [`FakeApi`].
pub struct FakeConnector {
    api: Arc<FakeApi>,
    connects: AtomicUsize,
    reject_logins: AtomicBool,
    delay_ms: AtomicU64,
}

impl FakeConnector {
    pub fn new(api: Arc<FakeApi>) -> Self {
        Self {
            api,
            connects: AtomicUsize::new(0),
            reject_logins: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        }
    }

    /// Fail credential logins with [`LiveError::Login`].
    pub fn reject_logins(&self, reject: bool) {
        self.reject_logins.store(reject, Ordering::SeqCst);
    }

    /// Stall every connect, widening race windows in tests.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, auth: AuthContext) -> Result<Arc<dyn LiveApi>, LiveError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if auth.logs_in() && self.reject_logins.load(Ordering::SeqCst) {
            return Err(LiveError::Login);
        }
        let api: Arc<dyn LiveApi> = self.api.clone();
        Ok(api)
    }
}
