//! Live session lifecycle.
//!
//! A [`LiveSession`] owns one authenticated API channel and one primary
//! socket to the comment server. Reading and writing are independent: the
//! [`CommentStream`] owns the read half, posts serialize on the write half.
//!
//! ```text
//! Unauthenticated -> Authenticating -> Connected -> StreamOpen
//!        \________________\_______________\___________\__> Closed
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{Connector, LiveApi};
use crate::auth::AuthContext;
use crate::codec::{self, ChatPost, Request, ThreadRequest};
use crate::error::LiveError;
use crate::types::{Comment, LiveId, LiveInfo, MediaServer, PostAck, ThreadInfo};

/// Tunables of one session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    /// Extra history requested on top of the current comment count
    pub backlog: u64,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(45),
            backlog: 100,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Connected,
    StreamOpen,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::StreamOpen => "stream_open",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// How a comment is posted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostOptions {
    /// Mail commands; `184` posts anonymously
    pub command: String,
    /// Post through the broadcaster's management endpoint
    pub as_owner: bool,
    /// Display name for owner posts
    pub name: String,
}

impl Default for PostOptions {
    fn default() -> Self {
        Self {
            command: "184".to_string(),
            as_owner: false,
            name: String::new(),
        }
    }
}

pub struct LiveSession {
    live_id: LiveId,
    info: LiveInfo,
    thread: ThreadInfo,
    api: Arc<dyn LiveApi>,
    config: SessionConfig,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    /// Duplicate of the primary socket, used only to shut it down
    socket: std::net::TcpStream,
    pending_acks: Mutex<VecDeque<oneshot::Sender<PostAck>>>,
    watch_count: AtomicU64,
    comment_count: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl LiveSession {
    /// Authenticate, fetch the player status and join the comment thread.
    ///
    /// Returns only once the thread handshake has completed and the
    /// heartbeat is running.
    pub async fn open(
        live_id: LiveId,
        auth: AuthContext,
        connector: &dyn Connector,
        config: SessionConfig,
    ) -> Result<Arc<Self>, LiveError> {
        debug!(live_id = %live_id, state = %SessionState::Unauthenticated, "Opening session");
        let logs_in = auth.logs_in();

        debug!(live_id = %live_id, state = %SessionState::Authenticating, ?auth);
        let api = connector.connect(auth).await?;
        let info = codec::decode_live_info(&api.player_status(&live_id).await?)?;

        let stream = connect_media_server(&info.media_server, config.connect_timeout).await?;
        let std_stream = stream.into_std()?;
        let socket = std_stream.try_clone()?;
        let (read, mut write) = TcpStream::from_std(std_stream)?.into_split();
        let mut reader = BufReader::new(read);
        debug!(
            live_id = %live_id,
            state = %SessionState::Connected,
            "Connected to {}:{}",
            info.media_server.addr,
            info.media_server.port
        );

        let request = Request::Thread(ThreadRequest {
            thread: info.media_server.thread,
            res_from: info.comment_count + config.backlog,
        });
        write.write_all(&codec::encode_request(&request)).await?;
        let thread = read_thread_info(&mut reader, config.connect_timeout).await?;

        let session = Arc::new(Self {
            watch_count: AtomicU64::new(info.watch_count),
            comment_count: AtomicU64::new(info.comment_count),
            live_id,
            info,
            thread,
            api,
            config,
            writer: tokio::sync::Mutex::new(write),
            reader: Mutex::new(Some(reader)),
            socket,
            pending_acks: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            heartbeat: Mutex::new(None),
        });
        let heartbeat = spawn_heartbeat(&session, logs_in);
        *lock(&session.heartbeat) = Some(heartbeat);

        info!(
            live_id = %session.live_id,
            thread = session.thread.thread,
            last_res = session.thread.last_res,
            "Session open in {}",
            session.info.room_label
        );
        Ok(session)
    }

    /// Take the comment stream. Only the first call gets it.
    ///
    /// Post acknowledgments are routed while the stream is being read, so
    /// someone has to drive it for [`post`](Self::post) to complete.
    pub fn receive(self: &Arc<Self>) -> Option<CommentStream> {
        if self.is_closed() {
            return None;
        }
        let reader = lock(&self.reader).take()?;
        Some(CommentStream {
            session: Arc::downgrade(self),
            live_id: self.live_id.clone(),
            reader,
            cancel: self.cancel.clone(),
            done: false,
        })
    }

    /// Post a comment. Failures never close the session.
    pub async fn post(&self, text: &str, options: &PostOptions) -> Result<(), LiveError> {
        if self.is_closed() {
            return Err(LiveError::Post("session is closed".to_string()));
        }
        let result = if options.as_owner {
            self.post_as_owner(text, options).await
        } else {
            self.post_as_viewer(text, options).await
        };
        result.map_err(|e| match e {
            LiveError::Post(reason) => LiveError::Post(reason),
            other => LiveError::Post(other.to_string()),
        })
    }

    async fn post_as_owner(&self, text: &str, options: &PostOptions) -> Result<(), LiveError> {
        let body = self
            .api
            .owner_post(&self.live_id, &options.command, text, &options.name)
            .await?;
        codec::decode_owner_post(&body)?;
        debug!(live_id = %self.live_id, "Owner comment accepted");
        Ok(())
    }

    async fn post_as_viewer(&self, text: &str, options: &PostOptions) -> Result<(), LiveError> {
        // A fresh handshake tells us the current block for the post key.
        let ms = &self.info.media_server;
        let mut transient = connect_media_server(ms, self.config.connect_timeout).await?;
        let (read, mut write) = transient.split();
        let request = Request::Thread(ThreadRequest {
            thread: ms.thread,
            res_from: self.comment_count() + self.config.backlog,
        });
        write.write_all(&codec::encode_request(&request)).await?;
        let block_no = read_thread_info(&mut BufReader::new(read), self.config.connect_timeout)
            .await?
            .block_no();

        let postkey = codec::decode_post_key(&self.api.post_key(ms.thread, block_no).await?)?;
        let frame = codec::encode_request(&Request::Chat(ChatPost {
            thread: ms.thread,
            ticket: self.thread.ticket.clone(),
            vpos: self.info.vpos_at(chrono::Utc::now().timestamp_millis()),
            postkey,
            mail: options.command.clone(),
            user_id: self.info.user_id.clone(),
            premium: self.info.is_premium,
            text: codec::escape_text(text),
        }));

        let ack = {
            let mut writer = self.writer.lock().await;
            if self.is_closed() {
                return Err(LiveError::Post("session is closed".to_string()));
            }
            let (tx, rx) = oneshot::channel();
            lock(&self.pending_acks).push_back(tx);
            if let Err(e) = writer.write_all(&frame).await {
                lock(&self.pending_acks).pop_back();
                return Err(e.into());
            }
            rx
        };
        drop(transient);

        let ack = match tokio::time::timeout(self.config.ack_timeout, ack).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => {
                return Err(LiveError::Post(
                    "session closed before acknowledgment".to_string(),
                ));
            }
            Err(_) => {
                return Err(LiveError::Post(
                    "timed out waiting for acknowledgment".to_string(),
                ));
            }
        };
        if !ack.is_success() {
            return Err(LiveError::Post(format!(
                "server rejected comment with status {}",
                ack.status
            )));
        }
        debug!(live_id = %self.live_id, block_no, "Comment accepted");
        Ok(())
    }

    /// Close the session. Safe to call any number of times from anywhere.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            debug!(live_id = %self.live_id, "Socket shutdown: {}", e);
        }
        lock(&self.pending_acks).clear();
        info!(live_id = %self.live_id, "Session closed");
    }

    /// Close the session and wait for the heartbeat task to finish,
    /// including the logout of a credential session.
    pub async fn shutdown(&self) {
        self.close();
        let heartbeat = lock(&self.heartbeat).take();
        if let Some(heartbeat) = heartbeat {
            if let Err(e) = heartbeat.await {
                warn!(live_id = %self.live_id, "Heartbeat task failed: {}", e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn state(&self) -> SessionState {
        if self.is_closed() {
            SessionState::Closed
        } else if lock(&self.reader).is_some() {
            SessionState::Connected
        } else {
            SessionState::StreamOpen
        }
    }

    pub fn live_id(&self) -> &LiveId {
        &self.live_id
    }

    pub fn info(&self) -> &LiveInfo {
        &self.info
    }

    pub fn thread(&self) -> &ThreadInfo {
        &self.thread
    }

    pub fn watch_count(&self) -> u64 {
        self.watch_count.load(Ordering::Relaxed)
    }

    pub fn comment_count(&self) -> u64 {
        self.comment_count.load(Ordering::Relaxed)
    }

    fn route_ack(&self, ack: PostAck) {
        // Acks arrive in write order. A post that timed out keeps its slot
        // so its late ack is absorbed there.
        let waiter = lock(&self.pending_acks).pop_front();
        match waiter {
            Some(waiter) => {
                if waiter.send(ack).is_err() {
                    debug!(live_id = %self.live_id, status = ack.status, "Late acknowledgment for an abandoned post");
                }
            }
            None => {
                debug!(live_id = %self.live_id, status = ack.status, "Acknowledgment without a waiting post");
            }
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSession")
            .field("live_id", &self.live_id)
            .field("thread", &self.thread.thread)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Comments of one session, in server order.
pub struct CommentStream {
    session: Weak<LiveSession>,
    live_id: LiveId,
    reader: BufReader<OwnedReadHalf>,
    cancel: CancellationToken,
    done: bool,
}

impl CommentStream {
    /// Next comment, or `None` once the session is closed.
    ///
    /// A `/disconnect` chat is the last item; a read or decode error is
    /// yielded once and also ends the stream. Both close the session.
    pub async fn next(&mut self) -> Option<Result<Comment, LiveError>> {
        loop {
            if self.done || self.cancel.is_cancelled() {
                self.done = true;
                return None;
            }

            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                frame = codec::read_frame(&mut self.reader) => Some(frame),
            };
            let Some(frame) = frame else {
                self.done = true;
                return None;
            };

            match frame.and_then(|frame| codec::decode_comment(&frame)) {
                Ok(Comment::Ack(ack)) => {
                    if let Some(session) = self.session.upgrade() {
                        session.route_ack(ack);
                    }
                    return Some(Ok(Comment::Ack(ack)));
                }
                Ok(comment) => {
                    if comment.is_disconnect() {
                        info!(live_id = %self.live_id, "Broadcast ended");
                        self.finish();
                    }
                    return Some(Ok(comment));
                }
                Err(e) if !e.is_fatal() => {
                    debug!(live_id = %self.live_id, "Skipping frame: {}", e);
                }
                Err(e) => {
                    warn!(live_id = %self.live_id, "Comment stream failed: {}", e);
                    self.finish();
                    return Some(Err(e));
                }
            }
        }
    }

    pub fn live_id(&self) -> &LiveId {
        &self.live_id
    }

    fn finish(&mut self) {
        self.done = true;
        if let Some(session) = self.session.upgrade() {
            session.close();
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn connect_media_server(ms: &MediaServer, timeout: Duration) -> Result<TcpStream, LiveError> {
    tokio::time::timeout(timeout, TcpStream::connect((ms.addr.as_str(), ms.port)))
        .await
        .map_err(|_| LiveError::Timeout("connecting to the comment server"))?
        .map_err(LiveError::from)
}

async fn read_thread_info<R>(reader: &mut R, timeout: Duration) -> Result<ThreadInfo, LiveError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let frame = tokio::time::timeout(timeout, codec::read_frame(reader))
        .await
        .map_err(|_| LiveError::Timeout("waiting for the thread handshake"))??;
    codec::decode_thread_info(&frame)
}

fn spawn_heartbeat(session: &Arc<LiveSession>, logs_in: bool) -> JoinHandle<()> {
    let weak = Arc::downgrade(session);
    let api = session.api.clone();
    let cancel = session.cancel.clone();
    let live_id = session.live_id.clone();
    let interval = session.config.heartbeat_interval;

    tokio::spawn(async move {
        loop {
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                response = api.heartbeat(&live_id) => response,
            };
            match response.and_then(|body| codec::decode_heartbeat(&body)) {
                Ok(beat) => {
                    let Some(session) = weak.upgrade() else {
                        break;
                    };
                    session.watch_count.store(beat.watch_count, Ordering::Relaxed);
                    session.comment_count.store(beat.comment_count, Ordering::Relaxed);
                    debug!(
                        live_id = %live_id,
                        watch_count = beat.watch_count,
                        comment_count = beat.comment_count,
                        "Heartbeat"
                    );
                }
                Err(e) => warn!(live_id = %live_id, "Heartbeat failed: {}", e),
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        if logs_in {
            match api.logout().await {
                Ok(()) => debug!(live_id = %live_id, "Logged out"),
                Err(e) => warn!(live_id = %live_id, "Logout failed: {}", e),
            }
        }
    })
}
