//! Wire format of the comment server.
//!
//! Every unit on the comment socket is one XML element followed by a single
//! null byte. Requests are rendered from fixed templates; responses are
//! parsed by tag name. HTTP API bodies (player status, heartbeat, post key,
//! owner post) are decoded here as well so status handling lives in one place.

use std::str::FromStr;

use roxmltree::{Document, Node};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::LiveError;
use crate::types::{ChatMessage, Comment, Heartbeat, LiveInfo, MediaServer, PostAck, ThreadInfo};

pub const FRAME_TERMINATOR: u8 = 0;

/// Longest frame accepted from a peer, terminator excluded.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Protocol version sent with every thread request.
pub const THREAD_VERSION: &str = "20061206";

/// Request to join a comment thread, asking for the last `res_from` comments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadRequest {
    pub thread: u64,
    pub res_from: u64,
}

/// A chat post frame.
///
/// `text` is written verbatim between the tags; use [`escape_text`] on raw
/// user input first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatPost {
    pub thread: u64,
    pub ticket: String,
    pub vpos: i64,
    pub postkey: String,
    pub mail: String,
    pub user_id: String,
    pub premium: bool,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Thread(ThreadRequest),
    Chat(ChatPost),
}

/// Render a request frame, terminator included.
pub fn encode_request(request: &Request) -> Vec<u8> {
    let mut xml = match request {
        Request::Thread(req) => format!(
            r#"<thread thread="{}" res_from="-{}" version="{}" />"#,
            req.thread, req.res_from, THREAD_VERSION
        ),
        Request::Chat(post) => format!(
            r#"<chat thread="{}" ticket="{}" vpos="{}" postkey="{}" mail="{}" user_id="{}" premium="{}">{}</chat>"#,
            post.thread,
            post.ticket,
            post.vpos,
            post.postkey,
            post.mail,
            post.user_id,
            u8::from(post.premium),
            post.text
        ),
    }
    .into_bytes();
    xml.push(FRAME_TERMINATOR);
    xml
}

/// Parse a request frame (without terminator) back into its fields.
pub fn decode_request(frame: &[u8]) -> Result<Request, LiveError> {
    let xml = String::from_utf8_lossy(frame);
    let doc = parse(&xml)?;
    let root = doc.root_element();
    match root.tag_name().name() {
        "thread" => {
            let res_from = required_attr::<String>(root, "res_from")?;
            let res_from = res_from
                .strip_prefix('-')
                .unwrap_or(&res_from)
                .parse()
                .map_err(|_| LiveError::Decode(format!("bad res_from {:?}", res_from)))?;
            Ok(Request::Thread(ThreadRequest {
                thread: required_attr(root, "thread")?,
                res_from,
            }))
        }
        "chat" => Ok(Request::Chat(ChatPost {
            thread: required_attr(root, "thread")?,
            ticket: required_attr(root, "ticket")?,
            vpos: required_attr(root, "vpos")?,
            postkey: required_attr(root, "postkey")?,
            mail: required_attr(root, "mail")?,
            user_id: required_attr(root, "user_id")?,
            premium: root.attribute("premium") == Some("1"),
            text: root.text().unwrap_or_default().to_string(),
        })),
        other => Err(LiveError::UnexpectedFrame(other.to_string())),
    }
}

/// Escape text for use as element content.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

/// Read one frame, excluding its terminator.
///
/// Fails with [`LiveError::Frame`] if the stream ends before a terminator,
/// including a clean end between frames, and with [`LiveError::Decode`]
/// once a frame grows past [`MAX_FRAME_LEN`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, LiveError>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    let mut limited = (&mut *reader).take(MAX_FRAME_LEN as u64 + 1);
    limited.read_until(FRAME_TERMINATOR, &mut frame).await?;
    if frame.last() != Some(&FRAME_TERMINATOR) {
        if frame.len() > MAX_FRAME_LEN {
            return Err(LiveError::Decode(format!(
                "frame exceeds {} bytes",
                MAX_FRAME_LEN
            )));
        }
        return Err(LiveError::Frame {
            partial: frame.len(),
        });
    }
    frame.pop();
    Ok(frame)
}

pub fn decode_thread_info(frame: &[u8]) -> Result<ThreadInfo, LiveError> {
    let xml = String::from_utf8_lossy(frame);
    let doc = parse(&xml)?;
    let root = doc.root_element();
    if !root.has_tag_name("thread") {
        return Err(LiveError::UnexpectedFrame(root.tag_name().name().to_string()));
    }
    Ok(ThreadInfo {
        last_res: optional_attr(root, "last_res")?.unwrap_or(0),
        result_code: optional_attr(root, "resultcode")?.unwrap_or(0),
        revision: optional_attr(root, "revision")?.unwrap_or(0),
        server_time: optional_attr(root, "server_time")?.unwrap_or(0),
        thread: required_attr(root, "thread")?,
        ticket: required_attr(root, "ticket")?,
    })
}

pub fn decode_comment(frame: &[u8]) -> Result<Comment, LiveError> {
    let xml = String::from_utf8_lossy(frame);
    let doc = parse(&xml)?;
    let root = doc.root_element();
    match root.tag_name().name() {
        "chat" => Ok(Comment::Chat(ChatMessage {
            no: optional_attr(root, "no")?.unwrap_or(0),
            date: optional_attr(root, "date")?.unwrap_or(0),
            vpos: optional_attr(root, "vpos")?,
            mail: root
                .attribute("mail")
                .map(|m| m.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            anonymous: root.attribute("anonymity").is_some_and(|a| !a.is_empty() && a != "0"),
            premium: root.attribute("premium").map(str::to_string),
            user_id: root.attribute("user_id").map(str::to_string),
            text: root.text().unwrap_or_default().to_string(),
        })),
        "chat_result" => Ok(Comment::Ack(PostAck {
            status: optional_attr(root, "status")?.unwrap_or(0),
        })),
        other => Err(LiveError::UnexpectedFrame(other.to_string())),
    }
}

/// Decode the player-status API response.
pub fn decode_live_info(body: &str) -> Result<LiveInfo, LiveError> {
    let doc = parse(body)?;
    let root = doc.root_element();
    check_status(root)?;

    Ok(LiveInfo {
        live_id: required_child(root, &["stream", "id"])?,
        start_time: required_child(root, &["stream", "start_time"])?,
        room_label: child_text(root, &["user", "room_label"])
            .unwrap_or_default()
            .to_string(),
        seat_no: optional_child(root, &["user", "room_seetno"])?.unwrap_or(0),
        is_premium: child_text(root, &["user", "is_premium"]) == Some("1"),
        user_id: required_child(root, &["user", "user_id"])?,
        media_server: MediaServer {
            addr: required_child(root, &["ms", "addr"])?,
            port: required_child(root, &["ms", "port"])?,
            thread: required_child(root, &["ms", "thread"])?,
        },
        watch_count: optional_child(root, &["stream", "watch_count"])?.unwrap_or(0),
        comment_count: optional_child(root, &["stream", "comment_count"])?.unwrap_or(0),
    })
}

/// Decode the heartbeat API response.
pub fn decode_heartbeat(body: &str) -> Result<Heartbeat, LiveError> {
    let doc = parse(body)?;
    let root = doc.root_element();
    check_status(root)?;
    Ok(Heartbeat {
        watch_count: required_child(root, &["watchCount"])?,
        comment_count: required_child(root, &["commentCount"])?,
    })
}

/// Extract the one-time key from a `postkey=...` body.
pub fn decode_post_key(body: &str) -> Result<String, LiveError> {
    form_pairs(body)
        .find(|(key, _)| key == "postkey")
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| LiveError::Decode(format!("no post key in {:?}", body.trim())))
}

/// Check an owner-post response of the form `status=ok`.
pub fn decode_owner_post(body: &str) -> Result<(), LiveError> {
    match form_pairs(body).next() {
        Some((_, value)) if value == "ok" => Ok(()),
        Some((_, value)) => Err(LiveError::Post(format!("owner post rejected: {}", value))),
        None => Err(LiveError::Post(format!(
            "unexpected owner post response {:?}",
            body.trim()
        ))),
    }
}

fn form_pairs(body: &str) -> impl Iterator<Item = (String, String)> + '_ {
    body.trim().split('&').filter_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        let value = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());
        Some((key.to_string(), value))
    })
}

fn parse(xml: &str) -> Result<Document<'_>, LiveError> {
    Document::parse(xml).map_err(|e| LiveError::Decode(e.to_string()))
}

fn check_status(root: Node<'_, '_>) -> Result<(), LiveError> {
    match root.attribute("status") {
        None | Some("ok") => Ok(()),
        Some(status) => {
            let code = child_text(root, &["error", "code"]).unwrap_or(status);
            Err(LiveError::from_server_code(code.trim()))
        }
    }
}

fn child_text<'a>(node: Node<'a, '_>, path: &[&str]) -> Option<&'a str> {
    let mut current = node;
    for name in path {
        current = current.children().find(|n| n.has_tag_name(*name))?;
    }
    current.text()
}

fn optional_child<T: FromStr>(node: Node<'_, '_>, path: &[&str]) -> Result<Option<T>, LiveError> {
    child_text(node, path)
        .map(|text| {
            text.trim()
                .parse()
                .map_err(|_| LiveError::Decode(format!("bad <{}>: {:?}", path.join("/"), text)))
        })
        .transpose()
}

fn required_child<T: FromStr>(node: Node<'_, '_>, path: &[&str]) -> Result<T, LiveError> {
    optional_child(node, path)?
        .ok_or_else(|| LiveError::Decode(format!("missing <{}>", path.join("/"))))
}

fn optional_attr<T: FromStr>(node: Node<'_, '_>, name: &str) -> Result<Option<T>, LiveError> {
    node.attribute(name)
        .map(|value| {
            value
                .parse()
                .map_err(|_| LiveError::Decode(format!("bad attribute {}={:?}", name, value)))
        })
        .transpose()
}

fn required_attr<T: FromStr>(node: Node<'_, '_>, name: &str) -> Result<T, LiveError> {
    optional_attr(node, name)?.ok_or_else(|| {
        LiveError::Decode(format!(
            "<{}> has no {} attribute",
            node.tag_name().name(),
            name
        ))
    })
}
