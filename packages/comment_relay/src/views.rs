use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use maud::{DOCTYPE, Markup, PreEscaped, html};
use nicolive::LiveId;

use crate::AppState;

// Connects to `{live_id}/comment` relative to the page, appends every
// comment, and sends the input box contents as a post.
const VIEWER_JS: &str = r#"
const list = document.getElementById('comments');
const status = document.getElementById('status');
const form = document.getElementById('post-form');
const input = document.getElementById('post-text');
const liveId = document.body.dataset.liveId;
const scheme = location.protocol === 'https:' ? 'wss' : 'ws';
const socket = new WebSocket(`${scheme}://${location.host}/${liveId}/comment`);

function append(text, cls) {
    const row = document.createElement('li');
    row.className = cls;
    row.textContent = text;
    list.appendChild(row);
    list.scrollTop = list.scrollHeight;
}

socket.onopen = () => { status.textContent = 'connected'; };
socket.onclose = () => { status.textContent = 'disconnected'; input.disabled = true; };
socket.onmessage = (event) => {
    const msg = JSON.parse(event.data);
    if (msg.error) {
        append(`${msg.error}: ${msg.message}`, 'text-red-400');
    } else if (msg.detached) {
        append(`relay closed the stream: ${msg.detached}`, 'text-yellow-400');
    } else {
        const tier = msg.premium ? ` [${msg.premium}]` : '';
        append(`${msg.no}${tier}  ${msg.body}`, 'text-gray-200');
    }
};

form.addEventListener('submit', (event) => {
    event.preventDefault();
    const text = input.value.trim();
    if (text && socket.readyState === WebSocket.OPEN) {
        socket.send(text);
        input.value = '';
    }
});
"#;

fn layout(title: &str, body: Markup) -> Markup {
    html! {
        (DOCTYPE)
        html {
            head {
                title { (title) }
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1";
                script src="https://cdn.tailwindcss.com" {}
            }
            (body)
        }
    }
}

pub async fn index_page(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.registry.sessions().await;

    let markup = layout(
        "Comment Relay",
        html! {
            body class="bg-gray-900 text-gray-200 p-8" {
                h1 class="text-2xl font-bold mb-4" { "Comment Relay" }
                @if sessions.is_empty() {
                    p class="text-gray-400" { "No broadcasts are being relayed. Open /lv<number> to start one." }
                } @else {
                    table class="text-sm" {
                        thead {
                            tr {
                                th class="text-left pr-6" { "Broadcast" }
                                th class="text-left pr-6" { "Room" }
                                th class="text-right pr-6" { "Subscribers" }
                                th class="text-right pr-6" { "Viewers" }
                                th class="text-right" { "Comments" }
                            }
                        }
                        tbody {
                            @for session in &sessions {
                                tr {
                                    td class="pr-6" {
                                        a class="text-blue-400 hover:underline" href={ "/" (session.live_id) } { (session.live_id) }
                                    }
                                    td class="pr-6" { (session.room_label) }
                                    td class="text-right pr-6" { (session.subscribers) }
                                    td class="text-right pr-6" { (session.watch_count) }
                                    td class="text-right" { (session.comment_count) }
                                }
                            }
                        }
                    }
                }
            }
        },
    );

    Html(markup.into_string())
}

pub async fn viewer_page(Path(live_id): Path<String>) -> Response {
    let live_id = match LiveId::parse(&live_id) {
        Ok(id) => id,
        Err(e) => {
            let markup = layout(
                "Comment Relay",
                html! {
                    body class="bg-gray-900 text-gray-200 p-8" {
                        h1 class="text-xl font-bold" { "Unknown broadcast" }
                        p class="text-gray-400" { (e) }
                    }
                },
            );
            return (StatusCode::BAD_REQUEST, Html(markup.into_string())).into_response();
        }
    };

    let markup = layout(
        &format!("{} - Comment Relay", live_id),
        html! {
            body class="bg-gray-900 text-gray-200 h-screen flex flex-col" data-live-id=(live_id) {
                div class="bg-gray-800 border-b border-gray-700 px-4 py-3 flex items-center justify-between" {
                    h1 class="font-bold" { (live_id) }
                    span id="status" class="text-sm text-gray-400" { "connecting" }
                }
                ul id="comments" class="flex-1 overflow-y-auto p-4 space-y-1 font-mono text-sm" {}
                form id="post-form" class="flex gap-2 p-4 border-t border-gray-700" {
                    input type="text" id="post-text" autocomplete="off"
                        class="flex-1 px-3 py-2 bg-gray-700 rounded border border-gray-600 focus:outline-none"
                        placeholder="Say something";
                    button type="submit" class="px-4 py-2 bg-blue-600 hover:bg-blue-500 rounded" { "Post" }
                }
                script { (PreEscaped(VIEWER_JS)) }
            }
        },
    );

    Html(markup.into_string()).into_response()
}
