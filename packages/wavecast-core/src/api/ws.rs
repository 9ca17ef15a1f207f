//! Signaling router: the per-connection state machine.
//!
//! Each duplex connection carries JSON control frames (room lifecycle, peer
//! discovery, chat, metadata) and, for the broadcaster, binary audio frames
//! that feed the relay pipeline. Connection-level guards run before the
//! message loop; afterwards the connection is either UNIDENTIFIED (only
//! `create-room` / `join-room` accepted) or JOINED with a fixed role.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::{COOKIE, HOST, ORIGIN};
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::error::SignalCode;
use crate::protocol_constants::{
    CHAT_MIN_INTERVAL_MS, CLOSE_BAD_ORIGIN, CLOSE_RATE_LIMITED, MAX_CANDIDATE_LEN, MAX_CHAT_NAME,
    MAX_CHAT_TEXT, MAX_COVER_URL, MAX_METADATA_TEXT, MAX_SDP_LEN, MAX_SIGNAL_FRAME_BYTES,
    MAX_TRACK_FIELD, SIGNAL_PING_INTERVAL_SECS,
};
use crate::room::registry::clamp;
use crate::room::{compose_icy_title, ChatMessage, ClientHandle, Role, Track};
use crate::session::now_millis;
use crate::source_client;

/// Participant id the broadcaster uses in room chat.
const BROADCASTER_PARTICIPANT: &str = "broadcaster";

// ─────────────────────────────────────────────────────────────────────────────
// Protocol messages
// ─────────────────────────────────────────────────────────────────────────────

/// An SDP forwarded between peers, shape-checked but otherwise opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SdpPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// Fields accepted on an `add-track` commit.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TrackPayload {
    #[serde(default)]
    pub text: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_sec: Option<u32>,
    pub release_date: Option<String>,
    pub isrc: Option<String>,
    pub bpm: Option<f32>,
    pub track_pos: Option<u32>,
    pub disc_num: Option<u32>,
    pub explicit: Option<bool>,
    pub contributors: Option<Vec<String>>,
    pub label: Option<String>,
    pub genres: Option<Vec<String>>,
    pub cover: Option<String>,
    pub cover_medium: Option<String>,
}

/// Inbound control frames. Anything that fails to parse is dropped.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub(crate) enum ClientMessage {
    CreateRoom {
        #[serde(default, rename = "customId")]
        custom_id: Option<String>,
    },
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
        role: String,
    },
    Ready,
    Offer {
        sdp: SdpPayload,
        #[serde(rename = "receiverId")]
        receiver_id: String,
    },
    Answer {
        sdp: SdpPayload,
    },
    Candidate {
        candidate: Value,
        #[serde(default, rename = "receiverId")]
        receiver_id: Option<String>,
    },
    StartRelay,
    Metadata {
        text: String,
        #[serde(default)]
        cover: Option<String>,
    },
    AddTrack {
        #[serde(flatten)]
        payload: TrackPayload,
    },
    Chat {
        name: String,
        text: String,
    },
    Leave,
    Stats {
        data: Value,
    },
    RelayDiag {
        #[serde(flatten)]
        data: Value,
    },
}

/// Outbound control frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub(crate) enum ServerMessage {
    RoomCreated {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    Joined {
        #[serde(rename = "roomId")]
        room_id: String,
        role: Role,
    },
    ListenerCount {
        count: usize,
    },
    PeerJoined {
        role: Role,
        #[serde(rename = "receiverId", skip_serializing_if = "Option::is_none")]
        receiver_id: Option<String>,
    },
    PeerLeft {
        role: Role,
        #[serde(rename = "receiverId", skip_serializing_if = "Option::is_none")]
        receiver_id: Option<String>,
    },
    Offer {
        sdp: SdpPayload,
    },
    Answer {
        sdp: SdpPayload,
        #[serde(rename = "receiverId")]
        receiver_id: String,
    },
    Candidate {
        candidate: Value,
        #[serde(rename = "receiverId", skip_serializing_if = "Option::is_none")]
        receiver_id: Option<String>,
    },
    StreamUrl {
        url: String,
    },
    RelayStarted {
        url: String,
    },
    Metadata {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cover: Option<String>,
    },
    TrackList {
        tracks: Vec<Track>,
    },
    Chat {
        #[serde(flatten)]
        message: ChatMessage,
    },
    ChatHistory {
        messages: Vec<ChatMessage>,
    },
    Error {
        code: SignalCode,
        message: String,
    },
}

impl ServerMessage {
    pub(crate) fn error(code: SignalCode) -> Self {
        Self::Error {
            code,
            message: code.message().to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection state
// ─────────────────────────────────────────────────────────────────────────────

/// Mutable per-connection state, owned by the connection's task.
pub(crate) struct ConnState {
    pub authed: bool,
    pub room_id: Option<String>,
    pub role: Option<Role>,
    pub receiver_id: Option<String>,
    pub last_chat: Option<Instant>,
    pub binary_frames: u64,
    /// `proto://host` derived from forwarded headers at upgrade time.
    pub public_base: String,
}

impl ConnState {
    pub(crate) fn new(authed: bool, public_base: String) -> Self {
        Self {
            authed,
            room_id: None,
            role: None,
            receiver_id: None,
            last_chat: None,
            binary_frames: 0,
            public_base,
        }
    }
}

/// Builds the externally visible base URL from forwarded headers, falling
/// back to the Host header and finally the bind port.
pub(crate) fn public_base_url(headers: &HeaderMap, port: u16) -> String {
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim())
        .filter(|v| !v.is_empty())
        .unwrap_or("http");
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(HOST))
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("localhost:{}", port));
    format!("{}://{}", proto, host)
}

// ─────────────────────────────────────────────────────────────────────────────
// Upgrade handler and guards
// ─────────────────────────────────────────────────────────────────────────────

pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ws = ws.max_message_size(MAX_SIGNAL_FRAME_BYTES);

    // Origin check. The rate limiter below keys on the socket peer address,
    // never a forwarded header.
    if let Some(allowed) = state.config.allowed_origin.as_deref() {
        let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
        if origin != Some(allowed) {
            log::warn!("[WS] Rejected {}: origin {:?} not allowed", peer, origin);
            return ws
                .on_upgrade(|socket| close_with(socket, CLOSE_BAD_ORIGIN, "origin not allowed"));
        }
    }

    if !state.limits.connects.check(peer.ip()) {
        log::warn!("[WS] Rejected {}: connection rate exceeded", peer);
        return ws
            .on_upgrade(|socket| close_with(socket, CLOSE_RATE_LIMITED, "too many connections"));
    }

    let authed = headers
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|c| state.sessions.validate_cookie_header(c))
        .is_some();
    let public_base = public_base_url(&headers, state.config.port);

    ws.on_upgrade(move |socket| handle_socket(socket, state, authed, public_base))
}

/// Completes the upgrade only to deliver a numbered close frame.
async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, state: AppState, authed: bool, public_base: String) {
    let (mut sink, mut stream) = socket.split();

    // Writer task: sole owner of the sink, draining an unbounded queue.
    // This totally orders outbound frames on the connection.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let handle = ClientHandle::new(out_tx);
    let mut conn = ConnState::new(authed, public_base);

    let ping_period = Duration::from_secs(SIGNAL_PING_INTERVAL_SECS);
    let mut ping_timer =
        tokio::time::interval_at(tokio::time::Instant::now() + ping_period, ping_period);
    let mut pong_pending = false;

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if handle_text(&state, &mut conn, &handle, &text).is_break() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => handle_binary(&state, &mut conn, data),
                Some(Ok(Message::Pong(_))) => pong_pending = false,
                Some(Ok(Message::Ping(_))) => {} // transport answers automatically
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            },
            _ = ping_timer.tick() => {
                if pong_pending {
                    log::debug!("[WS] No pong since previous ping, terminating");
                    break;
                }
                pong_pending = true;
                if !handle.send_raw(Message::Ping(Bytes::new())) {
                    break;
                }
            }
        }
    }

    disconnect(&state, &mut conn);
    drop(handle);
    let _ = writer.await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn handle_text(
    state: &AppState,
    conn: &mut ConnState,
    handle: &ClientHandle,
    text: &str,
) -> ControlFlow<()> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(m) => m,
        Err(e) => {
            log::debug!("[WS] Dropping unparseable frame: {}", e);
            return ControlFlow::Continue(());
        }
    };

    // UNIDENTIFIED connections may only create or join; JOINED connections
    // may do anything but that.
    let is_entry = matches!(
        message,
        ClientMessage::CreateRoom { .. } | ClientMessage::JoinRoom { .. }
    );
    if conn.room_id.is_none() && !is_entry {
        log::debug!("[WS] Ignoring message before join");
        return ControlFlow::Continue(());
    }
    if conn.room_id.is_some() && is_entry {
        log::debug!("[WS] Ignoring re-join on an identified connection");
        return ControlFlow::Continue(());
    }

    match message {
        ClientMessage::CreateRoom { custom_id } => {
            handle_create_room(state, conn, handle, custom_id.as_deref())
        }
        ClientMessage::JoinRoom { room_id, role } => {
            handle_join_room(state, conn, handle, &room_id, &role)
        }
        ClientMessage::Ready => handle_ready(state, conn, handle),
        ClientMessage::Offer { sdp, receiver_id } => handle_offer(state, conn, sdp, &receiver_id),
        ClientMessage::Answer { sdp } => handle_answer(state, conn, sdp),
        ClientMessage::Candidate {
            candidate,
            receiver_id,
        } => handle_candidate(state, conn, candidate, receiver_id),
        ClientMessage::StartRelay => handle_start_relay(state, conn, handle),
        ClientMessage::Metadata { text, cover } => {
            handle_metadata(state, conn, &text, cover.as_deref())
        }
        ClientMessage::AddTrack { payload } => handle_add_track(state, conn, handle, payload),
        ClientMessage::Chat { name, text } => handle_chat(state, conn, &name, &text),
        ClientMessage::Leave => {
            disconnect(state, conn);
            return ControlFlow::Break(());
        }
        ClientMessage::Stats { data } => {
            if let Some(room_id) = &conn.room_id {
                state.registry.log_stats(room_id, conn.role, &data);
            }
        }
        ClientMessage::RelayDiag { data } => {
            log::debug!("[WS] relay-diag from {:?}: {}", conn.room_id, data);
        }
    }
    ControlFlow::Continue(())
}

fn handle_create_room(
    state: &AppState,
    conn: &mut ConnState,
    handle: &ClientHandle,
    custom_id: Option<&str>,
) {
    if !conn.authed {
        handle.send(&ServerMessage::error(SignalCode::AuthRequired));
        return;
    }
    let room_id = match state.registry.create(custom_id) {
        Ok(id) => id,
        Err(code) => {
            handle.send(&ServerMessage::error(code));
            return;
        }
    };
    if let Err(code) = state
        .registry
        .join(&room_id, Role::Broadcaster, handle.clone())
    {
        handle.send(&ServerMessage::error(code));
        return;
    }
    conn.room_id = Some(room_id.clone());
    conn.role = Some(Role::Broadcaster);

    handle.send(&ServerMessage::RoomCreated {
        room_id: room_id.clone(),
    });
    handle.send(&ServerMessage::Joined {
        room_id: room_id.clone(),
        role: Role::Broadcaster,
    });
    handle.send(&ServerMessage::ListenerCount {
        count: state.registry.list_receiver_ids(&room_id).len(),
    });
}

fn handle_join_room(
    state: &AppState,
    conn: &mut ConnState,
    handle: &ClientHandle,
    room_id: &str,
    role: &str,
) {
    let role = match role {
        "broadcaster" => Role::Broadcaster,
        "receiver" => Role::Receiver,
        _ => {
            handle.send(&ServerMessage::error(SignalCode::InvalidRole));
            return;
        }
    };
    if role == Role::Broadcaster && !conn.authed {
        handle.send(&ServerMessage::error(SignalCode::AuthRequired));
        return;
    }

    let receiver_id = match state.registry.join(room_id, role, handle.clone()) {
        Ok(id) => id,
        Err(code) => {
            handle.send(&ServerMessage::error(code));
            return;
        }
    };
    conn.room_id = Some(room_id.to_string());
    conn.role = Some(role);
    conn.receiver_id = receiver_id.clone();

    handle.send(&ServerMessage::Joined {
        room_id: room_id.to_string(),
        role,
    });

    match role {
        Role::Broadcaster => {
            // Rejoin: reintroduce the broadcaster and its receivers to each
            // other, then report the audience size.
            for (rid, receiver) in state.registry.list_receivers(room_id) {
                receiver.send(&ServerMessage::PeerJoined {
                    role: Role::Broadcaster,
                    receiver_id: None,
                });
                handle.send(&ServerMessage::PeerJoined {
                    role: Role::Receiver,
                    receiver_id: Some(rid),
                });
            }
            handle.send(&ServerMessage::ListenerCount {
                count: state.registry.list_receiver_ids(room_id).len(),
            });
        }
        Role::Receiver => {
            if let Some(broadcaster) = state.registry.get_broadcaster(room_id) {
                handle.send(&ServerMessage::PeerJoined {
                    role: Role::Broadcaster,
                    receiver_id: None,
                });
                broadcaster.send(&ServerMessage::PeerJoined {
                    role: Role::Receiver,
                    receiver_id: receiver_id.clone(),
                });
                broadcaster.send(&ServerMessage::ListenerCount {
                    count: state.registry.list_receiver_ids(room_id).len(),
                });
            }

            // Bring the newcomer up to date with the room state.
            if let Some((text, cover)) = state.registry.get_metadata(room_id) {
                if !text.is_empty() || cover.is_some() {
                    handle.send(&ServerMessage::Metadata { text, cover });
                }
            }
            let tracks = state.registry.get_track_list(room_id);
            if !tracks.is_empty() {
                handle.send(&ServerMessage::TrackList { tracks });
            }
            let messages = state.registry.get_chat_history(room_id);
            if !messages.is_empty() {
                handle.send(&ServerMessage::ChatHistory { messages });
            }
            if let Some(info) = state.registry.get_integration_info(room_id) {
                if let Some(url) = info.listener_url.or(info.local_stream_url) {
                    handle.send(&ServerMessage::StreamUrl { url });
                }
            }
        }
    }
}

fn handle_ready(state: &AppState, conn: &mut ConnState, handle: &ClientHandle) {
    if conn.role != Some(Role::Broadcaster) {
        return;
    }
    let Some(room_id) = &conn.room_id else { return };
    for rid in state.registry.list_receiver_ids(room_id) {
        handle.send(&ServerMessage::PeerJoined {
            role: Role::Receiver,
            receiver_id: Some(rid),
        });
    }
}

fn handle_offer(state: &AppState, conn: &mut ConnState, sdp: SdpPayload, receiver_id: &str) {
    if conn.role != Some(Role::Broadcaster) || sdp.sdp.len() > MAX_SDP_LEN {
        return;
    }
    let Some(room_id) = &conn.room_id else { return };
    if let Some(receiver) = state.registry.get_receiver(room_id, receiver_id) {
        receiver.send(&ServerMessage::Offer { sdp });
    }
}

fn handle_answer(state: &AppState, conn: &mut ConnState, sdp: SdpPayload) {
    if conn.role != Some(Role::Receiver) || sdp.sdp.len() > MAX_SDP_LEN {
        return;
    }
    let (Some(room_id), Some(receiver_id)) = (&conn.room_id, &conn.receiver_id) else {
        return;
    };
    if let Some(broadcaster) = state.registry.get_broadcaster(room_id) {
        broadcaster.send(&ServerMessage::Answer {
            sdp,
            receiver_id: receiver_id.clone(),
        });
    }
}

fn handle_candidate(
    state: &AppState,
    conn: &mut ConnState,
    candidate: Value,
    receiver_id: Option<String>,
) {
    let serialized_len = serde_json::to_string(&candidate).map(|s| s.len()).unwrap_or(usize::MAX);
    if serialized_len > MAX_CANDIDATE_LEN {
        return;
    }
    let Some(room_id) = &conn.room_id else { return };
    match conn.role {
        Some(Role::Broadcaster) => {
            let Some(target) = receiver_id else { return };
            if let Some(receiver) = state.registry.get_receiver(room_id, &target) {
                receiver.send(&ServerMessage::Candidate {
                    candidate,
                    receiver_id: None,
                });
            }
        }
        Some(Role::Receiver) => {
            if let Some(broadcaster) = state.registry.get_broadcaster(room_id) {
                broadcaster.send(&ServerMessage::Candidate {
                    candidate,
                    receiver_id: conn.receiver_id.clone(),
                });
            }
        }
        None => {}
    }
}

fn handle_start_relay(state: &AppState, conn: &mut ConnState, handle: &ClientHandle) {
    if conn.role != Some(Role::Broadcaster) {
        handle.send(&ServerMessage::error(SignalCode::AuthRequired));
        return;
    }
    let Some(room_id) = conn.room_id.clone() else { return };
    let url = format!("{}/stream/{}", conn.public_base, room_id);
    state.registry.set_local_stream_url(&room_id, &url);

    for (_, receiver) in state.registry.list_receivers(&room_id) {
        receiver.send(&ServerMessage::StreamUrl { url: url.clone() });
    }
    handle.send(&ServerMessage::RelayStarted { url });
    log::info!("[WS] Relay started for {}", room_id);
}

fn handle_metadata(state: &AppState, conn: &mut ConnState, text: &str, cover: Option<&str>) {
    if conn.role != Some(Role::Broadcaster) {
        return;
    }
    let Some(room_id) = &conn.room_id else { return };
    let text = clamp(text, MAX_METADATA_TEXT);
    let cover = cover.map(|c| clamp(c, MAX_COVER_URL));

    state.registry.set_metadata(room_id, &text, cover.as_deref());
    for (_, receiver) in state.registry.list_receivers(room_id) {
        receiver.send(&ServerMessage::Metadata {
            text: text.clone(),
            cover: cover.clone(),
        });
    }
    state.registry.set_icy_title(room_id, &text);
}

fn handle_add_track(
    state: &AppState,
    conn: &mut ConnState,
    handle: &ClientHandle,
    payload: TrackPayload,
) {
    if conn.role != Some(Role::Broadcaster) || payload.text.is_empty() {
        return;
    }
    let Some(room_id) = conn.room_id.clone() else { return };

    let clamp_opt = |v: &Option<String>| v.as_deref().map(|s| clamp(s, MAX_TRACK_FIELD));
    let text = clamp(&payload.text, MAX_TRACK_FIELD);
    let track = Track {
        title: text.clone(),
        time: now_millis(),
        artist: clamp_opt(&payload.artist),
        album: clamp_opt(&payload.album),
        duration_sec: payload.duration_sec,
        release_date: clamp_opt(&payload.release_date),
        isrc: clamp_opt(&payload.isrc),
        bpm: payload.bpm,
        track_pos: payload.track_pos,
        disc_num: payload.disc_num,
        explicit: payload.explicit,
        contributors: payload
            .contributors
            .as_ref()
            .map(|c| c.iter().map(|s| clamp(s, MAX_TRACK_FIELD)).collect()),
        label: clamp_opt(&payload.label),
        genres: payload
            .genres
            .as_ref()
            .map(|g| g.iter().map(|s| clamp(s, MAX_TRACK_FIELD)).collect()),
        cover: clamp_opt(&payload.cover),
        cover_medium: clamp_opt(&payload.cover_medium),
    };

    // Monotone-title de-dup: a repeated commit changes nothing and
    // broadcasts nothing.
    if !state.registry.add_track(&room_id, track) {
        log::debug!("[WS] Duplicate track commit ignored: {}", text);
        return;
    }

    let cover = payload
        .cover_medium
        .as_deref()
        .or(payload.cover.as_deref())
        .map(|c| clamp(c, MAX_COVER_URL));
    state
        .registry
        .set_metadata(&room_id, &clamp(&text, MAX_METADATA_TEXT), cover.as_deref());

    // Snapshot ordering: track-list, then metadata, then the ICY title.
    let tracks = state.registry.get_track_list(&room_id);
    let metadata_text = clamp(&text, MAX_METADATA_TEXT);
    let recipients: Vec<ClientHandle> = state
        .registry
        .list_receivers(&room_id)
        .into_iter()
        .map(|(_, h)| h)
        .collect();
    for peer in recipients.iter().chain(std::iter::once(handle)) {
        peer.send(&ServerMessage::TrackList {
            tracks: tracks.clone(),
        });
    }
    for peer in recipients.iter().chain(std::iter::once(handle)) {
        peer.send(&ServerMessage::Metadata {
            text: metadata_text.clone(),
            cover: cover.clone(),
        });
    }

    let icy_title = compose_icy_title(
        payload.artist.as_deref(),
        payload.title.as_deref(),
        payload.album.as_deref(),
        payload.release_date.as_deref(),
        &text,
    );
    state.registry.set_icy_title(&room_id, &icy_title);

    // Push the title to the external server too, off the signaling path.
    if let Some(info) = state.registry.get_integration_info(&room_id) {
        if let (Some(kind), Some(credentials)) = (info.kind, info.credentials) {
            let client = state.http_client.clone();
            tokio::spawn(async move {
                source_client::metadata::push_title(&client, kind, &credentials, &icy_title).await;
            });
        }
    }
}

fn handle_chat(state: &AppState, conn: &mut ConnState, name: &str, text: &str) {
    let name_len = name.chars().count();
    let text_len = text.chars().count();
    if name_len == 0 || name_len > MAX_CHAT_NAME || text_len == 0 || text_len > MAX_CHAT_TEXT {
        return;
    }
    let now = Instant::now();
    if conn
        .last_chat
        .is_some_and(|t| now.duration_since(t) < Duration::from_millis(CHAT_MIN_INTERVAL_MS))
    {
        return;
    }
    conn.last_chat = Some(now);

    let Some(room_id) = conn.room_id.clone() else { return };
    let participant_id = match (conn.role, &conn.receiver_id) {
        (Some(Role::Broadcaster), _) => BROADCASTER_PARTICIPANT.to_string(),
        (Some(Role::Receiver), Some(rid)) => rid.clone(),
        _ => return,
    };

    // Everyone with a signaling connection to the room.
    let broadcaster = state.registry.get_broadcaster(&room_id);
    let receivers = state.registry.list_receivers(&room_id);

    // First message from this participant announces them to the whole room,
    // sender included. Stored before any broadcast.
    if state
        .registry
        .add_chat_participant(&room_id, &participant_id, name)
    {
        let joined = ChatMessage {
            name: String::new(),
            text: format!("{} has joined the chat", name),
            time: now_millis(),
            system: true,
        };
        state.registry.add_chat(&room_id, joined.clone());
        if let Some(b) = &broadcaster {
            b.send(&ServerMessage::Chat {
                message: joined.clone(),
            });
        }
        for (_, receiver) in &receivers {
            receiver.send(&ServerMessage::Chat {
                message: joined.clone(),
            });
        }
    }

    let message = ChatMessage {
        name: name.to_string(),
        text: text.to_string(),
        time: now_millis(),
        system: false,
    };
    state.registry.add_chat(&room_id, message.clone());

    // Broadcast to everyone except the sender.
    let sender_is_broadcaster = conn.role == Some(Role::Broadcaster);
    if let Some(b) = &broadcaster {
        if !sender_is_broadcaster {
            b.send(&ServerMessage::Chat {
                message: message.clone(),
            });
        }
    }
    for (rid, receiver) in &receivers {
        if Some(rid) == conn.receiver_id.as_ref() {
            continue;
        }
        receiver.send(&ServerMessage::Chat {
            message: message.clone(),
        });
    }
}

fn handle_binary(state: &AppState, conn: &mut ConnState, data: Bytes) {
    if conn.role != Some(Role::Broadcaster) {
        return;
    }
    let Some(room_id) = &conn.room_id else { return };
    conn.binary_frames += 1;
    let bin = state
        .config
        .transcoder_bin
        .as_deref()
        .filter(|b| !b.is_empty());
    state.registry.ingest_frame(room_id, data, bin);
}

/// Shared teardown for `leave`, close, and transport errors.
pub(crate) fn disconnect(state: &AppState, conn: &mut ConnState) {
    let Some(room_id) = conn.room_id.take() else { return };
    let role = conn.role.take();
    let receiver_id = conn.receiver_id.take();

    match role {
        Some(Role::Broadcaster) => {
            state.registry.stop_transcoder(&room_id);
            for (_, receiver) in state.registry.list_receivers(&room_id) {
                receiver.send(&ServerMessage::PeerLeft {
                    role: Role::Broadcaster,
                    receiver_id: None,
                });
            }
            emit_left_chat(state, &room_id, BROADCASTER_PARTICIPANT);
            state.registry.end_relay_listeners(&room_id);
            state.registry.leave(&room_id, Role::Broadcaster, None);
            log::info!("[WS] Broadcaster disconnected from {}", room_id);
        }
        Some(Role::Receiver) => {
            if let Some(broadcaster) = state.registry.get_broadcaster(&room_id) {
                broadcaster.send(&ServerMessage::PeerLeft {
                    role: Role::Receiver,
                    receiver_id: receiver_id.clone(),
                });
            }
            if let Some(rid) = &receiver_id {
                emit_left_chat(state, &room_id, rid);
            }
            state
                .registry
                .leave(&room_id, Role::Receiver, receiver_id.as_deref());
            if let Some(broadcaster) = state.registry.get_broadcaster(&room_id) {
                broadcaster.send(&ServerMessage::ListenerCount {
                    count: state.registry.list_receiver_ids(&room_id).len(),
                });
            }
        }
        None => {}
    }
}

/// Stores and broadcasts the departure system message, only for participants
/// who had actually joined the chat. The leaver itself is skipped.
fn emit_left_chat(state: &AppState, room_id: &str, participant_id: &str) {
    let Some(name) = state.registry.remove_chat_participant(room_id, participant_id) else {
        return;
    };
    let message = ChatMessage {
        name: String::new(),
        text: format!("{} has left the chat", name),
        time: now_millis(),
        system: true,
    };
    state.registry.add_chat(room_id, message.clone());
    if participant_id != BROADCASTER_PARTICIPANT {
        if let Some(b) = state.registry.get_broadcaster(room_id) {
            b.send(&ServerMessage::Chat {
                message: message.clone(),
            });
        }
    }
    for (rid, receiver) in state.registry.list_receivers(room_id) {
        if rid == participant_id {
            continue;
        }
        receiver.send(&ServerMessage::Chat {
            message: message.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AppState;
    use crate::config::Config;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_state() -> AppState {
        let dir = tempfile::tempdir().unwrap().into_path();
        let mut config = Config::default();
        config.session_secret = Some("secret".into());
        config.transcoder_bin = None;
        config.slug_history_path = dir.join("slugs.json");
        AppState::build(config)
    }

    struct Peer {
        conn: ConnState,
        handle: ClientHandle,
        rx: UnboundedReceiver<Message>,
    }

    fn peer(authed: bool) -> Peer {
        let (tx, rx) = mpsc::unbounded_channel();
        Peer {
            conn: ConnState::new(authed, "http://cast.example".into()),
            handle: ClientHandle::new(tx),
            rx,
        }
    }

    fn recv_json(rx: &mut UnboundedReceiver<Message>) -> Value {
        match rx.try_recv().expect("expected a frame") {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    fn drain_types(rx: &mut UnboundedReceiver<Message>) -> Vec<String> {
        let mut types = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            let v: Value = serde_json::from_str(&text).unwrap();
            types.push(v["type"].as_str().unwrap().to_string());
        }
        types
    }

    fn send(state: &AppState, p: &mut Peer, json: Value) {
        assert!(handle_text(state, &mut p.conn, &p.handle, &json.to_string()).is_continue());
    }

    #[tokio::test]
    async fn create_room_then_two_receivers_sequences_listener_counts() {
        let state = test_state();
        let mut b = peer(true);

        send(&state, &mut b, serde_json::json!({"type": "create-room"}));
        let created = recv_json(&mut b.rx);
        assert_eq!(created["type"], "room-created");
        let room_id = created["roomId"].as_str().unwrap().to_string();
        assert_eq!(room_id.len(), 7);
        let joined = recv_json(&mut b.rx);
        assert_eq!(joined["type"], "joined");
        assert_eq!(joined["role"], "broadcaster");
        let count = recv_json(&mut b.rx);
        assert_eq!(count["type"], "listener-count");
        assert_eq!(count["count"], 0);

        let mut r1 = peer(false);
        send(
            &state,
            &mut r1,
            serde_json::json!({"type": "join-room", "roomId": room_id, "role": "receiver"}),
        );
        let j = recv_json(&mut r1.rx);
        assert_eq!(j["type"], "joined");
        assert_eq!(j["role"], "receiver");
        let pj = recv_json(&mut r1.rx);
        assert_eq!(pj["type"], "peer-joined");
        assert_eq!(pj["role"], "broadcaster");

        let pj = recv_json(&mut b.rx);
        assert_eq!(pj["type"], "peer-joined");
        assert_eq!(pj["role"], "receiver");
        assert!(pj["receiverId"].is_string());
        let count = recv_json(&mut b.rx);
        assert_eq!(count["count"], 1);

        let mut r2 = peer(false);
        send(
            &state,
            &mut r2,
            serde_json::json!({"type": "join-room", "roomId": room_id, "role": "receiver"}),
        );
        let _ = drain_types(&mut r2.rx);
        let types = drain_types(&mut b.rx);
        assert_eq!(types, vec!["peer-joined", "listener-count"]);
    }

    #[tokio::test]
    async fn unauthenticated_create_room_is_refused() {
        let state = test_state();
        let mut b = peer(false);
        send(&state, &mut b, serde_json::json!({"type": "create-room"}));
        let err = recv_json(&mut b.rx);
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "AUTH_REQUIRED");
        assert!(b.conn.room_id.is_none());
    }

    #[tokio::test]
    async fn fifth_receiver_gets_room_full() {
        let state = test_state();
        let mut b = peer(true);
        send(&state, &mut b, serde_json::json!({"type": "create-room"}));
        let room_id = recv_json(&mut b.rx)["roomId"].as_str().unwrap().to_string();

        let mut receivers = Vec::new();
        for _ in 0..4 {
            let mut r = peer(false);
            send(
                &state,
                &mut r,
                serde_json::json!({"type": "join-room", "roomId": room_id, "role": "receiver"}),
            );
            assert_eq!(recv_json(&mut r.rx)["type"], "joined");
            receivers.push(r);
        }
        let mut fifth = peer(false);
        send(
            &state,
            &mut fifth,
            serde_json::json!({"type": "join-room", "roomId": room_id, "role": "receiver"}),
        );
        let err = recv_json(&mut fifth.rx);
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "ROOM_FULL");
    }

    #[tokio::test]
    async fn second_broadcaster_gets_occupied() {
        let state = test_state();
        let mut b = peer(true);
        send(&state, &mut b, serde_json::json!({"type": "create-room"}));
        let room_id = recv_json(&mut b.rx)["roomId"].as_str().unwrap().to_string();

        let mut intruder = peer(true);
        send(
            &state,
            &mut intruder,
            serde_json::json!({"type": "join-room", "roomId": room_id, "role": "broadcaster"}),
        );
        let err = recv_json(&mut intruder.rx);
        assert_eq!(err["code"], "BROADCASTER_OCCUPIED");
    }

    #[tokio::test]
    async fn add_track_broadcasts_list_then_metadata_and_dedupes() {
        let state = test_state();
        let mut b = peer(true);
        send(&state, &mut b, serde_json::json!({"type": "create-room"}));
        let room_id = recv_json(&mut b.rx)["roomId"].as_str().unwrap().to_string();
        let mut r = peer(false);
        send(
            &state,
            &mut r,
            serde_json::json!({"type": "join-room", "roomId": room_id, "role": "receiver"}),
        );
        let _ = drain_types(&mut r.rx);
        let _ = drain_types(&mut b.rx);

        send(
            &state,
            &mut b,
            serde_json::json!({
                "type": "add-track",
                "text": "The Cure — Lullaby",
                "artist": "The Cure",
                "title": "Lullaby",
                "album": "Disintegration",
                "releaseDate": "1989-05-02"
            }),
        );

        let list = recv_json(&mut r.rx);
        assert_eq!(list["type"], "track-list");
        assert_eq!(list["tracks"][0]["title"], "The Cure — Lullaby");
        let meta = recv_json(&mut r.rx);
        assert_eq!(meta["type"], "metadata");
        assert_eq!(meta["text"], "The Cure — Lullaby");
        // The broadcaster hears its own commit too.
        assert_eq!(drain_types(&mut b.rx), vec!["track-list", "metadata"]);

        // Duplicate commit: nothing further is broadcast.
        send(
            &state,
            &mut b,
            serde_json::json!({"type": "add-track", "text": "The Cure — Lullaby"}),
        );
        assert!(drain_types(&mut r.rx).is_empty());
        assert_eq!(state.registry.get_track_list(&room_id).len(), 1);
    }

    #[tokio::test]
    async fn first_chat_emits_join_system_message_to_everyone() {
        let state = test_state();
        let mut b = peer(true);
        send(&state, &mut b, serde_json::json!({"type": "create-room"}));
        let room_id = recv_json(&mut b.rx)["roomId"].as_str().unwrap().to_string();
        let mut r1 = peer(false);
        send(
            &state,
            &mut r1,
            serde_json::json!({"type": "join-room", "roomId": room_id, "role": "receiver"}),
        );
        let _ = drain_types(&mut b.rx);
        let _ = drain_types(&mut r1.rx);

        send(
            &state,
            &mut r1,
            serde_json::json!({"type": "chat", "name": "Ada", "text": "hi"}),
        );

        // Sender sees only the system announcement; the broadcaster sees the
        // announcement followed by the message itself.
        let sys = recv_json(&mut r1.rx);
        assert_eq!(sys["system"], true);
        assert_eq!(sys["text"], "Ada has joined the chat");
        assert!(r1.rx.try_recv().is_err());

        let sys = recv_json(&mut b.rx);
        assert_eq!(sys["system"], true);
        let chat = recv_json(&mut b.rx);
        assert_eq!(chat["type"], "chat");
        assert_eq!(chat["name"], "Ada");
        assert_eq!(chat["text"], "hi");

        // History holds both, system message first.
        let history = state.registry.get_chat_history(&room_id);
        assert_eq!(history.len(), 2);
        assert!(history[0].system);
        assert!(!history[1].system);
    }

    #[tokio::test]
    async fn chat_rate_limit_drops_rapid_messages() {
        let state = test_state();
        let mut b = peer(true);
        send(&state, &mut b, serde_json::json!({"type": "create-room"}));
        let room_id = recv_json(&mut b.rx)["roomId"].as_str().unwrap().to_string();
        let _ = drain_types(&mut b.rx);

        send(
            &state,
            &mut b,
            serde_json::json!({"type": "chat", "name": "DJ", "text": "one"}),
        );
        send(
            &state,
            &mut b,
            serde_json::json!({"type": "chat", "name": "DJ", "text": "two"}),
        );
        // Join announcement + "one" stored; "two" dropped by the 1s limit.
        let history = state.registry.get_chat_history(&room_id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].text, "one");

        // Oversized and empty messages never land either.
        b.conn.last_chat = None;
        send(
            &state,
            &mut b,
            serde_json::json!({"type": "chat", "name": "DJ", "text": "x".repeat(281)}),
        );
        send(
            &state,
            &mut b,
            serde_json::json!({"type": "chat", "name": "DJ", "text": ""}),
        );
        assert_eq!(state.registry.get_chat_history(&room_id).len(), 2);
    }

    #[tokio::test]
    async fn offer_and_answer_route_between_roles() {
        let state = test_state();
        let mut b = peer(true);
        send(&state, &mut b, serde_json::json!({"type": "create-room"}));
        let room_id = recv_json(&mut b.rx)["roomId"].as_str().unwrap().to_string();
        let mut r = peer(false);
        send(
            &state,
            &mut r,
            serde_json::json!({"type": "join-room", "roomId": room_id, "role": "receiver"}),
        );
        let _ = drain_types(&mut r.rx);
        let peer_joined = drain_types(&mut b.rx);
        assert!(peer_joined.contains(&"peer-joined".to_string()));
        let rid = r.conn.receiver_id.clone().unwrap();

        send(
            &state,
            &mut b,
            serde_json::json!({
                "type": "offer",
                "receiverId": rid,
                "sdp": {"type": "offer", "sdp": "v=0..."}
            }),
        );
        let offer = recv_json(&mut r.rx);
        assert_eq!(offer["type"], "offer");
        assert_eq!(offer["sdp"]["sdp"], "v=0...");

        send(
            &state,
            &mut r,
            serde_json::json!({"type": "answer", "sdp": {"type": "answer", "sdp": "v=0..."}}),
        );
        let answer = recv_json(&mut b.rx);
        assert_eq!(answer["type"], "answer");
        assert_eq!(answer["receiverId"], rid);

        // Oversized SDP is dropped silently.
        send(
            &state,
            &mut b,
            serde_json::json!({
                "type": "offer",
                "receiverId": rid,
                "sdp": {"type": "offer", "sdp": "x".repeat(MAX_SDP_LEN + 1)}
            }),
        );
        assert!(r.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_relay_is_broadcaster_only_and_publishes_url() {
        let state = test_state();
        let mut b = peer(true);
        send(&state, &mut b, serde_json::json!({"type": "create-room"}));
        let room_id = recv_json(&mut b.rx)["roomId"].as_str().unwrap().to_string();
        let _ = drain_types(&mut b.rx);
        let mut r = peer(false);
        send(
            &state,
            &mut r,
            serde_json::json!({"type": "join-room", "roomId": room_id, "role": "receiver"}),
        );
        let _ = drain_types(&mut r.rx);
        let _ = drain_types(&mut b.rx);

        send(&state, &mut r, serde_json::json!({"type": "start-relay"}));
        assert_eq!(recv_json(&mut r.rx)["code"], "AUTH_REQUIRED");

        send(&state, &mut b, serde_json::json!({"type": "start-relay"}));
        let expected = format!("http://cast.example/stream/{}", room_id);
        let ack = recv_json(&mut b.rx);
        assert_eq!(ack["type"], "relay-started");
        assert_eq!(ack["url"], expected);
        let pushed = recv_json(&mut r.rx);
        assert_eq!(pushed["type"], "stream-url");
        assert_eq!(pushed["url"], expected);
    }

    #[tokio::test]
    async fn broadcaster_disconnect_ends_relay_listeners_and_notifies() {
        let state = test_state();
        let mut b = peer(true);
        send(&state, &mut b, serde_json::json!({"type": "create-room"}));
        let room_id = recv_json(&mut b.rx)["roomId"].as_str().unwrap().to_string();
        let mut r = peer(false);
        send(
            &state,
            &mut r,
            serde_json::json!({"type": "join-room", "roomId": room_id, "role": "receiver"}),
        );
        let _ = drain_types(&mut r.rx);

        let (writer, _body) = crate::stream::IcyWriter::channel(false, "");
        assert!(state.registry.add_relay_listener(&room_id, writer.clone()));

        disconnect(&state, &mut b.conn);

        assert!(writer.is_dead());
        let types = drain_types(&mut r.rx);
        assert!(types.contains(&"peer-left".to_string()));
        // Room lives on in its ended state for the TTL window.
        assert!(state.registry.room_exists(&room_id));
        assert!(state.registry.get_broadcaster(&room_id).is_none());
    }

    #[tokio::test]
    async fn messages_before_join_are_ignored() {
        let state = test_state();
        let mut stray = peer(true);
        send(
            &state,
            &mut stray,
            serde_json::json!({"type": "chat", "name": "x", "text": "y"}),
        );
        send(
            &state,
            &mut stray,
            serde_json::json!({"type": "metadata", "text": "t"}),
        );
        assert!(stray.rx.try_recv().is_err());

        // Malformed JSON and unknown types are silently dropped too.
        assert!(handle_text(&state, &mut stray.conn, &stray.handle, "{not json").is_continue());
        send(&state, &mut stray, serde_json::json!({"type": "mystery"}));
        assert!(stray.rx.try_recv().is_err());
    }

    #[test]
    fn public_base_url_prefers_forwarded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "internal:8080".parse().unwrap());
        assert_eq!(public_base_url(&headers, 8080), "http://internal:8080");

        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        headers.insert("x-forwarded-host", "cast.example".parse().unwrap());
        assert_eq!(public_base_url(&headers, 8080), "https://cast.example");

        assert_eq!(public_base_url(&HeaderMap::new(), 9000), "http://localhost:9000");
    }
}
