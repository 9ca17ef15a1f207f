//! Broadcast room entities.
//!
//! A room is one broadcast session: at most one live broadcaster, up to four
//! receivers, the accumulated chat and track state, and the relay plumbing
//! (header bytes, transcoder handle, attached HTTP listeners). All mutation
//! goes through [`registry::RoomRegistry`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::Message;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::protocol_constants::{MAX_CHAT_HISTORY, MAX_TRACK_LIST};
use crate::source_client::{SourceCredentials, SourceKind};
use crate::stream::icy::IcyWriter;
use crate::stream::transcoder::Transcoder;

pub mod registry;
pub mod slug_store;

pub use registry::RoomRegistry;
pub use slug_store::SlugStore;

/// Participant role on a signaling connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Broadcaster,
    Receiver,
}

/// Handle to a signaling connection's outbound queue.
///
/// Sends are synchronous (unbounded channel) so registry mutations never
/// suspend while holding room state; a dedicated writer task per connection
/// drains the queue, which totally orders writes on that connection.
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl ClientHandle {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    /// Serializes `msg` and queues it as a text frame. Returns `false` when
    /// the connection is gone.
    pub fn send<T: Serialize>(&self, msg: &T) -> bool {
        match serde_json::to_string(msg) {
            Ok(json) => self.tx.send(Message::Text(json.into())).is_ok(),
            Err(e) => {
                log::warn!("[Room] Failed to serialize outbound message: {}", e);
                false
            }
        }
    }

    /// Queues a raw frame (ping/close) on the connection.
    pub fn send_raw(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// True while the connection's writer task is still draining.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// The current "now playing" state of a room.
#[derive(Debug, Clone, Default)]
pub struct RoomMetadata {
    pub text: String,
    pub cover_url: Option<String>,
}

/// One committed track entry.
///
/// All optional fields arrive from the broadcaster's catalog lookup and are
/// length-clamped before storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub title: String,
    /// Unix milliseconds at commit time.
    pub time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isrc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpm: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_pos: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disc_num: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genres: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_medium: Option<String>,
}

/// Composes an ICY stream title: `"{artist} - {title} [{album} · {year}]"`
/// when artist and title are both known, otherwise the raw commit text.
#[must_use]
pub fn compose_icy_title(
    artist: Option<&str>,
    title: Option<&str>,
    album: Option<&str>,
    release_date: Option<&str>,
    fallback: &str,
) -> String {
    let (Some(artist), Some(title)) = (artist, title) else {
        return fallback.to_string();
    };
    if artist.is_empty() || title.is_empty() {
        return fallback.to_string();
    }
    let mut composed = format!("{} - {}", artist, title);
    if let Some(album) = album.filter(|a| !a.is_empty()) {
        let year = release_date
            .and_then(|d| d.get(0..4))
            .filter(|y| y.chars().all(|c| c.is_ascii_digit()));
        match year {
            Some(y) => composed.push_str(&format!(" [{} · {}]", album, y)),
            None => composed.push_str(&format!(" [{}]", album)),
        }
    }
    composed
}

/// One chat entry, user-authored or system-generated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub name: String,
    pub text: String,
    /// Unix milliseconds.
    pub time: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub system: bool,
}

/// A participant currently present in the room chat.
#[derive(Debug, Clone)]
pub struct ChatParticipant {
    pub display_name: String,
}

/// External streaming server configured on a room.
///
/// `kind`/`credentials` are set by the external-relay handshake;
/// `local_stream_url` alone means the room only announced its own relay
/// endpoint via `start-relay`.
#[derive(Debug, Clone, Default)]
pub struct IntegrationInfo {
    pub kind: Option<SourceKind>,
    pub credentials: Option<SourceCredentials>,
    pub listener_url: Option<String>,
    pub local_stream_url: Option<String>,
}

/// Authoritative state of one broadcast session.
pub struct Room {
    pub id: String,
    pub broadcaster: Option<ClientHandle>,
    pub receivers: HashMap<String, ClientHandle>,
    pub metadata: RoomMetadata,
    /// Newest first, capped at [`MAX_TRACK_LIST`].
    pub track_list: VecDeque<Track>,
    /// Oldest first, capped at [`MAX_CHAT_HISTORY`].
    pub chat_history: VecDeque<ChatMessage>,
    pub chat_participants: HashMap<String, ChatParticipant>,
    pub integration: Option<IntegrationInfo>,
    /// First ingested frame (container init segment) replayed to
    /// late-joining passthrough listeners.
    pub relay_header: Option<Bytes>,
    pub transcoder: Option<Arc<Transcoder>>,
    pub relay_listeners: Vec<Arc<IcyWriter>>,
    /// Unix milliseconds.
    pub created_at: u64,
    /// Set when the broadcaster departs; cleared on rejoin.
    pub ended_at: Option<Instant>,
}

impl Room {
    pub fn new(id: String) -> Self {
        Self {
            id,
            broadcaster: None,
            receivers: HashMap::new(),
            metadata: RoomMetadata::default(),
            track_list: VecDeque::new(),
            chat_history: VecDeque::new(),
            chat_participants: HashMap::new(),
            integration: None,
            relay_header: None,
            transcoder: None,
            relay_listeners: Vec::new(),
            created_at: crate::session::now_millis(),
            ended_at: None,
        }
    }

    /// The broadcaster handle, only while its connection is open.
    #[must_use]
    pub fn live_broadcaster(&self) -> Option<&ClientHandle> {
        self.broadcaster.as_ref().filter(|h| h.is_open())
    }

    /// Receiver ids whose connections are open.
    #[must_use]
    pub fn live_receiver_ids(&self) -> Vec<String> {
        self.receivers
            .iter()
            .filter(|(_, h)| h.is_open())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Appends a track unless it repeats the most recent title.
    /// Returns `false` on the duplicate no-op.
    pub fn push_track(&mut self, track: Track) -> bool {
        if self.track_list.front().is_some_and(|t| t.title == track.title) {
            return false;
        }
        self.track_list.push_front(track);
        self.track_list.truncate(MAX_TRACK_LIST);
        true
    }

    /// Appends a chat message, discarding the oldest beyond the cap.
    pub fn push_chat(&mut self, message: ChatMessage) {
        self.chat_history.push_back(message);
        while self.chat_history.len() > MAX_CHAT_HISTORY {
            self.chat_history.pop_front();
        }
    }

    /// A room qualifies for immediate destruction when nothing remains that
    /// would make a rejoin or replay meaningful.
    #[must_use]
    pub fn is_reclaimable(&self) -> bool {
        self.broadcaster.is_none()
            && self.receivers.is_empty()
            && self.ended_at.is_none()
            && self.track_list.is_empty()
            && self.chat_history.is_empty()
    }
}
