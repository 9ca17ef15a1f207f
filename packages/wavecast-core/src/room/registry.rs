//! In-memory room catalog.
//!
//! Rooms live in a [`DashMap`]; every mutation runs under the map-shard lock
//! with no awaits inside, which serializes all mutations of one room.
//! Outbound sends to connections are synchronous unbounded-channel pushes, so
//! holding the shard lock across them is safe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;

use crate::error::SignalCode;
use crate::protocol_constants::{
    MAX_COVER_URL, MAX_METADATA_TEXT, MAX_RECEIVERS, ROOM_SWEEP_INTERVAL_SECS, ROOM_TTL_SECS,
};
use crate::room::slug_store::{is_valid_slug, SlugStore};
use crate::room::{ChatMessage, ChatParticipant, ClientHandle, IntegrationInfo, Role, Room, Track};
use crate::stream::icy::IcyWriter;
use crate::stream::transcoder::Transcoder;

/// Keys silently dropped from stats payloads.
const STATS_DENYLIST: [&str; 4] = ["__proto__", "constructor", "roomId", "role"];

/// Admin-surface view of one room.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: String,
    pub live: bool,
    pub receiver_count: usize,
    pub relay_listener_count: usize,
    pub track_count: usize,
    pub chat_count: usize,
    pub created_at: u64,
    pub ended: bool,
}

/// Authoritative catalog of broadcast rooms.
pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
    slugs: SlugStore,
}

impl RoomRegistry {
    pub fn new(slugs: SlugStore) -> Self {
        Self {
            rooms: DashMap::new(),
            slugs,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Creates a room, honoring a caller-supplied slug when it is valid and
    /// not currently held by a live broadcaster. Re-creating an off-air slug
    /// revives the existing room, preserving its content.
    pub fn create(&self, slug: Option<&str>) -> Result<String, SignalCode> {
        if let Some(slug) = slug {
            if !is_valid_slug(slug) {
                return Err(SignalCode::InvalidSlug);
            }
            if let Some(room) = self.rooms.get(slug) {
                if room.live_broadcaster().is_some() {
                    return Err(SignalCode::SlugInUse);
                }
                return Ok(slug.to_string());
            }
            self.rooms.insert(slug.to_string(), Room::new(slug.to_string()));
            self.slugs.add(slug);
            log::info!("[Registry] Room created: {} (custom slug)", slug);
            return Ok(slug.to_string());
        }

        let id = loop {
            let candidate = random_hex(7);
            if !self.rooms.contains_key(&candidate) {
                break candidate;
            }
        };
        self.rooms.insert(id.clone(), Room::new(id.clone()));
        log::info!("[Registry] Room created: {}", id);
        Ok(id)
    }

    /// Joins a connection to a room. Returns the fresh receiver id for
    /// receivers, `None` for the broadcaster.
    pub fn join(
        &self,
        room_id: &str,
        role: Role,
        handle: ClientHandle,
    ) -> Result<Option<String>, SignalCode> {
        let mut room = self.rooms.get_mut(room_id).ok_or(SignalCode::RoomNotFound)?;
        match role {
            Role::Broadcaster => {
                if room.live_broadcaster().is_some() {
                    return Err(SignalCode::BroadcasterOccupied);
                }
                room.broadcaster = Some(handle);
                room.ended_at = None;
                log::info!("[Registry] Broadcaster joined {}", room_id);
                Ok(None)
            }
            Role::Receiver => {
                // Drop entries whose connections already closed so phantom
                // receivers never consume the cap.
                room.receivers.retain(|_, h| h.is_open());
                if room.receivers.len() >= MAX_RECEIVERS {
                    return Err(SignalCode::RoomFull);
                }
                let receiver_id = loop {
                    let candidate = random_hex(8);
                    if !room.receivers.contains_key(&candidate) {
                        break candidate;
                    }
                };
                room.receivers.insert(receiver_id.clone(), handle);
                log::info!("[Registry] Receiver {} joined {}", receiver_id, room_id);
                Ok(Some(receiver_id))
            }
        }
    }

    /// Drops a participant. The broadcaster's departure marks the room ended;
    /// a room left with nothing worth keeping is destroyed immediately.
    pub fn leave(&self, room_id: &str, role: Role, receiver_id: Option<&str>) {
        let reclaim = {
            let Some(mut room) = self.rooms.get_mut(room_id) else {
                return;
            };
            match role {
                Role::Broadcaster => {
                    room.broadcaster = None;
                    room.ended_at = Some(Instant::now());
                    log::info!("[Registry] Broadcaster left {}", room_id);
                }
                Role::Receiver => {
                    if let Some(id) = receiver_id {
                        room.receivers.remove(id);
                        log::info!("[Registry] Receiver {} left {}", id, room_id);
                    }
                }
            }
            room.is_reclaimable()
        };
        if reclaim {
            log::info!("[Registry] Destroying empty room {}", room_id);
            self.destroy_room(room_id);
        }
    }

    #[must_use]
    pub fn room_exists(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Tears down a room: transcoder stopped, relay listeners ended, entry
    /// removed.
    pub fn destroy_room(&self, room_id: &str) {
        if let Some((_, room)) = self.rooms.remove(room_id) {
            if let Some(transcoder) = room.transcoder {
                transcoder.stop();
            }
            for writer in &room.relay_listeners {
                writer.end();
            }
        }
    }

    /// Spawns the background task that destroys rooms whose retention window
    /// elapsed.
    pub fn spawn_ttl_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(ROOM_SWEEP_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep_expired();
            }
        })
    }

    /// One sweep pass; separated from the task for testability.
    pub fn sweep_expired(&self) {
        let ttl = Duration::from_secs(ROOM_TTL_SECS);
        let expired: Vec<String> = self
            .rooms
            .iter()
            .filter(|r| r.ended_at.is_some_and(|t| t.elapsed() > ttl))
            .map(|r| r.id.clone())
            .collect();
        for id in expired {
            log::info!("[Registry] Room {} expired, destroying", id);
            self.destroy_room(&id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connection lookups (open connections only)
    // ─────────────────────────────────────────────────────────────────────

    #[must_use]
    pub fn get_broadcaster(&self, room_id: &str) -> Option<ClientHandle> {
        self.rooms
            .get(room_id)
            .and_then(|r| r.live_broadcaster().cloned())
    }

    #[must_use]
    pub fn get_receiver(&self, room_id: &str, receiver_id: &str) -> Option<ClientHandle> {
        self.rooms.get(room_id).and_then(|r| {
            r.receivers
                .get(receiver_id)
                .filter(|h| h.is_open())
                .cloned()
        })
    }

    #[must_use]
    pub fn list_receiver_ids(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|r| r.live_receiver_ids())
            .unwrap_or_default()
    }

    /// Open receiver handles with their ids, for broadcast fan-out.
    #[must_use]
    pub fn list_receivers(&self, room_id: &str) -> Vec<(String, ClientHandle)> {
        self.rooms
            .get(room_id)
            .map(|r| {
                r.receivers
                    .iter()
                    .filter(|(_, h)| h.is_open())
                    .map(|(id, h)| (id.clone(), h.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Content
    // ─────────────────────────────────────────────────────────────────────

    /// Updates now-playing text and cover, length-clamped.
    pub fn set_metadata(&self, room_id: &str, text: &str, cover_url: Option<&str>) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.metadata.text = clamp(text, MAX_METADATA_TEXT);
            room.metadata.cover_url = cover_url.map(|c| clamp(c, MAX_COVER_URL));
        }
    }

    #[must_use]
    pub fn get_metadata(&self, room_id: &str) -> Option<(String, Option<String>)> {
        self.rooms
            .get(room_id)
            .map(|r| (r.metadata.text.clone(), r.metadata.cover_url.clone()))
    }

    /// Commits a track, applying the monotone-title de-dup.
    /// Returns `false` on the duplicate no-op.
    pub fn add_track(&self, room_id: &str, track: Track) -> bool {
        self.rooms
            .get_mut(room_id)
            .map(|mut r| r.push_track(track))
            .unwrap_or(false)
    }

    #[must_use]
    pub fn get_track_list(&self, room_id: &str) -> Vec<Track> {
        self.rooms
            .get(room_id)
            .map(|r| r.track_list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn add_chat(&self, room_id: &str, message: ChatMessage) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.push_chat(message);
        }
    }

    #[must_use]
    pub fn get_chat_history(&self, room_id: &str) -> Vec<ChatMessage> {
        self.rooms
            .get(room_id)
            .map(|r| r.chat_history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Registers a chat participant. Returns `true` the first time this
    /// participant id appears in the room.
    pub fn add_chat_participant(&self, room_id: &str, participant_id: &str, name: &str) -> bool {
        self.rooms
            .get_mut(room_id)
            .map(|mut r| {
                r.chat_participants
                    .insert(
                        participant_id.to_string(),
                        ChatParticipant {
                            display_name: name.to_string(),
                        },
                    )
                    .is_none()
            })
            .unwrap_or(false)
    }

    /// Removes a chat participant, returning the display name if present.
    pub fn remove_chat_participant(&self, room_id: &str, participant_id: &str) -> Option<String> {
        self.rooms
            .get_mut(room_id)?
            .chat_participants
            .remove(participant_id)
            .map(|p| p.display_name)
    }

    pub fn set_integration_info(&self, room_id: &str, info: IntegrationInfo) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.integration = Some(info);
        }
    }

    /// Forgets the external server while keeping a previously announced
    /// local relay URL.
    pub fn clear_external_integration(&self, room_id: &str) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            match room.integration.take() {
                Some(info) if info.local_stream_url.is_some() => {
                    room.integration = Some(IntegrationInfo {
                        local_stream_url: info.local_stream_url,
                        ..IntegrationInfo::default()
                    });
                }
                _ => {}
            }
        }
    }

    #[must_use]
    pub fn get_integration_info(&self, room_id: &str) -> Option<IntegrationInfo> {
        self.rooms.get(room_id).and_then(|r| r.integration.clone())
    }

    /// Records the room's own relay URL on its integration state, creating
    /// the record if none exists yet. Used by `start-relay`.
    pub fn set_local_stream_url(&self, room_id: &str, url: &str) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.integration
                .get_or_insert_with(IntegrationInfo::default)
                .local_stream_url = Some(url.to_string());
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Relay plumbing
    // ─────────────────────────────────────────────────────────────────────

    /// Attaches an HTTP listener. Refused when the room has no live
    /// broadcaster.
    pub fn add_relay_listener(&self, room_id: &str, writer: Arc<IcyWriter>) -> bool {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        if room.live_broadcaster().is_none() {
            return false;
        }
        room.relay_listeners.push(writer);
        log::debug!(
            "[Registry] Relay listener attached to {} ({} total)",
            room_id,
            room.relay_listeners.len()
        );
        true
    }

    pub fn remove_relay_listener(&self, room_id: &str, writer_id: u64) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.relay_listeners.retain(|w| w.id() != writer_id);
        }
    }

    #[must_use]
    pub fn relay_listener_count(&self, room_id: &str) -> usize {
        self.rooms
            .get(room_id)
            .map(|r| r.relay_listeners.len())
            .unwrap_or(0)
    }

    /// Ends and detaches every relay listener of a room.
    pub fn end_relay_listeners(&self, room_id: &str) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            for writer in room.relay_listeners.drain(..) {
                writer.end();
            }
        }
    }

    /// Pushes a new ICY title to every attached listener.
    pub fn set_icy_title(&self, room_id: &str, title: &str) {
        if let Some(room) = self.rooms.get(room_id) {
            for writer in &room.relay_listeners {
                writer.set_title(title);
            }
        }
    }

    #[must_use]
    pub fn relay_header(&self, room_id: &str) -> Option<Bytes> {
        self.rooms.get(room_id).and_then(|r| r.relay_header.clone())
    }

    /// Distributes an audio chunk to every attached listener, detaching any
    /// whose write fails. One listener's failure never affects the others.
    pub fn fan_out_audio(&self, room_id: &str, chunk: &[u8]) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            let before = room.relay_listeners.len();
            room.relay_listeners.retain(|w| w.write(chunk));
            let pruned = before - room.relay_listeners.len();
            if pruned > 0 {
                log::debug!("[Registry] Pruned {} dead relay listener(s) from {}", pruned, room_id);
            }
        }
    }

    /// Routes one ingested broadcaster frame.
    ///
    /// The first frame is stored as the room's relay header before anything
    /// else happens. With a transcoder configured the frame goes to the child
    /// process (lazily [re]started); otherwise it is passed through to the
    /// listeners as-is.
    pub fn ingest_frame(self: &Arc<Self>, room_id: &str, frame: Bytes, transcoder_bin: Option<&str>) {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return;
        };
        if room.relay_header.is_none() {
            room.relay_header = Some(frame.clone());
        }

        let Some(bin) = transcoder_bin else {
            drop(room);
            self.fan_out_audio(room_id, &frame);
            return;
        };

        if let Some(transcoder) = &room.transcoder {
            if transcoder.write(frame.clone()) {
                return;
            }
            // Child died underneath us; restart below.
            log::warn!("[Registry] Transcoder for {} is gone, restarting", room_id);
        }
        match Transcoder::spawn(bin, Arc::clone(self), room_id.to_string()) {
            Ok(transcoder) => {
                transcoder.write(frame);
                room.transcoder = Some(transcoder);
            }
            Err(e) => {
                log::warn!("[Registry] Failed to start transcoder for {}: {}", room_id, e);
                room.transcoder = None;
            }
        }
    }

    /// Stops and forgets the room's transcoder, if any.
    pub fn stop_transcoder(&self, room_id: &str) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            if let Some(transcoder) = room.transcoder.take() {
                transcoder.stop();
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Slug history / stats / admin
    // ─────────────────────────────────────────────────────────────────────

    #[must_use]
    pub fn list_slug_history(&self) -> Vec<String> {
        self.slugs.list()
    }

    pub fn remove_slug(&self, slug: &str) -> bool {
        self.slugs.remove(slug)
    }

    /// Logs a sanitized client stats payload: scalar values only, reserved
    /// keys dropped.
    pub fn log_stats(&self, room_id: &str, role: Option<Role>, data: &serde_json::Value) {
        let Some(object) = data.as_object() else {
            return;
        };
        let sanitized: serde_json::Map<String, serde_json::Value> = object
            .iter()
            .filter(|(k, v)| {
                !STATS_DENYLIST.contains(&k.as_str())
                    && (v.is_string() || v.is_number() || v.is_boolean())
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        log::info!(
            "[Registry] stats room={} role={:?} data={}",
            room_id,
            role,
            serde_json::Value::Object(sanitized)
        );
    }

    #[must_use]
    pub fn room_summaries(&self) -> Vec<RoomSummary> {
        self.rooms
            .iter()
            .map(|r| RoomSummary {
                id: r.id.clone(),
                live: r.live_broadcaster().is_some(),
                receiver_count: r.live_receiver_ids().len(),
                relay_listener_count: r.relay_listeners.len(),
                track_count: r.track_list.len(),
                chat_count: r.chat_history.len(),
                created_at: r.created_at,
                ended: r.ended_at.is_some(),
            })
            .collect()
    }
}

/// Truncates to at most `max` bytes on a char boundary.
#[must_use]
pub fn clamp(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn random_hex(len: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len).map(|_| HEX[rng.gen_range(0..16)] as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    fn registry() -> Arc<RoomRegistry> {
        let dir = tempdir().unwrap();
        Arc::new(RoomRegistry::new(SlugStore::load(
            dir.path().join("slugs.json"),
        )))
    }

    fn handle() -> (ClientHandle, mpsc::UnboundedReceiver<axum::extract::ws::Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientHandle::new(tx), rx)
    }

    #[test]
    fn generated_ids_are_seven_hex_chars() {
        let reg = registry();
        let id = reg.create(None).unwrap();
        assert_eq!(id.len(), 7);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn receiver_cap_is_enforced() {
        let reg = registry();
        let id = reg.create(None).unwrap();
        let (b, _b_rx) = handle();
        reg.join(&id, Role::Broadcaster, b).unwrap();

        let mut rxs = Vec::new();
        for _ in 0..MAX_RECEIVERS {
            let (h, rx) = handle();
            assert!(reg.join(&id, Role::Receiver, h).unwrap().is_some());
            rxs.push(rx);
        }
        let (fifth, _rx) = handle();
        assert_eq!(reg.join(&id, Role::Receiver, fifth), Err(SignalCode::RoomFull));
        assert_eq!(reg.list_receiver_ids(&id).len(), MAX_RECEIVERS);
    }

    #[test]
    fn closed_receiver_slots_are_reusable() {
        let reg = registry();
        let id = reg.create(None).unwrap();
        let (b, _b_rx) = handle();
        reg.join(&id, Role::Broadcaster, b).unwrap();

        // Fill the room, then drop every receiver's channel.
        for _ in 0..MAX_RECEIVERS {
            let (h, rx) = handle();
            reg.join(&id, Role::Receiver, h).unwrap();
            drop(rx);
        }
        let (h, _rx) = handle();
        assert!(reg.join(&id, Role::Receiver, h).unwrap().is_some());
    }

    #[test]
    fn second_broadcaster_is_rejected_until_leave() {
        let reg = registry();
        let id = reg.create(None).unwrap();
        let (first, _rx1) = handle();
        reg.join(&id, Role::Broadcaster, first).unwrap();

        let (second, _rx2) = handle();
        assert_eq!(
            reg.join(&id, Role::Broadcaster, second.clone()),
            Err(SignalCode::BroadcasterOccupied)
        );

        reg.leave(&id, Role::Broadcaster, None);
        // Room kept (ended state); rejoin revives it.
        assert!(reg.room_exists(&id));
        assert!(reg.join(&id, Role::Broadcaster, second).is_ok());
    }

    #[test]
    fn custom_slug_lifecycle() {
        let reg = registry();
        assert_eq!(reg.create(Some("a")), Err(SignalCode::InvalidSlug));

        let id = reg.create(Some("friday-show")).unwrap();
        assert_eq!(id, "friday-show");
        let (b, _rx) = handle();
        reg.join(&id, Role::Broadcaster, b).unwrap();

        // Live slug is refused; after leave it is reusable.
        assert_eq!(reg.create(Some("friday-show")), Err(SignalCode::SlugInUse));
        reg.leave(&id, Role::Broadcaster, None);
        assert_eq!(reg.create(Some("friday-show")).unwrap(), "friday-show");
        assert!(reg.list_slug_history().contains(&"friday-show".to_string()));
    }

    #[test]
    fn join_unknown_room_fails() {
        let reg = registry();
        let (h, _rx) = handle();
        assert_eq!(
            reg.join("zzzzzzz", Role::Receiver, h),
            Err(SignalCode::RoomNotFound)
        );
    }

    #[test]
    fn empty_room_reclaimed_on_last_receiver_leave() {
        let reg = registry();
        let id = reg.create(None).unwrap();
        // No broadcaster, no content: the last leave destroys the room.
        let (h, _rx) = handle();
        let rid = reg.join(&id, Role::Receiver, h).unwrap().unwrap();
        reg.leave(&id, Role::Receiver, Some(&rid));
        assert!(!reg.room_exists(&id));
    }

    #[test]
    fn stats_are_sanitized() {
        let reg = registry();
        let id = reg.create(None).unwrap();
        // Only verifies the sanitizer does not panic on hostile shapes.
        reg.log_stats(
            &id,
            Some(Role::Receiver),
            &serde_json::json!({
                "__proto__": {"x": 1},
                "roomId": "spoof",
                "bitrate": 128,
                "nested": {"drop": true},
                "ok": true
            }),
        );
        reg.log_stats(&id, None, &serde_json::json!("not an object"));
    }

    #[test]
    fn clamp_respects_char_boundaries() {
        assert_eq!(clamp("abcdef", 3), "abc");
        assert_eq!(clamp("ab", 3), "ab");
        // 'é' is two bytes; clamping mid-char backs off.
        assert_eq!(clamp("aéb", 2), "a");
    }
}
