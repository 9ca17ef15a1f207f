//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by external protocol conventions (ICY/Shoutcast,
//! WebRTC signaling limits) or by the room data model; changing them breaks
//! wire compatibility with deployed clients.

// ─────────────────────────────────────────────────────────────────────────────
// ICY Protocol (Shoutcast/Icecast metadata)
// ─────────────────────────────────────────────────────────────────────────────

/// ICY metadata interval (bytes of audio between metadata blocks).
///
/// Advertised to listeners via the `icy-metaint` response header; every
/// listener that opted in expects a metadata block after exactly this many
/// audio bytes.
pub const ICY_METAINT: usize = 16384;

/// Bitrate of the relay MP3 stream (kbit/s), advertised as `icy-br`.
pub const RELAY_BITRATE_KBPS: u32 = 128;

/// Sample rate of the relay MP3 stream (Hz), advertised as `icy-sr`.
pub const RELAY_SAMPLE_RATE: u32 = 44100;

// ─────────────────────────────────────────────────────────────────────────────
// Room Data Model
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum number of receivers per room.
pub const MAX_RECEIVERS: usize = 4;

/// Maximum entries kept in a room's track list (newest first).
pub const MAX_TRACK_LIST: usize = 100;

/// Maximum entries kept in a room's chat history (oldest first).
pub const MAX_CHAT_HISTORY: usize = 200;

/// Length caps applied to user-supplied strings.
pub const MAX_METADATA_TEXT: usize = 200;
pub const MAX_COVER_URL: usize = 500;
pub const MAX_TRACK_FIELD: usize = 500;
pub const MAX_CHAT_NAME: usize = 50;
pub const MAX_CHAT_TEXT: usize = 280;

/// Retention of an ended room before the sweeper destroys it.
pub const ROOM_TTL_SECS: u64 = 24 * 60 * 60;

/// Interval between room TTL sweeps.
pub const ROOM_SWEEP_INTERVAL_SECS: u64 = 15 * 60;

// ─────────────────────────────────────────────────────────────────────────────
// Signaling
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum accepted signaling frame size (caps memory per connection).
pub const MAX_SIGNAL_FRAME_BYTES: usize = 256 * 1024;

/// Keepalive ping interval; a peer that missed a whole interval without
/// ponging is terminated.
pub const SIGNAL_PING_INTERVAL_SECS: u64 = 25;

/// Maximum length of a forwarded SDP body.
pub const MAX_SDP_LEN: usize = 10_000;

/// Maximum serialized length of a forwarded ICE candidate.
pub const MAX_CANDIDATE_LEN: usize = 2_000;

/// Minimum spacing between chat messages on one connection (ms).
pub const CHAT_MIN_INTERVAL_MS: u64 = 1_000;

/// WebSocket close codes used by the connection guards.
pub const CLOSE_UNAUTHENTICATED: u16 = 4001;
pub const CLOSE_BAD_ORIGIN: u16 = 4003;
pub const CLOSE_RATE_LIMITED: u16 = 4029;

// ─────────────────────────────────────────────────────────────────────────────
// Timeouts
// ─────────────────────────────────────────────────────────────────────────────

/// Total budget for a source-client connect + handshake.
pub const SOURCE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// How long the external-relay endpoint waits for the first audio frame.
pub const FIRST_AUDIO_TIMEOUT_SECS: u64 = 8;

/// Lifetime of a session token from `issued_at`.
pub const SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Lifetime of cached ICE provider credentials.
pub const ICE_CACHE_TTL_SECS: u64 = 5 * 60;

/// Interval between rate-limit table sweeps.
pub const RATE_LIMIT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;

// ─────────────────────────────────────────────────────────────────────────────
// Rate Limits (count per window)
// ─────────────────────────────────────────────────────────────────────────────

pub const CONNECT_LIMIT: u32 = 20;
pub const CONNECT_LIMIT_WINDOW_SECS: u64 = 60;

pub const LOGIN_LIMIT: u32 = 10;
pub const LOGIN_LIMIT_WINDOW_SECS: u64 = 5 * 60;

pub const INTEGRATION_TEST_LIMIT: u32 = 10;
pub const INTEGRATION_TEST_WINDOW_SECS: u64 = 60;

pub const IDENTIFY_LIMIT: u32 = 2;
pub const IDENTIFY_WINDOW_SECS: u64 = 10;

/// Maximum accepted body for audio identification (bytes).
pub const MAX_IDENTIFY_BODY: usize = 2 * 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Application name used in protocol data (ICY headers, source-client UA).
///
/// Intentionally not localized since it appears in network protocols where
/// consistency matters more than translation.
pub const APP_NAME: &str = "WaveCast";

/// User-Agent sent by the source client and outbound HTTP calls.
pub const CLIENT_UA: &str = concat!("WaveCast/", env!("CARGO_PKG_VERSION"));
