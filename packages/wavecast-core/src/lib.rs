//! WaveCast core - server library for live browser audio broadcasting.
//!
//! One authenticated broadcaster per room streams audio to up to four
//! receivers; this crate provides the room registry, the signaling router,
//! the MP3 relay pipeline with ICY metadata, and the Icecast/Shoutcast
//! source client used to push the same audio to external servers.
//!
//! # Architecture
//!
//! - [`room`]: room entities, the authoritative registry, slug history
//! - [`api`]: HTTP/WebSocket surface (signaling, relay, control endpoints)
//! - [`stream`]: ICY metadata interleaving and the transcoder supervisor
//! - [`source_client`]: Icecast/Shoutcast source protocols over TCP
//! - [`session`]: HMAC-signed session tokens
//! - [`rate_limit`]: per-IP sliding-window tables
//! - [`error`]: centralized error types
//!
//! The concurrency discipline is single-writer per room: every room mutation
//! happens under the registry's shard lock with no awaits inside, and every
//! outbound socket write goes through a per-connection writer task.

#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod error;
pub mod protocol_constants;
pub mod rate_limit;
pub mod room;
pub mod session;
pub mod source_client;
pub mod stream;

// Re-export commonly used types at the crate root
pub use api::{create_router, start_server, AppState, ServerError};
pub use config::Config;
pub use error::{CastError, CastResult, SignalCode};
pub use rate_limit::{RateLimitTables, RateLimiter};
pub use room::{
    ChatMessage, ClientHandle, IntegrationInfo, Role, Room, RoomRegistry, SlugStore, Track,
};
pub use session::{Session, SessionService};
pub use source_client::{SourceClientError, SourceCredentials, SourceKind};
pub use stream::{IcyWriter, Transcoder};
