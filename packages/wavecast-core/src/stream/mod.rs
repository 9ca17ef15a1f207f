//! Relay streaming: ICY metadata interleaving and the transcoder supervisor.

use axum::http::HeaderMap;

pub mod icy;
pub mod transcoder;

pub use icy::IcyWriter;
pub use transcoder::Transcoder;

/// Player user agents known to understand interleaved ICY metadata.
const ICY_CAPABLE_AGENTS: [&str; 12] = [
    "vlc",
    "winamp",
    "foobar",
    "xmms",
    "radio",
    "icecast",
    "mpv",
    "mplayer",
    "bass",
    "fstream",
    "tunein",
    "streamripper",
];

/// Decides whether a relay listener gets ICY metadata: either the request
/// opted in with `icy-metadata: 1`, or the user agent is a known player.
#[must_use]
pub fn wants_icy_metadata(headers: &HeaderMap) -> bool {
    let opted_in = headers
        .get("icy-metadata")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "1");
    if opted_in {
        return true;
    }
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|ua| {
            let ua = ua.to_ascii_lowercase();
            ICY_CAPABLE_AGENTS.iter().any(|a| ua.contains(a))
        })
        .unwrap_or(false)
}
