//! Core runtime configuration.
//!
//! The server binary owns loading (YAML file + environment overrides) and
//! hands the resolved values to the core as this struct.

use std::path::PathBuf;

use serde::Deserialize;

/// Resolved runtime configuration for the core services.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP bind port.
    pub port: u16,

    /// Allowed signaling origin. `None` means wildcard (no origin check).
    pub allowed_origin: Option<String>,

    /// Reject plain-HTTP requests to authenticated endpoints.
    pub require_tls: bool,

    /// HMAC secret for session tokens. Unset puts login in degraded mode.
    pub session_secret: Option<String>,

    /// Password checked by `/api/login`.
    pub admin_password: Option<String>,

    /// API key for the audio fingerprinting collaborator.
    pub acoustid_api_key: Option<String>,

    /// Provider URL returning short-lived TURN credentials.
    pub ice_credentials_url: Option<String>,

    /// Static TURN fallback.
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,

    /// External transcoding utility. `None` disables transcoding and the
    /// relay falls back to container passthrough.
    pub transcoder_bin: Option<String>,

    /// Location of the persisted slug-history file.
    pub slug_history_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            allowed_origin: None,
            require_tls: false,
            session_secret: None,
            admin_password: None,
            acoustid_api_key: None,
            ice_credentials_url: None,
            turn_url: None,
            turn_username: None,
            turn_credential: None,
            transcoder_bin: Some("ffmpeg".to_string()),
            slug_history_path: PathBuf::from("slug-history.json"),
        }
    }
}

impl Config {
    /// True when a transcoding utility is configured (relay serves MP3).
    #[must_use]
    pub fn transcoding_enabled(&self) -> bool {
        self.transcoder_bin.as_deref().is_some_and(|b| !b.is_empty())
    }
}
