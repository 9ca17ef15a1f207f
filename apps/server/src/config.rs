//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! The environment always wins so containerized deployments need no file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP server to.
    /// Override: `PORT`
    pub port: u16,

    /// Single allowed signaling origin, or `*` for any.
    /// Override: `ALLOWED_ORIGIN`
    pub allowed_origin: String,

    /// Reject plain-HTTP requests to authenticated endpoints.
    /// Override: `REQUIRE_TLS`
    pub require_tls: bool,

    /// HMAC secret for session tokens.
    /// Override: `SESSION_SECRET`
    pub session_secret: Option<String>,

    /// Password accepted by `/api/login`.
    /// Override: `ADMIN_PASSWORD`
    pub admin_password: Option<String>,

    /// API key for the audio fingerprinting collaborator.
    /// Override: `ACOUSTID_API_KEY`
    pub acoustid_api_key: Option<String>,

    /// Provider URL returning short-lived TURN credentials.
    /// Override: `ICE_CREDENTIALS_URL`
    pub ice_credentials_url: Option<String>,

    /// Static TURN fallback.
    /// Overrides: `TURN_URL`, `TURN_USERNAME`, `TURN_CREDENTIAL`
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,

    /// External transcoding utility; empty disables transcoding and the
    /// relay serves the original container.
    /// Override: `TRANSCODER_BIN`
    pub transcoder_bin: String,

    /// Directory for persistent state (slug history).
    /// Override: `DATA_DIR`
    pub data_dir: PathBuf,

    /// Explicit slug-history file location.
    /// Override: `SLUG_HISTORY_PATH`
    pub slug_history_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            allowed_origin: "*".to_string(),
            require_tls: false,
            session_secret: None,
            admin_password: None,
            acoustid_api_key: None,
            ice_credentials_url: None,
            turn_url: None,
            turn_username: None,
            turn_credential: None,
            transcoder_bin: "ffmpeg".to_string(),
            data_dir: PathBuf::from("."),
            slug_history_path: None,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("PORT") {
            if let Ok(port) = val.parse() {
                self.port = port;
            }
        }
        if let Ok(val) = std::env::var("ALLOWED_ORIGIN") {
            self.allowed_origin = val;
        }
        if let Ok(val) = std::env::var("REQUIRE_TLS") {
            self.require_tls = matches!(val.as_str(), "1" | "true" | "yes");
        }
        for (var, field) in [
            ("SESSION_SECRET", &mut self.session_secret),
            ("ADMIN_PASSWORD", &mut self.admin_password),
            ("ACOUSTID_API_KEY", &mut self.acoustid_api_key),
            ("ICE_CREDENTIALS_URL", &mut self.ice_credentials_url),
            ("TURN_URL", &mut self.turn_url),
            ("TURN_USERNAME", &mut self.turn_username),
            ("TURN_CREDENTIAL", &mut self.turn_credential),
        ] {
            if let Ok(val) = std::env::var(var) {
                *field = Some(val);
            }
        }
        if let Ok(val) = std::env::var("TRANSCODER_BIN") {
            self.transcoder_bin = val;
        }
        if let Ok(val) = std::env::var("DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SLUG_HISTORY_PATH") {
            self.slug_history_path = Some(PathBuf::from(val));
        }
    }

    /// Converts to the core configuration consumed by `AppState`.
    pub fn to_core_config(&self) -> wavecast_core::Config {
        wavecast_core::Config {
            port: self.port,
            allowed_origin: match self.allowed_origin.trim() {
                "" | "*" => None,
                origin => Some(origin.to_string()),
            },
            require_tls: self.require_tls,
            session_secret: self.session_secret.clone(),
            admin_password: self.admin_password.clone(),
            acoustid_api_key: self.acoustid_api_key.clone(),
            ice_credentials_url: self.ice_credentials_url.clone(),
            turn_url: self.turn_url.clone(),
            turn_username: self.turn_username.clone(),
            turn_credential: self.turn_credential.clone(),
            transcoder_bin: match self.transcoder_bin.trim() {
                "" => None,
                bin => Some(bin.to_string()),
            },
            slug_history_path: self
                .slug_history_path
                .clone()
                .unwrap_or_else(|| self.data_dir.join("slug-history.json")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_origin_maps_to_none() {
        let config = ServerConfig::default();
        assert!(config.to_core_config().allowed_origin.is_none());

        let config = ServerConfig {
            allowed_origin: "https://cast.example".into(),
            ..ServerConfig::default()
        };
        assert_eq!(
            config.to_core_config().allowed_origin.as_deref(),
            Some("https://cast.example")
        );
    }

    #[test]
    fn empty_transcoder_bin_disables_transcoding() {
        let config = ServerConfig {
            transcoder_bin: String::new(),
            ..ServerConfig::default()
        };
        assert!(config.to_core_config().transcoder_bin.is_none());
    }

    #[test]
    fn slug_history_defaults_into_data_dir() {
        let config = ServerConfig {
            data_dir: PathBuf::from("/var/lib/wavecast"),
            ..ServerConfig::default()
        };
        assert_eq!(
            config.to_core_config().slug_history_path,
            PathBuf::from("/var/lib/wavecast/slug-history.json")
        );
    }
}
