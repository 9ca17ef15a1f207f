//! Source-client transport: pushes the relay stream into external
//! Icecast/Shoutcast servers over raw TCP.
//!
//! Two wire protocols live in the submodules; this module owns the shared
//! credential shape, error classification, the connect timeout, and the
//! fire-and-forget metadata updates.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;

use crate::protocol_constants::SOURCE_CONNECT_TIMEOUT_SECS;

pub mod icecast;
pub mod metadata;
pub mod shoutcast;

/// Which source protocol an integration speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Icecast,
    Shoutcast,
}

/// Credentials for an external streaming server, as supplied by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCredentials {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub mount: Option<String>,
    pub password: String,
    /// Source username; defaults to the literal `source` when omitted.
    #[serde(default)]
    pub user: Option<String>,
    /// Stream name advertised to the server.
    #[serde(default)]
    pub name: Option<String>,
    /// Shoutcast stream id for multi-stream servers.
    #[serde(default)]
    pub stream_id: Option<u32>,
}

/// Classified source-client failures. Retries are the caller's business.
#[derive(Debug, Error)]
pub enum SourceClientError {
    #[error("connection timed out")]
    ConnectTimeout,

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Mount point in use or forbidden")]
    MountBusy,

    #[error("{0}")]
    Protocol(String),

    #[error("{0}")]
    Io(#[from] io::Error),
}

impl SourceClientError {
    /// Stable classification string for logs and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectTimeout => "connect_timeout",
            Self::AuthFailed => "auth_failed",
            Self::MountBusy => "mount_busy",
            Self::Protocol(_) => "protocol_error",
            Self::Io(_) => "io_error",
        }
    }
}

/// An authenticated, writable source connection.
pub struct SourceConnection {
    pub stream: TcpStream,
    /// Public URL where listeners reach the pushed stream.
    pub listener_url: String,
}

/// Connects and authenticates against the external server. The whole path
/// (DNS, TCP connect, handshake) shares one 10-second timeout.
pub async fn connect(
    kind: SourceKind,
    credentials: &SourceCredentials,
) -> Result<SourceConnection, SourceClientError> {
    let attempt = async {
        match kind {
            SourceKind::Icecast => icecast::connect(credentials).await,
            SourceKind::Shoutcast => shoutcast::connect(credentials).await,
        }
    };
    match tokio::time::timeout(Duration::from_secs(SOURCE_CONNECT_TIMEOUT_SECS), attempt).await {
        Ok(result) => result,
        Err(_) => {
            log::warn!("[SourceClient] Connect to {} timed out", credentials.host);
            Err(SourceClientError::ConnectTimeout)
        }
    }
}

/// Outcome of a connection test.
#[derive(Debug, Serialize)]
pub struct TestOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Opens, authenticates, and immediately tears down a connection.
pub async fn test_connection(kind: SourceKind, credentials: &SourceCredentials) -> TestOutcome {
    match connect(kind, credentials).await {
        Ok(conn) => {
            drop(conn);
            TestOutcome {
                ok: true,
                error: None,
            }
        }
        Err(e) => {
            log::info!("[SourceClient] Test connection failed ({}): {}", e.kind(), e);
            TestOutcome {
                ok: false,
                error: Some(e.to_string()),
            }
        }
    }
}
