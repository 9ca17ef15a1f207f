//! Shoutcast DNAS v1 source handshake.
//!
//! v1 auth is password-first: the source connects, sends the password line,
//! and waits for `OK` before sending its audio headers. (v2 servers answer
//! `OK2` to the same exchange.)

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol_constants::APP_NAME;
use crate::source_client::icecast::normalize_host;
use crate::source_client::{SourceClientError, SourceConnection, SourceCredentials};

const DEFAULT_PORT: u16 = 8000;

pub(super) async fn connect(
    credentials: &SourceCredentials,
) -> Result<SourceConnection, SourceClientError> {
    let (host, inferred_port, _) = normalize_host(&credentials.host);
    let port = credentials.port.or(inferred_port).unwrap_or(DEFAULT_PORT);

    log::debug!("[SourceClient] Shoutcast v1 connect {}:{}", host, port);
    let mut stream = TcpStream::connect((host.as_str(), port)).await?;

    let password_line = match credentials.stream_id {
        Some(id) => format!("{}:{}\r\n", credentials.password, id),
        None => format!("{}\r\n", credentials.password),
    };
    stream.write_all(password_line.as_bytes()).await?;

    let mut buf = [0u8; 512];
    let n = stream.read(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf[..n]).into_owned();

    let lowered = response.to_ascii_lowercase();
    if !(response.contains("OK2") || response.contains("OK")) {
        if lowered.contains("invalid password") || lowered.contains("denied") {
            return Err(SourceClientError::AuthFailed);
        }
        return Err(SourceClientError::Protocol(
            response.lines().next().unwrap_or("").trim().to_string(),
        ));
    }

    let name = credentials.name.as_deref().unwrap_or(APP_NAME);
    let headers = format!(
        "content-type: audio/mpeg\r\n\
         icy-name: {}\r\n\
         icy-pub: 0\r\n\
         \r\n",
        name
    );
    stream.write_all(headers.as_bytes()).await?;

    Ok(SourceConnection {
        stream,
        // Conventional DNAS listen path.
        listener_url: format!("http://{}:{}/;", host, port),
    })
}
