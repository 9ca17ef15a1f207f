//! Icecast `SOURCE` protocol handshake.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol_constants::CLIENT_UA;
use crate::source_client::{SourceClientError, SourceConnection, SourceCredentials};

/// Cap on response bytes read while hunting for the header terminator.
const MAX_RESPONSE_BYTES: usize = 2048;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_MOUNT: &str = "/stream";

pub(super) async fn connect(
    credentials: &SourceCredentials,
) -> Result<SourceConnection, SourceClientError> {
    let (host, inferred_port, inferred_path) = normalize_host(&credentials.host);
    let port = credentials.port.or(inferred_port).unwrap_or(DEFAULT_PORT);
    let mount = normalize_mount(
        credentials
            .mount
            .as_deref()
            .or(inferred_path.as_deref())
            .unwrap_or(DEFAULT_MOUNT),
    );
    let user = credentials.user.as_deref().unwrap_or("source");
    let name = credentials.name.as_deref().unwrap_or(crate::protocol_constants::APP_NAME);

    log::debug!("[SourceClient] Icecast SOURCE {}:{}{}", host, port, mount);
    let mut stream = TcpStream::connect((host.as_str(), port)).await?;

    let auth = STANDARD.encode(format!("{}:{}", user, credentials.password));
    let request = format!(
        "SOURCE {} HTTP/1.0\r\n\
         content-type: audio/mpeg\r\n\
         Authorization: Basic {}\r\n\
         User-Agent: {}\r\n\
         ice-name: {}\r\n\
         ice-public: 0\r\n\
         \r\n",
        mount, auth, CLIENT_UA, name
    );
    stream.write_all(request.as_bytes()).await?;

    let response = read_response(&mut stream).await?;
    match classify_response(&response) {
        Ok(()) => Ok(SourceConnection {
            stream,
            listener_url: format!("http://{}:{}{}", host, port, mount),
        }),
        Err(e) => Err(e),
    }
}

/// Accumulates response bytes until the header terminator or the size cap.
async fn read_response(stream: &mut TcpStream) -> Result<String, SourceClientError> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
        if collected.windows(4).any(|w| w == b"\r\n\r\n") || collected.len() >= MAX_RESPONSE_BYTES {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&collected).into_owned())
}

/// Finds the first line carrying a 3-digit status and maps it.
fn classify_response(response: &str) -> Result<(), SourceClientError> {
    if response.contains("200 OK") {
        return Ok(());
    }
    let status_line = response.lines().find_map(|line| {
        line.split_whitespace()
            .find(|tok| tok.len() == 3 && tok.chars().all(|c| c.is_ascii_digit()))
            .map(|code| (line.trim().to_string(), code.parse::<u16>().unwrap_or(0)))
    });
    match status_line {
        Some((_, code)) if (200..300).contains(&code) => Ok(()),
        Some((_, 401)) => Err(SourceClientError::AuthFailed),
        Some((_, 403)) => Err(SourceClientError::MountBusy),
        Some((line, _)) => Err(SourceClientError::Protocol(line)),
        None => Err(SourceClientError::Protocol(format!(
            "unrecognized response: {}",
            response.lines().next().unwrap_or("").trim()
        ))),
    }
}

/// Normalizes a mount point: accepts a bare path or a full URL, strips query
/// and fragment, forces a single leading slash, collapses duplicate slashes,
/// and drops the trailing slash unless it is the whole path.
#[must_use]
pub fn normalize_mount(raw: &str) -> String {
    let mut path = match raw.split_once("://") {
        Some((_, rest)) => match rest.find('/') {
            Some(i) => rest[i..].to_string(),
            None => "/".to_string(),
        },
        None => raw.to_string(),
    };
    if let Some(i) = path.find(['?', '#']) {
        path.truncate(i);
    }
    let mut normalized = String::with_capacity(path.len() + 1);
    normalized.push('/');
    let mut prev_slash = true;
    for c in path.chars() {
        if c == '/' {
            if !prev_slash {
                normalized.push('/');
            }
            prev_slash = true;
        } else {
            normalized.push(c);
            prev_slash = false;
        }
    }
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Extracts `(host, port?, path?)` from a host field that may be a full URL.
#[must_use]
pub fn normalize_host(raw: &str) -> (String, Option<u16>, Option<String>) {
    let rest = match raw.split_once("://") {
        Some((_, rest)) => rest,
        None => raw,
    };
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], Some(rest[i..].to_string())),
        None => (rest, None),
    };
    let path = path.filter(|p| p != "/");
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), Some(port), path),
            Err(_) => (authority.to_string(), None, path),
        },
        None => (authority.to_string(), None, path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn mount_normalization() {
        assert_eq!(normalize_mount("/live"), "/live");
        assert_eq!(normalize_mount("live"), "/live");
        assert_eq!(normalize_mount("//live//set/"), "/live/set");
        assert_eq!(normalize_mount("/live?token=x#frag"), "/live");
        assert_eq!(normalize_mount("http://srv:8000/live"), "/live");
        assert_eq!(normalize_mount("http://srv:8000"), "/");
        assert_eq!(normalize_mount("/"), "/");
    }

    #[test]
    fn host_normalization() {
        assert_eq!(
            normalize_host("icecast.example"),
            ("icecast.example".to_string(), None, None)
        );
        assert_eq!(
            normalize_host("http://icecast.example:8000/live"),
            (
                "icecast.example".to_string(),
                Some(8000),
                Some("/live".to_string())
            )
        );
        assert_eq!(
            normalize_host("icecast.example:9000"),
            ("icecast.example".to_string(), Some(9000), None)
        );
    }

    #[test]
    fn response_classification() {
        assert!(classify_response("HTTP/1.0 200 OK\r\nServer:Icecast\r\n\r\n").is_ok());
        assert!(classify_response("HTTP/1.1 204 No Content\r\n\r\n").is_ok());
        assert!(matches!(
            classify_response("HTTP/1.0 401 Unauthorized\r\n\r\n"),
            Err(SourceClientError::AuthFailed)
        ));
        assert!(matches!(
            classify_response("HTTP/1.0 403 Forbidden\r\n\r\n"),
            Err(SourceClientError::MountBusy)
        ));
        assert!(matches!(
            classify_response("HTTP/1.0 500 Internal Server Error\r\n\r\n"),
            Err(SourceClientError::Protocol(_))
        ));
        assert!(matches!(
            classify_response("garbage"),
            Err(SourceClientError::Protocol(_))
        ));
    }

    /// End-to-end handshake against an in-process mock server that checks the
    /// exact header block.
    #[tokio::test]
    async fn handshake_against_mock_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 2048];
            let n = sock.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            sock.write_all(b"HTTP/1.0 200 OK\r\nServer:Icecast\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let credentials = SourceCredentials {
            host: "127.0.0.1".into(),
            port: Some(addr.port()),
            mount: Some("/live".into()),
            password: "pw".into(),
            user: None,
            name: Some("My Stream".into()),
            stream_id: None,
        };
        let conn = connect(&credentials).await.unwrap();
        assert_eq!(
            conn.listener_url,
            format!("http://127.0.0.1:{}/live", addr.port())
        );

        let request = server.await.unwrap();
        assert!(request.starts_with("SOURCE /live HTTP/1.0\r\n"));
        assert!(request.contains("content-type: audio/mpeg\r\n"));
        let expected_auth = STANDARD.encode("source:pw");
        assert!(request.contains(&format!("Authorization: Basic {}\r\n", expected_auth)));
        assert!(request.contains("ice-name: My Stream\r\n"));
        assert!(request.contains("ice-public: 0\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn rejected_password_maps_to_auth_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 2048];
            let _ = sock.read(&mut buf).await;
            let _ = sock
                .write_all(b"HTTP/1.0 401 Unauthorized\r\n\r\n")
                .await;
        });

        let credentials = SourceCredentials {
            host: "127.0.0.1".into(),
            port: Some(addr.port()),
            mount: Some("/live".into()),
            password: "wrong".into(),
            user: None,
            name: None,
            stream_id: None,
        };
        assert!(matches!(
            connect(&credentials).await,
            Err(SourceClientError::AuthFailed)
        ));
    }
}
