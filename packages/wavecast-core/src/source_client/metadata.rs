//! Song-title pushes to the external server's admin endpoint.
//!
//! Fire-and-forget: every failure is logged at warn and reported as `false`;
//! the broadcast itself is never affected.

use reqwest::Client;

use crate::source_client::icecast::{normalize_host, normalize_mount};
use crate::source_client::{SourceCredentials, SourceKind};

const DEFAULT_PORT: u16 = 8000;

/// Pushes `title` to the server's admin metadata endpoint. Returns whether
/// the server answered 2xx.
pub async fn push_title(
    client: &Client,
    kind: SourceKind,
    credentials: &SourceCredentials,
    title: &str,
) -> bool {
    let (host, inferred_port, inferred_path) = normalize_host(&credentials.host);
    let port = credentials.port.or(inferred_port).unwrap_or(DEFAULT_PORT);

    let result = match kind {
        SourceKind::Icecast => {
            let mount = normalize_mount(
                credentials
                    .mount
                    .as_deref()
                    .or(inferred_path.as_deref())
                    .unwrap_or("/stream"),
            );
            let url = format!("http://{}:{}/admin/metadata", host, port);
            client
                .get(url)
                .query(&[("mount", mount.as_str()), ("mode", "updinfo"), ("song", title)])
                .basic_auth(
                    credentials.user.as_deref().unwrap_or("source"),
                    Some(&credentials.password),
                )
                .send()
                .await
        }
        SourceKind::Shoutcast => {
            let url = format!("http://{}:{}/admin.cgi", host, port);
            client
                .get(url)
                .query(&[
                    ("mode", "updinfo"),
                    ("song", title),
                    ("pass", credentials.password.as_str()),
                ])
                .send()
                .await
        }
    };

    match result {
        Ok(resp) if resp.status().is_success() => {
            log::debug!("[SourceClient] Title pushed to {}: {}", host, title);
            true
        }
        Ok(resp) => {
            log::warn!(
                "[SourceClient] Title update to {} rejected: HTTP {}",
                host,
                resp.status()
            );
            false
        }
        Err(e) => {
            log::warn!("[SourceClient] Title update to {} failed: {}", host, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;

    /// Spins up a tiny admin endpoint and checks the query shape.
    #[tokio::test]
    async fn icecast_update_hits_admin_metadata() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<HashMap<String, String>>();
        let app = Router::new().route(
            "/admin/metadata",
            get(move |axum::extract::Query(q): axum::extract::Query<HashMap<String, String>>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(q);
                    "Updated"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let credentials = SourceCredentials {
            host: "127.0.0.1".into(),
            port: Some(addr.port()),
            mount: Some("/live".into()),
            password: "pw".into(),
            user: None,
            name: None,
            stream_id: None,
        };
        let ok = push_title(
            &Client::new(),
            SourceKind::Icecast,
            &credentials,
            "Artist - Song",
        )
        .await;
        assert!(ok);

        let query = rx.recv().await.unwrap();
        assert_eq!(query.get("mount").unwrap(), "/live");
        assert_eq!(query.get("mode").unwrap(), "updinfo");
        assert_eq!(query.get("song").unwrap(), "Artist - Song");
    }

    #[tokio::test]
    async fn unreachable_server_returns_false() {
        let credentials = SourceCredentials {
            // Reserved TEST-NET address; nothing listens there.
            host: "192.0.2.1".into(),
            port: Some(9),
            mount: None,
            password: "pw".into(),
            user: None,
            name: None,
            stream_id: None,
        };
        let client = Client::builder()
            .timeout(std::time::Duration::from_millis(300))
            .build()
            .unwrap();
        assert!(!push_title(&client, SourceKind::Shoutcast, &credentials, "t").await);
    }
}
