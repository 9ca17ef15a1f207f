//! External-relay endpoint: `/integration-stream`.
//!
//! A duplex connection that pipes the broadcaster's audio into a
//! source-client connection (C2). Handshake: authenticate via session
//! cookie, receive one init frame naming the server type and credentials,
//! connect, then forward binary frames verbatim until either side dies.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use axum::response::Response;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::api::ws::ServerMessage;
use crate::api::AppState;
use crate::protocol_constants::{
    CLOSE_UNAUTHENTICATED, FIRST_AUDIO_TIMEOUT_SECS, MAX_SIGNAL_FRAME_BYTES,
};
use crate::room::IntegrationInfo;
use crate::source_client::{self, SourceCredentials, SourceKind};

/// First frame of the handshake.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntegrationInit {
    #[serde(rename = "type")]
    kind: SourceKind,
    credentials: SourceCredentials,
    #[serde(default)]
    room_id: Option<String>,
    #[serde(default)]
    stream_quality: Option<String>,
}

pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let ws = ws.max_message_size(MAX_SIGNAL_FRAME_BYTES);
    let authed = headers
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|c| state.sessions.validate_cookie_header(c))
        .is_some();
    if !authed {
        log::warn!("[Integration] Rejecting unauthenticated connection");
        return ws.on_upgrade(|mut socket| async move {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_UNAUTHENTICATED,
                    reason: "authentication required".into(),
                })))
                .await;
        });
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // Anything before a parseable init object is ignored.
    let init: IntegrationInit = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                Ok(init) => break init,
                Err(e) => log::debug!("[Integration] Ignoring pre-init frame: {}", e),
            },
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    };
    if let Some(quality) = &init.stream_quality {
        log::debug!("[Integration] Requested stream quality: {}", quality);
    }

    let connection = match source_client::connect(init.kind, &init.credentials).await {
        Ok(conn) => conn,
        Err(e) => {
            log::warn!("[Integration] Source connect failed ({}): {}", e.kind(), e);
            let _ = sink
                .send(text_frame(&json!({ "type": "error", "error": e.to_string() })))
                .await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    let mut source = connection.stream;
    let listener_url = connection.listener_url;
    log::info!("[Integration] Connected, listeners at {}", listener_url);

    let _ = sink.send(text_frame(&json!({ "type": "connected" }))).await;

    if let Some(room_id) = &init.room_id {
        // Preserve a relay URL the room may already have announced.
        let local_stream_url = state
            .registry
            .get_integration_info(room_id)
            .and_then(|info| info.local_stream_url);
        state.registry.set_integration_info(
            room_id,
            IntegrationInfo {
                kind: Some(init.kind),
                credentials: Some(init.credentials.clone()),
                listener_url: Some(listener_url.clone()),
                local_stream_url,
            },
        );
        for (_, receiver) in state.registry.list_receivers(room_id) {
            receiver.send(&ServerMessage::StreamUrl {
                url: listener_url.clone(),
            });
        }
    }

    // Pump loop: client binary -> source socket. The source side is only
    // read to detect its death; DNAS servers occasionally chatter.
    let first_audio_deadline = tokio::time::sleep(Duration::from_secs(FIRST_AUDIO_TIMEOUT_SECS));
    tokio::pin!(first_audio_deadline);
    let mut got_audio = false;
    let mut source_buf = [0u8; 1024];

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    got_audio = true;
                    if let Err(e) = source.write_all(&data).await {
                        log::warn!("[Integration] Source write failed: {}", e);
                        let _ = sink
                            .send(text_frame(&json!({ "type": "error", "error": e.to_string() })))
                            .await;
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    log::debug!("[Integration] Ignoring text frame mid-stream: {}", text);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    log::info!("[Integration] Client disconnected");
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = &mut first_audio_deadline, if !got_audio => {
                log::warn!("[Integration] Closing: no audio within {}s", FIRST_AUDIO_TIMEOUT_SECS);
                let _ = sink
                    .send(text_frame(&json!({
                        "type": "error",
                        "error": "integration stream timed out: no audio data received",
                    })))
                    .await;
                break;
            },
            read = source.read(&mut source_buf) => match read {
                Ok(0) | Err(_) => {
                    log::warn!("[Integration] Source connection closed");
                    let _ = sink
                        .send(text_frame(&json!({
                            "type": "error",
                            "error": "external server closed the connection",
                        })))
                        .await;
                    break;
                }
                Ok(_) => {}
            },
        }
    }

    // Teardown both sides and forget the external server.
    drop(source);
    let _ = sink.send(Message::Close(None)).await;
    if let Some(room_id) = &init.room_id {
        state.registry.clear_external_integration(room_id);
    }
}

fn text_frame(value: &serde_json::Value) -> Message {
    Message::Text(value.to_string().into())
}
