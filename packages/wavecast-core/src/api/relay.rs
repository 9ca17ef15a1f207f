//! Relay endpoint: `GET /stream/{room_id}`.
//!
//! Serves the room's live audio to plain HTTP listeners. With a transcoder
//! configured the stream is MP3 with optional interleaved ICY metadata;
//! without one the original container bytes are passed through, prefixed
//! with the stored init segment so mid-stream joiners can decode.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::api::AppState;
use crate::error::CastError;
use crate::protocol_constants::{APP_NAME, ICY_METAINT, RELAY_BITRATE_KBPS, RELAY_SAMPLE_RATE};
use crate::room::RoomRegistry;
use crate::stream::{wants_icy_metadata, IcyWriter};

/// Response body that detaches its writer from the room when the listener
/// goes away.
struct ListenerBody {
    inner: UnboundedReceiverStream<Result<Bytes, io::Error>>,
    registry: Arc<RoomRegistry>,
    room_id: String,
    writer_id: u64,
}

impl Stream for ListenerBody {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for ListenerBody {
    fn drop(&mut self) {
        self.registry
            .remove_relay_listener(&self.room_id, self.writer_id);
        log::info!("[Relay] Listener left {}", self.room_id);
    }
}

pub async fn stream_room(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if !state.registry.room_exists(&room_id) {
        return CastError::RoomNotFound(room_id).into_response();
    }

    let transcoding = state.config.transcoding_enabled();
    let icy_enabled = transcoding && wants_icy_metadata(&headers);
    let now_playing = state
        .registry
        .get_metadata(&room_id)
        .map(|(text, _)| text)
        .unwrap_or_default();

    let (writer, rx) = IcyWriter::channel(icy_enabled, &now_playing);

    // Passthrough joiners need the container init segment before live bytes.
    if !transcoding {
        if let Some(init) = state.registry.relay_header(&room_id) {
            writer.write(&init);
        }
    }

    if state
        .registry
        .add_relay_listener(&room_id, Arc::clone(&writer))
    {
        log::info!(
            "[Relay] Listener joined {} (icy={}, mode={})",
            room_id,
            icy_enabled,
            if transcoding { "mp3" } else { "passthrough" }
        );
    } else {
        // Room exists but is off-air: the body ends immediately.
        writer.end();
    }

    let body = ListenerBody {
        inner: UnboundedReceiverStream::new(rx),
        registry: Arc::clone(&state.registry),
        room_id,
        writer_id: writer.id(),
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            if transcoding { "audio/mpeg" } else { "audio/webm" },
        )
        .header(header::CONNECTION, "keep-alive")
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header("X-Accel-Buffering", "no");

    if transcoding {
        let icy_name = HeaderValue::from_str(&now_playing)
            .ok()
            .filter(|_| !now_playing.is_empty())
            .unwrap_or_else(|| HeaderValue::from_static(APP_NAME));
        builder = builder
            .header("icy-name", icy_name)
            .header("icy-genre", "Various")
            .header("icy-pub", "1")
            .header("icy-br", RELAY_BITRATE_KBPS.to_string())
            .header("icy-sr", RELAY_SAMPLE_RATE.to_string());
        if icy_enabled {
            builder = builder.header("icy-metaint", ICY_METAINT.to_string());
        }
    }

    builder
        .body(Body::from_stream(body))
        .unwrap_or_else(|e| CastError::Internal(e.to_string()).into_response())
}
