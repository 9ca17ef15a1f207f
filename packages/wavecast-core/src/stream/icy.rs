//! ICY (Shoutcast) metadata interleaving for relay listeners.
//!
//! Each HTTP listener gets one [`IcyWriter`] wrapping its response body.
//! When ICY is enabled the writer counts audio bytes and inserts a metadata
//! block after every `ICY_METAINT` of them; listeners that did not opt in get
//! the audio untouched.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::protocol_constants::ICY_METAINT;

static NEXT_WRITER_ID: AtomicU64 = AtomicU64::new(1);

/// Formats a title into an ICY metadata block.
///
/// Per the ICY convention the first byte is the number of 16-byte blocks,
/// followed by `StreamTitle='...';` NUL-padded to that length. An empty title
/// is a single zero byte.
#[must_use]
pub fn format_metadata_block(title: &str) -> Vec<u8> {
    if title.is_empty() {
        return vec![0];
    }
    let escaped = title.replace('\'', "\\'");
    let payload = format!("StreamTitle='{}';", escaped);
    let payload = payload.as_bytes();

    let num_blocks = payload.len().div_ceil(16);
    let padded_len = num_blocks * 16;

    let mut block = Vec::with_capacity(padded_len + 1);
    block.push(num_blocks as u8);
    block.extend_from_slice(payload);
    block.resize(padded_len + 1, 0);
    block
}

/// Extracts the title back out of a metadata block (tests, diagnostics).
#[must_use]
pub fn parse_metadata_block(block: &[u8]) -> Option<String> {
    let payload_len = (*block.first()? as usize) * 16;
    let payload = block.get(1..1 + payload_len)?;
    let text = std::str::from_utf8(payload).ok()?;
    let text = text.trim_end_matches('\0');
    let inner = text.strip_prefix("StreamTitle='")?.strip_suffix("';")?;
    Some(inner.replace("\\'", "'"))
}

struct IcyState {
    bytes_since_meta: usize,
    title: String,
    /// Formatted block for the current title, rebuilt on `set_title`.
    cached_block: Vec<u8>,
}

/// One listener's output stream with optional ICY metadata interleaving.
///
/// Writes are synchronous pushes into the listener's body channel; a closed
/// channel (listener went away) marks the writer dead. Dead writers are
/// pruned by the fan-out path.
pub struct IcyWriter {
    id: u64,
    icy_enabled: bool,
    state: Mutex<IcyState>,
    tx: Mutex<Option<mpsc::UnboundedSender<Result<Bytes, io::Error>>>>,
    dead: AtomicBool,
}

impl IcyWriter {
    /// Creates a writer and the body-side receiver for its frames.
    pub fn channel(
        icy_enabled: bool,
        initial_title: &str,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Result<Bytes, io::Error>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = Arc::new(Self {
            id: NEXT_WRITER_ID.fetch_add(1, Ordering::Relaxed),
            icy_enabled,
            state: Mutex::new(IcyState {
                bytes_since_meta: 0,
                title: initial_title.to_string(),
                cached_block: format_metadata_block(initial_title),
            }),
            tx: Mutex::new(Some(tx)),
            dead: AtomicBool::new(false),
        });
        (writer, rx)
    }

    /// Stable identity used to detach the writer from its room.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    /// Updates the title; the next metadata block carries it.
    pub fn set_title(&self, title: &str) {
        let mut state = self.state.lock();
        if state.title != title {
            state.title = title.to_string();
            state.cached_block = format_metadata_block(title);
        }
    }

    /// Writes audio bytes, inserting metadata blocks at the cadence.
    /// Returns `false` once the writer is dead; callers detach it then.
    pub fn write(&self, data: &[u8]) -> bool {
        if self.is_dead() {
            return false;
        }
        if !self.icy_enabled {
            return self.push(Bytes::copy_from_slice(data));
        }

        let mut out = BytesMut::with_capacity(data.len() + 64);
        {
            let mut state = self.state.lock();
            let mut remaining = data;
            while !remaining.is_empty() {
                let until_meta = ICY_METAINT - state.bytes_since_meta;
                if remaining.len() < until_meta {
                    out.extend_from_slice(remaining);
                    state.bytes_since_meta += remaining.len();
                    break;
                }
                out.extend_from_slice(&remaining[..until_meta]);
                out.extend_from_slice(&state.cached_block);
                remaining = &remaining[until_meta..];
                state.bytes_since_meta = 0;
            }
        }
        self.push(out.freeze())
    }

    /// Marks the writer dead and closes the body stream. Subsequent writes
    /// are no-ops.
    pub fn end(&self) {
        self.dead.store(true, Ordering::Relaxed);
        self.tx.lock().take();
    }

    fn push(&self, chunk: Bytes) -> bool {
        let mut tx = self.tx.lock();
        match tx.as_ref() {
            Some(sender) if sender.send(Ok(chunk)).is_ok() => true,
            _ => {
                self.dead.store(true, Ordering::Relaxed);
                *tx = None;
                false
            }
        }
    }
}
