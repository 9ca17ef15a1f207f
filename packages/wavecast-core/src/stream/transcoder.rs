//! Per-room transcoder child process.
//!
//! Wraps one instance of the external transcoding utility (ffmpeg semantics):
//! encoded audio in on stdin, MP3 out on stdout in small flushed packets.
//! Every pipe interaction is guarded: a dying child must never take a room
//! down with it. The supervisor only reports failure; the ingest path decides
//! when to lazily restart.

use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::room::RoomRegistry;

/// Stdout read buffer size. Small enough to keep listener latency low.
const PUMP_BUF_SIZE: usize = 4096;

/// How long a stopped child gets to flush and exit on SIGTERM before it is
/// killed outright.
const TERM_GRACE_SECS: u64 = 5;

/// Handle to a running transcoder child.
pub struct Transcoder {
    /// Feed to the stdin writer task; `None` after `stop()`.
    stdin_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    alive: Arc<AtomicBool>,
    stop_token: CancellationToken,
}

impl Transcoder {
    /// Spawns the child and its pump tasks. Emitted MP3 chunks fan out to the
    /// room's relay listeners through the registry.
    pub fn spawn(
        bin: &str,
        registry: Arc<RoomRegistry>,
        room_id: String,
    ) -> io::Result<Arc<Self>> {
        let mut child = Command::new(bin)
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                // Keep the input probe small so the stream becomes playable
                // quickly; live input has no known duration.
                "-fflags",
                "+nobuffer",
                "-analyzeduration",
                "0",
                "-probesize",
                "4096",
                "-i",
                "pipe:0",
                "-f",
                "mp3",
                "-b:a",
                "128k",
                "-ar",
                "44100",
                "-ac",
                "2",
                "-flush_packets",
                "1",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("transcoder stdin unavailable"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("transcoder stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("transcoder stderr unavailable"))?;

        let alive = Arc::new(AtomicBool::new(true));
        let stop_token = CancellationToken::new();
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Bytes>();

        log::info!("[Transcoder] Started for room {} ({})", room_id, bin);

        // Stdin writer: the only task touching the pipe, which totally orders
        // ingest writes. A broken pipe ends the task; the error never
        // propagates past it.
        {
            let alive = Arc::clone(&alive);
            let room_id = room_id.clone();
            tokio::spawn(async move {
                while let Some(frame) = stdin_rx.recv().await {
                    if let Err(e) = stdin.write_all(&frame).await {
                        log::debug!("[Transcoder] stdin write for {} failed: {}", room_id, e);
                        alive.store(false, Ordering::Relaxed);
                        break;
                    }
                }
                // Channel closed or pipe broke: dropping stdin signals EOF.
            });
        }

        // Stdout pump: distribute every emitted chunk to the room's listeners.
        {
            let alive = Arc::clone(&alive);
            let registry = Arc::clone(&registry);
            let room_id = room_id.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; PUMP_BUF_SIZE];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => registry.fan_out_audio(&room_id, &buf[..n]),
                    }
                }
                alive.store(false, Ordering::Relaxed);
                log::debug!("[Transcoder] Output pump for {} ended", room_id);
            });
        }

        // Stderr drain, line by line.
        {
            let room_id = room_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("[Transcoder] {} stderr: {}", room_id, line);
                }
            });
        }

        // Exit watcher: reap the child. On stop() it gets SIGTERM and a
        // grace period to flush its last packet; SIGKILL only if it lingers.
        {
            let alive = Arc::clone(&alive);
            let token = stop_token.clone();
            tokio::spawn(async move {
                let finished = tokio::select! {
                    status = child.wait() => Some(status),
                    _ = token.cancelled() => None,
                };
                let status = match finished {
                    Some(status) => status,
                    None => {
                        send_sigterm(&mut child);
                        match tokio::time::timeout(
                            Duration::from_secs(TERM_GRACE_SECS),
                            child.wait(),
                        )
                        .await
                        {
                            Ok(status) => status,
                            Err(_) => {
                                log::warn!(
                                    "[Transcoder] {} ignored SIGTERM for {}s, killing",
                                    room_id,
                                    TERM_GRACE_SECS
                                );
                                let _ = child.start_kill();
                                child.wait().await
                            }
                        }
                    }
                };
                alive.store(false, Ordering::Relaxed);
                match status {
                    Ok(s) if s.success() || s.code().is_none() => {
                        // Signal-terminated exits are the normal stop path.
                        log::debug!("[Transcoder] {} exited: {}", room_id, s);
                    }
                    Ok(s) => log::warn!("[Transcoder] {} exited abnormally: {}", room_id, s),
                    Err(e) => log::warn!("[Transcoder] {} wait failed: {}", room_id, e),
                }
            });
        }

        Ok(Arc::new(Self {
            stdin_tx: Mutex::new(Some(stdin_tx)),
            alive,
            stop_token,
        }))
    }

    /// Queues one ingested frame for the child's stdin. Returns `false` when
    /// the child is gone; the caller resets its handle and restarts lazily.
    pub fn write(&self, frame: Bytes) -> bool {
        if !self.alive.load(Ordering::Relaxed) {
            return false;
        }
        let tx = self.stdin_tx.lock();
        match tx.as_ref() {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Stops the child: close stdin (EOF), then SIGTERM; SIGKILL follows
    /// only if the child outlives the grace period. Idempotent.
    pub fn stop(&self) {
        self.stdin_tx.lock().take();
        self.stop_token.cancel();
    }
}

/// Delivers SIGTERM so the child can flush its in-flight output packet.
#[cfg(unix)]
fn send_sigterm(child: &mut tokio::process::Child) {
    let Some(pid) = child.id() else {
        // Already reaped; nothing to signal.
        return;
    };
    // SAFETY: kill(2) with a live pid and a valid signal touches no memory.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        log::debug!(
            "[Transcoder] SIGTERM to pid {} failed: {}",
            pid,
            io::Error::last_os_error()
        );
    }
}

/// Windows has no SIGTERM; the grace period degrades to an immediate kill
/// via the escalation path.
#[cfg(not(unix))]
fn send_sigterm(child: &mut tokio::process::Child) {
    let _ = child.start_kill();
}

impl Drop for Transcoder {
    fn drop(&mut self) {
        self.stop();
    }
}
