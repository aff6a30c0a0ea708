//! Binary TCP control channel for a live streaming session.
//!
//! # Lifecycle
//!
//! ```text
//! 1. ControlStream::connect(host, events)        Disconnected
//! 2. stream.start()                              Handshaking → Established
//!       ├─ HELLO, CONFIG, keepalive ping/pong, probe
//!       └─ spawns the 3 s heartbeat task
//! 3. stream.start_jitter_packets()               (once streaming begins)
//! 4. stream.request_resync()                     (decoder lost sync)
//! 5. stream.abort()                              Aborting → Closed
//! ```
//!
//! Heartbeat and jitter run as independent background tasks; either one's
//! I/O failure tears the session down and is reported once over the event
//! channel for the owning session controller to handle. Nothing is retried
//! locally.

pub mod packet;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use packet::{
    config_payload, read_packet, write_packet, CtlPacket, HELLO_PAYLOAD, PTYPE_CONFIG,
    PTYPE_HEARTBEAT, PTYPE_HELLO, PTYPE_JITTER, PTYPE_KEEPALIVE, PTYPE_PROBE, PTYPE_RESYNC,
};

pub const CONTROL_PORT: u16 = 47995;
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
const JITTER_INTERVAL: Duration = Duration::from_millis(100);

// MARK: - ControlError

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("socket closed prematurely")]
    SocketClosed,

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// MARK: - ControlEvent

/// Events reported to the owning session controller.
#[derive(Debug)]
pub enum ControlEvent {
    /// A background task hit a fatal I/O error; the session is gone.
    ConnectionTerminated(ControlError),
}

// MARK: - ControlState

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Disconnected,
    Handshaking,
    Established,
    Aborting,
    Closed,
}

// MARK: - ControlStream

/// Owns the one TCP socket of a session's control channel.
pub struct ControlStream {
    reader: Arc<Mutex<OwnedReadHalf>>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    state: Arc<StdMutex<ControlState>>,
    jitter_seq: Arc<AtomicU32>,
    aborting: Arc<AtomicBool>,
    heartbeat_task: StdMutex<Option<JoinHandle<()>>>,
    jitter_task: StdMutex<Option<JoinHandle<()>>>,
    events: mpsc::Sender<ControlEvent>,
}

impl ControlStream {
    /// Open the control socket to `host:port` (port 0 selects the default).
    pub async fn connect(
        host: &str,
        port: u16,
        events: mpsc::Sender<ControlEvent>,
    ) -> Result<Self, ControlError> {
        let port = if port != 0 { port } else { CONTROL_PORT };
        let stream = timeout(CONTROL_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ControlError::Timeout {
                ms: CONTROL_TIMEOUT.as_millis() as u64,
            })??;
        stream.set_nodelay(true)?;
        info!("Control channel connected to {host}:{port}");

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            state: Arc::new(StdMutex::new(ControlState::Disconnected)),
            jitter_seq: Arc::new(AtomicU32::new(0)),
            aborting: Arc::new(AtomicBool::new(false)),
            heartbeat_task: StdMutex::new(None),
            jitter_task: StdMutex::new(None),
            events,
        })
    }

    pub fn state(&self) -> ControlState {
        *self.state.lock().expect("control state lock")
    }

    fn set_state(&self, state: ControlState) {
        *self.state.lock().expect("control state lock") = state;
    }

    // ── Handshake ─────────────────────────────────────────────────────────────

    /// Run the handshake and start the heartbeat task.
    pub async fn start(&self) -> Result<(), ControlError> {
        self.set_state(ControlState::Handshaking);

        {
            let mut writer = self.writer.lock().await;
            let mut reader = self.reader.lock().await;

            write_packet(&mut *writer, PTYPE_HELLO, 4, &HELLO_PAYLOAD).await?;
            // The CONFIG header declares a length of 4 even though the whole
            // table follows; the host depends on this exact layout.
            write_packet(&mut *writer, PTYPE_CONFIG, 4, &config_payload()).await?;

            write_packet(&mut *writer, PTYPE_KEEPALIVE, 0, &[]).await?;
            let pong = self.read_reply(&mut reader).await?;
            debug!("Keepalive pong: type {:#06x}", pong.ptype);

            write_packet(&mut *writer, PTYPE_PROBE, 0, &[]).await?;
            let probe = self.read_reply(&mut reader).await?;
            debug!("Probe reply: type {:#06x}", probe.ptype);
        }

        self.set_state(ControlState::Established);
        info!("Control handshake complete");

        let writer = Arc::clone(&self.writer);
        let aborting = Arc::clone(&self.aborting);
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                let result = {
                    let mut writer = writer.lock().await;
                    write_packet(&mut *writer, PTYPE_HEARTBEAT, 0, &[]).await
                };
                if let Err(e) = result {
                    report_terminated(&aborting, &events, ControlError::Io(e)).await;
                    return;
                }
            }
        });
        *self.heartbeat_task.lock().expect("heartbeat task lock") = Some(handle);

        Ok(())
    }

    // ── Jitter ────────────────────────────────────────────────────────────────

    /// Start the 100 ms jitter-probe task. Called once streaming actually
    /// begins; the handshake heartbeat alone keeps the channel alive before
    /// that.
    pub fn start_jitter_packets(&self) {
        let writer = Arc::clone(&self.writer);
        let seq = Arc::clone(&self.jitter_seq);
        let aborting = Arc::clone(&self.aborting);
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JITTER_INTERVAL);
            loop {
                ticker.tick().await;

                let mut payload = [0u8; 16];
                payload[4..8].copy_from_slice(&77u32.to_le_bytes());
                payload[8..12].copy_from_slice(&888u32.to_le_bytes());
                // Sequence numbers advance by two per probe.
                let next = seq.fetch_add(2, Ordering::SeqCst) + 2;
                payload[12..16].copy_from_slice(&next.to_le_bytes());

                let result = {
                    let mut writer = writer.lock().await;
                    write_packet(&mut *writer, PTYPE_JITTER, 16, &payload).await
                };
                if let Err(e) = result {
                    report_terminated(&aborting, &events, ControlError::Io(e)).await;
                    return;
                }
            }
        });
        *self.jitter_task.lock().expect("jitter task lock") = Some(handle);
    }

    // ── Resync ────────────────────────────────────────────────────────────────

    /// Ask the host for a fresh keyframe and await its acknowledgement.
    ///
    /// Triggered by the decoder layer when it detects unrecoverable loss;
    /// this is an expected control message, not an error path. The payload is
    /// two 8-byte fields, currently a full-range marker.
    pub async fn request_resync(&self) -> Result<CtlPacket, ControlError> {
        info!("Requesting IDR frame");

        let mut payload = [0u8; 16];
        payload[8..16].copy_from_slice(&0xFFFFu64.to_le_bytes());

        let mut writer = self.writer.lock().await;
        let mut reader = self.reader.lock().await;
        write_packet(&mut *writer, PTYPE_RESYNC, 16, &payload).await?;
        self.read_reply(&mut reader).await
    }

    async fn read_reply(&self, reader: &mut OwnedReadHalf) -> Result<CtlPacket, ControlError> {
        timeout(CONTROL_TIMEOUT, read_packet(reader))
            .await
            .map_err(|_| ControlError::Timeout {
                ms: CONTROL_TIMEOUT.as_millis() as u64,
            })?
    }

    // ── Abort ─────────────────────────────────────────────────────────────────

    /// Tear the session down: stop both background tasks and close the
    /// socket. Safe to call any number of times; only the first does work.
    pub async fn abort(&self) {
        if self.aborting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ControlState::Aborting);

        if let Some(task) = self.jitter_task.lock().expect("jitter task lock").take() {
            task.abort();
        }
        if let Some(task) = self.heartbeat_task.lock().expect("heartbeat task lock").take() {
            task.abort();
        }

        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!("Control socket shutdown: {e}");
        }
        self.set_state(ControlState::Closed);
        info!("Control channel closed");
    }
}

/// Report a fatal task error upward exactly once — and not at all when it is
/// our own abort tearing the socket out from under the task.
async fn report_terminated(
    aborting: &AtomicBool,
    events: &mpsc::Sender<ControlEvent>,
    error: ControlError,
) {
    if aborting.load(Ordering::SeqCst) {
        return;
    }
    warn!("Control task failed: {error}");
    if events
        .send(ControlEvent::ConnectionTerminated(error))
        .await
        .is_err()
    {
        debug!("Session owner is gone; dropping termination report");
    }
}
