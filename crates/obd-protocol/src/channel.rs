//! Half-duplex command channel
//!
//! Serializes one command at a time onto the adapter byte-stream and hands
//! the next complete inbound frame back to whoever issued it. There is a
//! single pending slot; a second `send` while it is occupied fails with
//! [`ChannelError::Busy`] instead of queuing.

use crate::error::ChannelError;
use crate::response::{clean_frame, error_marker, PROMPT, TERMINATOR};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default timeout for OBD commands
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Bidirectional byte-stream to an adapter
pub trait AdapterStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AdapterStream for T {}

/// Boxed adapter stream, as produced by transport factories
pub type BoxedStream = Box<dyn AdapterStream>;

/// The command currently awaiting its response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub command_text: String,
    pub submitted_at: Instant,
    pub timeout_ms: u64,
}

struct Slot {
    id: u64,
    command: PendingCommand,
    responder: oneshot::Sender<Result<String, ChannelError>>,
}

struct Shared {
    slot: Mutex<Option<Slot>>,
    next_id: AtomicU64,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Option<Slot>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand a complete frame to the pending command, if there is one
    fn resolve(&self, raw: &[u8]) {
        let Some(slot) = self.slot().take() else {
            debug!(
                "Discarding unsolicited frame: {:?}",
                String::from_utf8_lossy(raw)
            );
            return;
        };

        let response = clean_frame(raw, &slot.command.command_text);
        debug!(command = %slot.command.command_text, %response, "Adapter response");

        let result = match error_marker(&response) {
            Some(marker) => {
                debug!(command = %slot.command.command_text, marker, "Adapter reported failure");
                Err(ChannelError::AdapterError(response))
            }
            None => Ok(response),
        };
        let _ = slot.responder.send(result);
    }

    /// Reject the pending command with the given error
    fn reject(&self, error: ChannelError) -> bool {
        match self.slot().take() {
            Some(slot) => {
                debug!(command = %slot.command.command_text, %error, "Rejecting pending command");
                let _ = slot.responder.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Clear the slot only if it still belongs to the given command
    fn clear(&self, id: u64) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|s| s.id == id) {
            *slot = None;
        }
    }
}

/// Frees the pending slot when the `send` that filled it ends, however it ends
struct SlotGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.shared.clear(self.id);
    }
}

/// Single-slot request/response channel over an adapter byte-stream
pub struct CommandChannel {
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    default_timeout_ms: u64,
}

impl CommandChannel {
    /// Take ownership of a byte-stream and start the inbound frame reader
    pub fn new(stream: BoxedStream, default_timeout_ms: u64) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            slot: Mutex::new(None),
            next_id: AtomicU64::new(0),
            closed,
        });

        let reader = tokio::spawn(read_frames(read_half, shared.clone()));

        Self {
            writer: tokio::sync::Mutex::new(write_half),
            shared,
            reader,
            default_timeout_ms,
        }
    }

    /// Default per-command timeout in milliseconds
    pub fn default_timeout_ms(&self) -> u64 {
        self.default_timeout_ms
    }

    /// Send a command and wait for its response frame
    ///
    /// Responses carrying an adapter error marker are returned as
    /// [`ChannelError::AdapterError`].
    pub async fn send(&self, command: &str, timeout_ms: u64) -> Result<String, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let (responder, response) = oneshot::channel();
        let id = {
            let mut slot = self.shared.slot();
            if slot.is_some() {
                return Err(ChannelError::Busy);
            }
            let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            *slot = Some(Slot {
                id,
                command: PendingCommand {
                    command_text: command.to_string(),
                    submitted_at: Instant::now(),
                    timeout_ms,
                },
                responder,
            });
            id
        };
        let _guard = SlotGuard {
            shared: self.shared.clone(),
            id,
        };

        metrics::counter!("obd_commands_sent_total").increment(1);
        debug!(command, timeout_ms, "Sending to adapter");

        let exchange = async {
            self.write_command(command).await?;
            response.await.unwrap_or(Err(ChannelError::Cancelled))
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), exchange).await {
            Ok(Err(ChannelError::Transport(reason))) => {
                warn!(command, %reason, "Failed to write command");
                Err(ChannelError::Transport(reason))
            }
            Ok(result) => result,
            Err(_) => {
                metrics::counter!("obd_command_timeouts_total").increment(1);
                warn!(command, timeout_ms, "Command timed out");
                Err(ChannelError::Timeout(timeout_ms))
            }
        }
    }

    async fn write_command(&self, command: &str) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(format!("{command}{TERMINATOR}").as_bytes())
            .await?;
        writer.flush().await?;
        Ok(())
    }

    /// Snapshot of the outstanding command, if any
    pub fn pending(&self) -> Option<PendingCommand> {
        self.shared.slot().as_ref().map(|slot| slot.command.clone())
    }

    /// Reject the outstanding command with [`ChannelError::Cancelled`]
    ///
    /// Returns whether a command was pending.
    pub fn cancel(&self) -> bool {
        self.shared.reject(ChannelError::Cancelled)
    }

    /// Whether the byte-stream has ended or the channel was closed
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the byte-stream has ended or the channel was closed
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Cancel any pending command and shut the byte-stream down
    pub async fn close(&self) -> Result<(), ChannelError> {
        self.cancel();
        self.shared.closed.send_replace(true);
        self.reader.abort();

        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        info!("Command channel closed");
        Ok(())
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Accumulate inbound bytes and dispatch each prompt-terminated frame
async fn read_frames(mut reader: ReadHalf<BoxedStream>, shared: Arc<Shared>) {
    let mut buffer = Vec::with_capacity(256);
    let mut chunk = [0u8; 128];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                info!("Adapter closed the byte-stream");
                break;
            }
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                while let Some(pos) = buffer.iter().position(|&b| b == PROMPT) {
                    let frame: Vec<u8> = buffer.drain(..=pos).collect();
                    shared.resolve(&frame[..pos]);
                }
            }
            Err(e) => {
                warn!("Error reading from adapter: {}", e);
                break;
            }
        }
    }

    shared.closed.send_replace(true);
    shared.reject(ChannelError::Closed);
}
