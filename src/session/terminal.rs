//! Terminal I/O pump
//!
//! One interactive shell is driven by two tasks sharing a cancellation
//! token:
//!
//! - the output task reads the shell's byte stream and decodes it into
//!   UTF-8 text units (undecodable bytes are dropped, not fatal);
//! - the send task appends units to a buffer and, on every tick of a fixed
//!   interval, flushes the buffer to the client as a single `stdout`
//!   message.
//!
//! Client input (`stdin`, `resize`, `ping`) is applied by the caller's own
//! receive loop through [`TerminalSession::handle_message`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SessionError;

const READ_BUFFER_SIZE: usize = 8192;
const UNIT_CHANNEL_CAPACITY: usize = 1024;

/// Client-facing message operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Resize,
    Stdin,
    Stdout,
    Ping,
}

/// Client-facing envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalMessage {
    pub operation: Operation,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub cols: u16,
    #[serde(default)]
    pub rows: u16,
}

impl TerminalMessage {
    pub fn stdout(data: impl Into<String>) -> Self {
        Self {
            operation: Operation::Stdout,
            data: data.into(),
            cols: 0,
            rows: 0,
        }
    }

    pub fn stdin(data: impl Into<String>) -> Self {
        Self {
            operation: Operation::Stdin,
            data: data.into(),
            cols: 0,
            rows: 0,
        }
    }

    pub fn resize(cols: u16, rows: u16) -> Self {
        Self {
            operation: Operation::Resize,
            data: String::new(),
            cols,
            rows,
        }
    }

    pub fn ping() -> Self {
        Self {
            operation: Operation::Ping,
            data: String::new(),
            cols: 0,
            rows: 0,
        }
    }
}

/// Terminal geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Destination for outgoing terminal messages
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, message: TerminalMessage) -> Result<(), SessionError>;
}

#[async_trait]
impl MessageSink for mpsc::Sender<TerminalMessage> {
    async fn send(&self, message: TerminalMessage) -> Result<(), SessionError> {
        mpsc::Sender::send(self, message)
            .await
            .map_err(|_| SessionError::Sink("receiver dropped".to_string()))
    }
}

/// Control side of a remote shell
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Write raw bytes to the shell's input
    async fn write_stdin(&self, data: &[u8]) -> Result<(), SessionError>;

    /// Send a window-change request
    async fn window_change(&self, cols: u16, rows: u16) -> Result<(), SessionError>;

    /// Keepalive on the underlying connection; does not touch the shell
    async fn keepalive(&self) -> Result<(), SessionError>;

    /// Close the remote shell, which also ends its output stream
    async fn close(&self) -> Result<(), SessionError>;
}

/// Incremental UTF-8 decoder
///
/// Complete characters are emitted, invalid sequences are dropped and an
/// incomplete trailing sequence is held until the next chunk arrives.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        let mut start = 0;

        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(text) => {
                    out.push_str(text);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // Safe: from_utf8 validated this prefix.
                    if let Ok(text) = std::str::from_utf8(&self.pending[start..start + valid]) {
                        out.push_str(text);
                    }
                    match e.error_len() {
                        Some(bad) => {
                            debug!("Dropping {} undecodable output byte(s)", bad);
                            start += valid + bad;
                        }
                        None => {
                            start += valid;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..start);
        out
    }
}

/// A running terminal pump
pub struct TerminalSession {
    shell: Arc<dyn RemoteShell>,
    cancel: CancellationToken,
    /// Cancelled when the send task exits
    done: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl TerminalSession {
    /// Start the output and send tasks
    pub fn start<R>(
        shell: Arc<dyn RemoteShell>,
        output: R,
        sink: Arc<dyn MessageSink>,
        flush_interval: Duration,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let (unit_tx, unit_rx) = mpsc::channel::<String>(UNIT_CHANNEL_CAPACITY);

        let output_task = tokio::spawn(read_output(output, unit_tx, cancel.clone()));
        let send_task = tokio::spawn(send_batches(
            unit_rx,
            sink,
            flush_interval,
            cancel.clone(),
            done.clone(),
        ));

        info!("Terminal pump started (flush every {:?})", flush_interval);

        Self {
            shell,
            cancel,
            done,
            tasks: Mutex::new(vec![output_task, send_task]),
            stopped: AtomicBool::new(false),
        }
    }

    /// Apply one client message to the shell
    pub async fn handle_message(&self, message: TerminalMessage) -> Result<(), SessionError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        match message.operation {
            Operation::Stdin => self.shell.write_stdin(message.data.as_bytes()).await,
            Operation::Resize => {
                debug!("Resize to {}x{}", message.cols, message.rows);
                self.shell.window_change(message.cols, message.rows).await
            }
            Operation::Ping => self.shell.keepalive().await,
            Operation::Stdout => {
                debug!("Ignoring stdout message from client");
                Ok(())
            }
        }
    }

    /// Whether the pump is still delivering output
    pub fn is_running(&self) -> bool {
        !self.done.is_cancelled()
    }

    /// Resolves once the send task has exited (remote end closed, sink
    /// failure or stop)
    pub async fn finished(&self) {
        self.done.cancelled().await
    }

    /// Stop both tasks and close the remote shell. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        if let Err(e) = self.shell.close().await {
            debug!("Closing remote shell: {}", e);
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Terminal pump task failed: {}", e);
            }
        }
        info!("Terminal pump stopped");
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        // Tasks exit on their own once cancelled; the shell must be closed via stop().
        self.cancel.cancel();
    }
}

async fn read_output<R>(mut output: R, units: mpsc::Sender<String>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = Utf8Decoder::default();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = output.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!("Remote output stream ended");
                break;
            }
            Ok(n) => {
                let unit = decoder.decode(&buf[..n]);
                if unit.is_empty() {
                    continue;
                }
                if units.send(unit).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Remote output read failed: {}", e);
                cancel.cancel();
                break;
            }
        }
    }
}

async fn send_batches(
    mut units: mpsc::Receiver<String>,
    sink: Arc<dyn MessageSink>,
    flush_interval: Duration,
    cancel: CancellationToken,
    done: CancellationToken,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buffer = String::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            unit = units.recv() => match unit {
                Some(unit) => buffer.push_str(&unit),
                None => {
                    // Output ended normally: deliver what is left, once.
                    if !buffer.is_empty() {
                        let data = std::mem::take(&mut buffer);
                        if let Err(e) = sink.send(TerminalMessage::stdout(data)).await {
                            debug!("Final flush failed: {}", e);
                        }
                    }
                    break;
                }
            },

            _ = ticker.tick() => {
                if buffer.is_empty() {
                    continue;
                }
                let data = std::mem::take(&mut buffer);
                if let Err(e) = sink.send(TerminalMessage::stdout(data)).await {
                    warn!("Client sink failed, stopping pump: {}", e);
                    cancel.cancel();
                    break;
                }
            }
        }
    }

    done.cancel();
}
