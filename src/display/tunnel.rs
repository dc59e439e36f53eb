//! Display-protocol tunnel
//!
//! One TCP connection to the display daemon. After [`Tunnel::handshake`]
//! negotiates the connection, the tunnel carries raw instruction frames in
//! both directions until [`Tunnel::close`].
//!
//! Reads and writes use separate locks so a relay can block on `read` while
//! client input is written concurrently.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::DisplayError;
use super::instruction::{read_frame, Instruction};
use crate::config::GatewayConfig;

/// Audio capabilities advertised during the handshake
pub const AUDIO_MIMETYPES: [&str; 3] = ["audio/L16", "rate=44100", "channels=2"];

/// Image capabilities advertised during the handshake
pub const IMAGE_MIMETYPES: [&str; 3] = ["image/png", "image/jpeg", "image/webp"];

/// Audio stream announcements that the relay does not forward
const FILTERED_FRAMES: [&[u8]; 2] = [
    b"5.audio,1.1,31.audio/L16;rate=44100,channels=2;",
    b"5.audio,1.1,31.audio/L16;rate=22050,channels=2;",
];

/// Prefix of protocol version arguments, which are echoed back verbatim
const VERSION_PREFIX: &str = "VERSION_";

/// Per-connection handshake settings
#[derive(Clone)]
pub struct DisplayConfig {
    /// Backend protocol requested from the daemon (`rdp`, `vnc`, ...)
    pub protocol: String,
    /// Join this existing connection instead of opening a new one
    pub connection_id: Option<String>,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    pub timezone: String,
    /// Answers to the daemon's `args` request
    pub parameters: HashMap<String, String>,
}

impl DisplayConfig {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self::from_config(protocol, &GatewayConfig::default())
    }

    pub fn from_config(protocol: impl Into<String>, config: &GatewayConfig) -> Self {
        Self {
            protocol: protocol.into(),
            connection_id: None,
            width: config.display_width,
            height: config.display_height,
            dpi: config.display_dpi,
            timezone: config.display_timezone.clone(),
            parameters: HashMap::new(),
        }
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Value for one requested argument; unknown names resolve to ""
    fn resolve(&self, name: &str) -> String {
        if name.starts_with(VERSION_PREFIX) {
            return name.to_string();
        }
        self.parameters.get(name).cloned().unwrap_or_default()
    }
}

// Parameter values may carry credentials
impl fmt::Debug for DisplayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.parameters.keys().collect();
        names.sort();
        f.debug_struct("DisplayConfig")
            .field("protocol", &self.protocol)
            .field("connection_id", &self.connection_id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("dpi", &self.dpi)
            .field("timezone", &self.timezone)
            .field("parameters", &names)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    Ready,
    Failed,
}

/// Connection to the display daemon
pub struct Tunnel {
    address: String,
    config: DisplayConfig,
    reader: tokio::sync::Mutex<BufReader<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    state: Mutex<HandshakeState>,
    connection_id: Mutex<Option<String>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Tunnel {
    /// Dial the display daemon
    pub async fn connect(
        address: &str,
        config: DisplayConfig,
        dial_timeout: Duration,
    ) -> Result<Self, DisplayError> {
        debug!("Dialing display daemon at {}", address);
        let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                DisplayError::Timeout(format!(
                    "display daemon at {} did not answer within {:?}",
                    address, dial_timeout
                ))
            })?
            .map_err(|e| DisplayError::Dial {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        info!("Connected to display daemon at {}", address);

        Ok(Self {
            address: address.to_string(),
            config,
            reader: tokio::sync::Mutex::new(BufReader::new(read_half)),
            writer: tokio::sync::Mutex::new(write_half),
            state: Mutex::new(HandshakeState::Init),
            connection_id: Mutex::new(None),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &DisplayConfig {
        &self.config
    }

    pub fn state(&self) -> HandshakeState {
        *self.state.lock()
    }

    /// Connection id assigned by the daemon, once ready
    pub fn connection_id(&self) -> Option<String> {
        self.connection_id.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Negotiate the connection. A failed handshake closes the tunnel.
    pub async fn handshake(&self) -> Result<(), DisplayError> {
        if self.is_closed() {
            return Err(DisplayError::ClosedTunnel);
        }
        if self.state() == HandshakeState::Ready {
            return Ok(());
        }

        match self.run_handshake().await {
            Ok(id) => {
                info!(
                    "Display handshake complete ({}), connection id {}",
                    self.config.protocol, id
                );
                *self.connection_id.lock() = Some(id);
                *self.state.lock() = HandshakeState::Ready;
                Ok(())
            }
            Err(e) => {
                warn!("Display handshake with {} failed: {}", self.address, e);
                *self.state.lock() = HandshakeState::Failed;
                self.close().await;
                Err(e)
            }
        }
    }

    async fn run_handshake(&self) -> Result<String, DisplayError> {
        let config = &self.config;
        let selector = config
            .connection_id
            .clone()
            .unwrap_or_else(|| config.protocol.clone());
        self.send(&Instruction::new("select", [selector])?).await?;

        let args = self.expect_opcode("args").await?;
        debug!("Daemon requested {} parameters", args.args.len());
        let values: Vec<String> = args.args.iter().map(|name| config.resolve(name)).collect();

        let size = [
            config.width.to_string(),
            config.height.to_string(),
            config.dpi.to_string(),
        ];
        self.send(&Instruction::new("size", size)?).await?;
        self.send(&Instruction::new("audio", AUDIO_MIMETYPES)?).await?;
        self.send(&Instruction::new("video", Vec::<String>::new())?)
            .await?;
        self.send(&Instruction::new("image", IMAGE_MIMETYPES)?).await?;
        self.send(&Instruction::new("timezone", [config.timezone.as_str()])?)
            .await?;
        self.send(&Instruction::new("connect", values)?).await?;

        let ready = self.expect_opcode("ready").await?;
        ready
            .args
            .into_iter()
            .next()
            .ok_or(DisplayError::EmptyConnectionId)
    }

    async fn send(&self, instruction: &Instruction) -> Result<(), DisplayError> {
        debug!("-> {}", instruction.opcode);
        self.write_raw(instruction.encode().as_bytes()).await
    }

    async fn expect_opcode(&self, opcode: &str) -> Result<Instruction, DisplayError> {
        let frame = self.read_raw().await?;
        let instruction = Instruction::from_frame(&frame)?;
        debug!("<- {}", instruction.opcode);
        if instruction.opcode != opcode {
            return Err(DisplayError::UnexpectedOpcode {
                expected: opcode.to_string(),
                actual: instruction.opcode,
            });
        }
        Ok(instruction)
    }

    async fn read_raw(&self) -> Result<Bytes, DisplayError> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DisplayError::ClosedTunnel),
            frame = read_frame(&mut *reader) => match frame? {
                Some(frame) => Ok(frame),
                None => Err(DisplayError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "display daemon closed the connection",
                ))),
            },
        }
    }

    async fn write_raw(&self, data: &[u8]) -> Result<(), DisplayError> {
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(DisplayError::ClosedTunnel);
        }
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Next frame from the daemon
    ///
    /// Known audio announcements come back as an empty frame, which relays
    /// skip.
    pub async fn read(&self) -> Result<Bytes, DisplayError> {
        if self.is_closed() {
            return Err(DisplayError::ClosedTunnel);
        }
        let frame = self.read_raw().await?;
        if FILTERED_FRAMES.iter().any(|f| frame[..] == **f) {
            return Ok(Bytes::new());
        }
        Ok(frame)
    }

    /// Send raw frames to the daemon, flushed immediately
    pub async fn write(&self, data: &[u8]) -> Result<(), DisplayError> {
        if self.is_closed() {
            return Err(DisplayError::ClosedTunnel);
        }
        self.write_raw(data).await
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Display tunnel shutdown: {}", e);
        }
        info!("Display tunnel to {} closed", self.address);
    }
}
