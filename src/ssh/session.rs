//! SSH backend session
//!
//! `SshConnector` establishes the gateway chain eagerly at connect time so
//! that hop failures surface to the caller immediately. The resulting
//! `SshSession` offers an interactive terminal and SFTP on the destination
//! hop, and dials arbitrary destinations through the chain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg};
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::client::{send_keepalive, ClientHandler, SshHopConnector};
use super::config::GatewayChain;
use super::error::SshError;
use super::proxy::{ChainClient, Transport};
use crate::config::GatewayConfig;
use crate::session::{
    ConnectOptions, Connector, Dialer, FileTransferCapable, MessageSink, RemoteShell, Session,
    SessionError, TermSize, TerminalCapable, TerminalSession,
};

/// Backend name of the SSH connector
pub const SSH_PROTOCOL: &str = "ssh";

const OUTPUT_PIPE_CAPACITY: usize = 64 * 1024;

/// Commands accepted by a shell channel's driver task
#[derive(Debug)]
enum ShellCommand {
    /// Data to send to the shell's stdin
    Data(Vec<u8>),
    /// Resize the PTY (cols, rows); the outcome is reported back
    Resize(u16, u16, oneshot::Sender<Result<(), SshError>>),
    /// Close the channel
    Close,
}

/// Control handle of one shell channel
///
/// The channel itself is owned by a driver task; output is forwarded into a
/// pipe whose read half feeds the terminal pump, and which ends when the
/// channel closes.
struct SshShell {
    cmd_tx: mpsc::Sender<ShellCommand>,
    client: Arc<ChainClient<Handle<ClientHandler>>>,
}

impl SshShell {
    fn spawn(
        channel: Channel<Msg>,
        client: Arc<ChainClient<Handle<ClientHandler>>>,
    ) -> (Self, DuplexStream) {
        let (cmd_tx, cmd_rx) = mpsc::channel::<ShellCommand>(1024);
        let (output_tx, output_rx) = tokio::io::duplex(OUTPUT_PIPE_CAPACITY);
        tokio::spawn(drive_channel(channel, cmd_rx, output_tx));
        (Self { cmd_tx, client }, output_rx)
    }

    async fn command(&self, cmd: ShellCommand) -> Result<(), SessionError> {
        self.cmd_tx.send(cmd).await.map_err(|_| SessionError::Closed)
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn write_stdin(&self, data: &[u8]) -> Result<(), SessionError> {
        self.command(ShellCommand::Data(data.to_vec())).await
    }

    async fn window_change(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(ShellCommand::Resize(cols, rows, reply_tx)).await?;
        // A dropped reply means the driver exited before handling it
        reply_rx.await.map_err(|_| SessionError::Closed)??;
        Ok(())
    }

    async fn keepalive(&self) -> Result<(), SessionError> {
        send_keepalive(self.client.target()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        // The driver may already be gone if the remote side closed first.
        let _ = self.cmd_tx.send(ShellCommand::Close).await;
        Ok(())
    }
}

async fn drive_channel(
    mut channel: Channel<Msg>,
    mut cmd_rx: mpsc::Receiver<ShellCommand>,
    mut output: DuplexStream,
) {
    debug!("Shell channel driver started");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ShellCommand::Data(data)) => {
                    if let Err(e) = channel.data(&data[..]).await {
                        error!("Failed to send data to SSH channel: {}", e);
                        break;
                    }
                }
                Some(ShellCommand::Resize(cols, rows, reply)) => {
                    let result = channel
                        .window_change(cols as u32, rows as u32, 0, 0)
                        .await
                        .map_err(|e| SshError::ChannelError(format!("PTY resize failed: {}", e)));
                    match &result {
                        Ok(()) => debug!("PTY resized to {}x{}", cols, rows),
                        Err(e) => error!("Failed to resize PTY: {}", e),
                    }
                    let _ = reply.send(result);
                }
                Some(ShellCommand::Close) | None => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
            },

            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if output.write_all(&data).await.is_err() {
                        debug!("Terminal pump gone, closing shell channel");
                        let _ = channel.close().await;
                        break;
                    }
                }
                // stderr shares the terminal
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    if output.write_all(&data).await.is_err() {
                        let _ = channel.close().await;
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    info!("Remote shell exited with status {}", exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    info!("SSH shell channel closed");
                    break;
                }
                Some(_) => {}
            },
        }
    }

    // Dropping `output` ends the pump's read side.
    debug!("Shell channel driver terminated");
}

/// SSH session over an established gateway chain
pub struct SshSession {
    transport: Arc<Transport<SshHopConnector>>,
    flush_interval: Duration,
    size: TermSize,
    closed: AtomicBool,
}

impl SshSession {
    pub fn new(
        transport: Arc<Transport<SshHopConnector>>,
        flush_interval: Duration,
        size: TermSize,
    ) -> Self {
        Self {
            transport,
            flush_interval,
            size,
            closed: AtomicBool::new(false),
        }
    }

    async fn client(&self) -> Result<Arc<ChainClient<Handle<ClientHandler>>>, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        Ok(self.transport.ensure_client().await?)
    }

    async fn open_channel(
        client: &ChainClient<Handle<ClientHandler>>,
    ) -> Result<Channel<Msg>, SshError> {
        client
            .target()
            .channel_open_session()
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to open session channel: {}", e)))
    }
}

#[async_trait]
impl Session for SshSession {
    fn protocol(&self) -> &str {
        SSH_PROTOCOL
    }

    fn transport(&self) -> Arc<dyn Dialer> {
        self.transport.clone()
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(
            "Closing SSH session to {}",
            self.transport.chain().destination().address()
        );
        self.transport.close().await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn as_terminal(&self) -> Option<&dyn TerminalCapable> {
        Some(self)
    }

    fn as_file_transfer(&self) -> Option<&dyn FileTransferCapable> {
        Some(self)
    }
}

#[async_trait]
impl TerminalCapable for SshSession {
    fn default_size(&self) -> TermSize {
        self.size
    }

    async fn start_terminal(
        &self,
        size: TermSize,
        sink: Arc<dyn MessageSink>,
    ) -> Result<TerminalSession, SessionError> {
        let client = self.client().await?;
        let channel = Self::open_channel(&client).await?;

        debug!("Channel opened, requesting PTY {}x{}", size.cols, size.rows);
        channel
            .request_pty(
                false,
                "xterm-256color",
                size.cols as u32,
                size.rows as u32,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

        info!(
            "Interactive shell started on {}",
            self.transport.chain().destination().address()
        );

        let (shell, output) = SshShell::spawn(channel, client);
        Ok(TerminalSession::start(
            Arc::new(shell),
            output,
            sink,
            self.flush_interval,
        ))
    }
}

#[async_trait]
impl FileTransferCapable for SshSession {
    async fn open_sftp(&self) -> Result<SftpSession, SessionError> {
        let client = self.client().await?;
        let channel = Self::open_channel(&client).await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::ChannelError(format!("SFTP subsystem request failed: {}", e)))?;

        let sftp = SftpSession::new(channel.into_stream()).await?;
        info!(
            "SFTP session opened on {}",
            self.transport.chain().destination().address()
        );
        Ok(sftp)
    }
}

/// `ssh` backend
pub struct SshConnector {
    hop_connector: SshHopConnector,
    flush_interval: Duration,
    default_size: TermSize,
}

impl SshConnector {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            hop_connector: SshHopConnector::from_config(config),
            flush_interval: config.flush_interval(),
            default_size: TermSize::new(config.default_cols, config.default_rows),
        }
    }

    /// Terminal geometry for a new session
    fn terminal_size(&self, options: &ConnectOptions) -> TermSize {
        options.size.unwrap_or(self.default_size)
    }
}

#[async_trait]
impl Connector for SshConnector {
    fn name(&self) -> &str {
        SSH_PROTOCOL
    }

    async fn connect(
        &self,
        chain: GatewayChain,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Session>, SessionError> {
        let size = self.terminal_size(options);
        let transport = Arc::new(Transport::build(chain, self.hop_connector.clone())?);
        transport.ensure_client().await?;
        Ok(Box::new(SshSession::new(transport, self.flush_interval, size)))
    }
}
