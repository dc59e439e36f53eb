//! SSH client implementation using russh
//!
//! `SshHopConnector` performs the per-hop work of the gateway chain: the
//! TCP dial of the first hop, SSH handshakes (directly or over a
//! `direct-tcpip` channel of the previous hop) and user authentication.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{HashAlg, PublicKey};
use russh::ChannelStream;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::auth::HopAuth;
use super::config::Endpoint;
use super::error::{HopPhase, SshError};
use super::proxy::{HopConnector, HopFailure};
use crate::config::GatewayConfig;

/// Client handler for russh callbacks
///
/// Host key trust is decided by the caller before a chain is handed to the
/// gateway; the handler accepts the presented key and records its
/// fingerprint so operators can audit which key each hop used.
pub struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Host key for {}:{}: {}",
            self.host,
            self.port,
            server_public_key.fingerprint(HashAlg::Sha256)
        );
        Ok(true)
    }
}

/// russh-backed hop connector
#[derive(Debug, Clone)]
pub struct SshHopConnector {
    /// Deadline for one hop's dial + handshake + authentication
    hop_timeout: Duration,
    keepalive_interval: Duration,
    keepalive_max: usize,
}

impl Default for SshHopConnector {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

impl SshHopConnector {
    pub fn new(hop_timeout: Duration) -> Self {
        Self {
            hop_timeout,
            ..Default::default()
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            hop_timeout: config.hop_timeout(),
            keepalive_interval: config.keepalive_interval(),
            keepalive_max: config.keepalive_max,
        }
    }

    pub fn hop_timeout(&self) -> Duration {
        self.hop_timeout
    }

    fn client_config(&self) -> Arc<client::Config> {
        Arc::new(client::Config {
            inactivity_timeout: None, // liveness is driven by keepalives and client pings
            keepalive_interval: Some(self.keepalive_interval),
            keepalive_max: self.keepalive_max,
            ..Default::default()
        })
    }

    /// Handshake + authentication over an already-open transport stream
    async fn handshake<S>(
        &self,
        stream: S,
        endpoint: &Endpoint,
        auth: &HopAuth,
        deadline: Instant,
    ) -> Result<Handle<ClientHandler>, HopFailure>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let handler = ClientHandler::new(endpoint.host.clone(), endpoint.port);

        let mut handle = timeout_at(
            deadline,
            client::connect_stream(self.client_config(), stream, handler),
        )
        .await
        .map_err(|_| HopFailure::new(HopPhase::Handshake, "timed out"))?
        .map_err(|e| HopFailure::new(HopPhase::Handshake, e))?;

        debug!("SSH handshake with {} completed", endpoint.address());

        timeout_at(deadline, authenticate(&mut handle, endpoint, auth))
            .await
            .map_err(|_| HopFailure::new(HopPhase::Handshake, "authentication timed out"))??;

        info!("Authenticated to {}@{}", endpoint.username, endpoint.address());
        Ok(handle)
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    endpoint: &Endpoint,
    auth: &HopAuth,
) -> Result<(), HopFailure> {
    let result = match auth {
        HopAuth::Password(password) => {
            handle
                .authenticate_password(endpoint.username.as_str(), password.as_str())
                .await
        }
        HopAuth::PublicKey(key) => {
            let key_with_hash = PrivateKeyWithHashAlg::new(key.clone(), None);
            handle
                .authenticate_publickey(endpoint.username.as_str(), key_with_hash)
                .await
        }
    }
    .map_err(|e| HopFailure::new(HopPhase::Handshake, format!("authentication error: {}", e)))?;

    if !result.success() {
        return Err(HopFailure::new(
            HopPhase::Handshake,
            format!("authentication rejected for user {}", endpoint.username),
        ));
    }
    Ok(())
}

#[async_trait]
impl HopConnector for SshHopConnector {
    type Client = Handle<ClientHandler>;
    type Stream = ChannelStream<Msg>;

    async fn connect_direct(
        &self,
        endpoint: &Endpoint,
        auth: &HopAuth,
    ) -> Result<Self::Client, HopFailure> {
        let deadline = Instant::now() + self.hop_timeout;
        let addr = endpoint.address();

        let stream = timeout_at(deadline, TcpStream::connect(&addr))
            .await
            .map_err(|_| HopFailure::new(HopPhase::Dial, format!("connect to {} timed out", addr)))?
            .map_err(|e| HopFailure::new(HopPhase::Dial, e))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }

        self.handshake(stream, endpoint, auth, deadline).await
    }

    async fn connect_over(
        &self,
        stream: Self::Stream,
        endpoint: &Endpoint,
        auth: &HopAuth,
    ) -> Result<Self::Client, HopFailure> {
        let deadline = Instant::now() + self.hop_timeout;
        self.handshake(stream, endpoint, auth, deadline).await
    }

    async fn open_tunnel(
        &self,
        via: &Self::Client,
        host: &str,
        port: u16,
    ) -> Result<Self::Stream, SshError> {
        let channel = via
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| {
                SshError::ChannelError(format!("Failed to open tunnel to {}:{}: {}", host, port, e))
            })?;
        Ok(channel.into_stream())
    }

    async fn disconnect(&self, client: &Self::Client) {
        if let Err(e) = client
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await
        {
            debug!("Disconnect failed (already gone?): {}", e);
        }
    }
}

/// Send an OpenSSH keepalive with reply on the given connection
pub async fn send_keepalive(handle: &Handle<ClientHandler>) -> Result<(), SshError> {
    tokio::time::timeout(Duration::from_secs(5), handle.send_keepalive(true))
        .await
        .map_err(|_| SshError::Timeout("Keepalive timed out".to_string()))?
        .map_err(SshError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::config::Endpoint;
    use tokio::net::TcpListener;

    #[test]
    fn test_connector_from_config() {
        let config = GatewayConfig {
            hop_timeout_secs: 7,
            ..Default::default()
        };
        let connector = SshHopConnector::from_config(&config);
        assert_eq!(connector.hop_timeout(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_dial_refused_reports_dial_phase() {
        // Bind then drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::with_password("127.0.0.1", "u", "p").port(port);
        let auth = HopAuth::Password(endpoint.password.clone());
        let connector = SshHopConnector::new(Duration::from_secs(2));

        let failure = connector.connect_direct(&endpoint, &auth).await.err().unwrap();
        assert_eq!(failure.phase, HopPhase::Dial);
    }

    #[tokio::test]
    async fn test_silent_server_reports_handshake_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            // Accept and never speak SSH.
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let endpoint = Endpoint::with_password("127.0.0.1", "u", "p").port(port);
        let auth = HopAuth::Password(endpoint.password.clone());
        let connector = SshHopConnector::new(Duration::from_millis(300));

        let failure = connector.connect_direct(&endpoint, &auth).await.err().unwrap();
        assert_eq!(failure.phase, HopPhase::Handshake);
        server.abort();
    }
}
