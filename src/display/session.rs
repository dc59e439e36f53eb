//! Display backend sessions (`rdp`, `vnc`, ...)
//!
//! The display daemon connects to the destination host itself; the gateway
//! only supplies the destination's address and credentials as handshake
//! parameters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{info, warn};

use super::error::DisplayError;
use super::tunnel::{DisplayConfig, Tunnel};
use crate::config::GatewayConfig;
use crate::session::{
    BoxedStream, ConnectOptions, Connector, Dialer, DisplayCapable, Session, SessionError,
};
use crate::ssh::GatewayChain;

/// Plain TCP dialer with a connect deadline
#[derive(Debug, Clone)]
pub struct DirectDialer {
    timeout: Duration,
}

impl DirectDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, SessionError> {
        let address = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| DisplayError::Timeout(format!("dial {} timed out", address)))?
            .map_err(|e| DisplayError::Dial {
                address,
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Live display connection
pub struct DisplaySession {
    protocol: String,
    tunnel: Arc<Tunnel>,
    dialer: Arc<DirectDialer>,
    closed: AtomicBool,
}

impl DisplaySession {
    pub fn new(protocol: impl Into<String>, tunnel: Arc<Tunnel>, dialer: DirectDialer) -> Self {
        Self {
            protocol: protocol.into(),
            tunnel,
            dialer: Arc::new(dialer),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Session for DisplaySession {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn transport(&self) -> Arc<dyn Dialer> {
        self.dialer.clone()
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.tunnel.close().await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn as_display(&self) -> Option<&dyn DisplayCapable> {
        Some(self)
    }
}

impl DisplayCapable for DisplaySession {
    fn tunnel(&self) -> Arc<Tunnel> {
        self.tunnel.clone()
    }
}

/// Display backend for one protocol name
pub struct DisplayConnector {
    protocol: String,
    address: String,
    dial_timeout: Duration,
    defaults: DisplayConfig,
}

impl DisplayConnector {
    pub fn new(protocol: &str, config: &GatewayConfig) -> Self {
        Self {
            protocol: protocol.to_string(),
            address: config.display_address.clone(),
            dial_timeout: config.display_dial_timeout(),
            defaults: DisplayConfig::from_config(protocol, config),
        }
    }

    /// Handshake settings for one connection
    fn display_config(
        &self,
        chain: &GatewayChain,
        options: &ConnectOptions,
    ) -> Result<DisplayConfig, SessionError> {
        let opts = &options.display;
        let mut config = self.defaults.clone();
        config.connection_id = opts.connection_id.clone();
        config.width = opts.width.unwrap_or(config.width);
        config.height = opts.height.unwrap_or(config.height);
        config.dpi = opts.dpi.unwrap_or(config.dpi);
        if config.width == 0 || config.height == 0 || config.dpi == 0 {
            return Err(SessionError::InvalidOptions(format!(
                "display geometry {}x{}@{} dpi",
                config.width, config.height, config.dpi
            )));
        }

        config.parameters = opts.parameters.clone();
        let destination = chain.destination();
        let params = &mut config.parameters;
        params
            .entry("hostname".to_string())
            .or_insert_with(|| destination.host.clone());
        params
            .entry("port".to_string())
            .or_insert_with(|| destination.port.to_string());
        if !destination.username.is_empty() {
            params
                .entry("username".to_string())
                .or_insert_with(|| destination.username.clone());
        }
        if !destination.password.is_empty() {
            params
                .entry("password".to_string())
                .or_insert_with(|| destination.password.as_str().to_string());
        }
        Ok(config)
    }
}

#[async_trait]
impl Connector for DisplayConnector {
    fn name(&self) -> &str {
        &self.protocol
    }

    async fn connect(
        &self,
        chain: GatewayChain,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Session>, SessionError> {
        if chain.len() > 1 {
            warn!(
                "{} session ignores {} bastion hop(s); the display daemon dials {} directly",
                self.protocol,
                chain.bastions().len(),
                chain.destination().address()
            );
        }

        let config = self.display_config(&chain, options)?;
        let address = options
            .display
            .address
            .clone()
            .unwrap_or_else(|| self.address.clone());

        let tunnel = Tunnel::connect(&address, config, self.dial_timeout).await?;
        tunnel.handshake().await?;
        info!(
            "{} session to {} ready",
            self.protocol,
            chain.destination().address()
        );

        Ok(Box::new(DisplaySession::new(
            self.protocol.clone(),
            Arc::new(tunnel),
            DirectDialer::new(self.dial_timeout),
        )))
    }
}
