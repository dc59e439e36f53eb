//! Connector Registry
//!
//! Named backends that turn a gateway chain into a live session. The
//! registry is built once at startup and then shared read-only (behind an
//! `Arc`) by whatever creates sessions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Session, SessionError, TermSize};
use crate::config::GatewayConfig;
use crate::display::DisplayConnector;
use crate::ssh::{GatewayChain, SshConnector};

/// Display-backend specific connect options
#[derive(Debug, Clone, Default)]
pub struct DisplayOptions {
    /// Display daemon address; falls back to the configured default
    pub address: Option<String>,
    /// Join an existing display connection instead of opening a new one
    pub connection_id: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub dpi: Option<u32>,
    /// Extra handshake parameters, answered when the daemon asks for them
    pub parameters: HashMap<String, String>,
}

/// Per-connection options
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Terminal geometry for shell sessions; the backend's configured
    /// default when absent
    pub size: Option<TermSize>,
    pub display: DisplayOptions,
}

/// A named backend
#[async_trait]
pub trait Connector: Send + Sync {
    /// Backend name used for registry lookup
    fn name(&self) -> &str;

    async fn connect(
        &self,
        chain: GatewayChain,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Session>, SessionError>;
}

/// Backend name → connector
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in backends: `ssh`, `rdp` and `vnc`
    pub fn with_defaults(config: &GatewayConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SshConnector::new(config)));
        registry.register(Arc::new(DisplayConnector::new("rdp", config)));
        registry.register(Arc::new(DisplayConnector::new("vnc", config)));
        registry
    }

    /// Register a backend under its own name
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        let name = connector.name().to_string();
        if self.connectors.insert(name.clone(), connector).is_some() {
            warn!("Backend '{}' registered twice, keeping the latest", name);
        } else {
            info!("Registered backend '{}'", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(name).cloned()
    }

    /// Registered backend names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up `backend` and connect through it
    pub async fn connect(
        &self,
        backend: &str,
        chain: GatewayChain,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Session>, SessionError> {
        let connector = self
            .get(backend)
            .ok_or_else(|| SessionError::UnknownBackend(backend.to_string()))?;
        connector.connect(chain, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::BareSession;
    use crate::ssh::Endpoint;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingConnector {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Connector for RecordingConnector {
        fn name(&self) -> &str {
            "fake"
        }

        async fn connect(
            &self,
            chain: GatewayChain,
            _options: &ConnectOptions,
        ) -> Result<Box<dyn Session>, SessionError> {
            self.seen.lock().push(chain.destination().host.clone());
            Ok(Box::new(BareSession::default()))
        }
    }

    fn chain() -> GatewayChain {
        GatewayChain::direct(Endpoint::with_password("target", "root", "pw"))
    }

    #[test]
    fn test_defaults_registered() {
        let registry = ConnectorRegistry::with_defaults(&GatewayConfig::default());
        assert_eq!(registry.names(), vec!["rdp", "ssh", "vnc"]);
        assert!(registry.get("ssh").is_some());
        assert!(registry.get("telnet").is_none());
    }

    #[tokio::test]
    async fn test_connect_dispatches_by_name() {
        let connector = Arc::new(RecordingConnector::default());
        let mut registry = ConnectorRegistry::new();
        registry.register(connector.clone());

        let session = registry
            .connect("fake", chain(), &ConnectOptions::default())
            .await
            .ok()
            .unwrap();
        assert_eq!(session.protocol(), "bare");
        assert_eq!(connector.seen.lock().as_slice(), &["target".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let registry = ConnectorRegistry::new();
        let err = registry
            .connect("telnet", chain(), &ConnectOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::UnknownBackend(ref n) if n == "telnet"));
    }
}
