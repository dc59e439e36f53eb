//! Gateway chain configuration

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::error::SshError;

/// Credential kind of an endpoint, as supplied by the caller
///
/// Kept as the raw tag so that unknown tags survive deserialization and are
/// rejected by the chain authenticator with a precise error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthType(pub String);

impl AuthType {
    pub const PASSWORD: &'static str = "passwd";
    pub const PASSPHRASE: &'static str = "passphrase";
    pub const PUBLIC_KEY: &'static str = "publickey";

    pub fn password() -> Self {
        Self(Self::PASSWORD.to_string())
    }

    pub fn passphrase() -> Self {
        Self(Self::PASSPHRASE.to_string())
    }

    pub fn public_key() -> Self {
        Self(Self::PUBLIC_KEY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One hop of a gateway chain, or the final target
#[derive(Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Credential kind: `passwd`, `passphrase` or `publickey`
    pub auth_type: AuthType,

    /// Plain password (`passwd`)
    #[serde(default, skip_serializing)]
    pub password: Zeroizing<String>,

    /// OpenSSH/PEM private key text (`passphrase`, `publickey`)
    #[serde(default, skip_serializing)]
    pub private_key: Zeroizing<String>,

    /// Passphrase protecting `private_key` (`passphrase`)
    #[serde(default, skip_serializing)]
    pub passphrase: Zeroizing<String>,

    /// Position in the chain; smaller values are closer to the gateway
    #[serde(default)]
    pub order: i32,
}

// Credentials stay out of logs and panics.
impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_type", &self.auth_type)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Create an endpoint with password authentication
    pub fn with_password(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth_type: AuthType::password(),
            password: Zeroizing::new(password.into()),
            private_key: Zeroizing::default(),
            passphrase: Zeroizing::default(),
            order: 0,
        }
    }

    /// Create an endpoint with an unencrypted private key
    pub fn with_key(
        host: impl Into<String>,
        username: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth_type: AuthType::public_key(),
            password: Zeroizing::default(),
            private_key: Zeroizing::new(private_key.into()),
            passphrase: Zeroizing::default(),
            order: 0,
        }
    }

    /// Create an endpoint with a passphrase-protected private key
    pub fn with_encrypted_key(
        host: impl Into<String>,
        username: impl Into<String>,
        private_key: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth_type: AuthType::passphrase(),
            password: Zeroizing::default(),
            private_key: Zeroizing::new(private_key.into()),
            passphrase: Zeroizing::new(passphrase.into()),
            order: 0,
        }
    }

    /// Set custom port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the order index
    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// `host:port` form used for dialing and log messages
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_port() -> u16 {
    22
}

/// Ordered path of endpoints from the gateway to the destination
///
/// Endpoints are sorted by their order index once, at construction; the
/// resulting order is authoritative and cannot be changed afterwards.
#[derive(Debug, Clone)]
pub struct GatewayChain {
    hops: Vec<Endpoint>,
}

impl GatewayChain {
    /// Build a chain, sorting by order index (stable for equal indices)
    pub fn new(mut endpoints: Vec<Endpoint>) -> Result<Self, SshError> {
        if endpoints.is_empty() {
            return Err(SshError::EmptyChain);
        }
        endpoints.sort_by_key(|e| e.order);
        Ok(Self { hops: endpoints })
    }

    /// Single-endpoint chain (direct connection)
    pub fn direct(endpoint: Endpoint) -> Self {
        Self {
            hops: vec![endpoint],
        }
    }

    /// All hops in connection order
    pub fn hops(&self) -> &[Endpoint] {
        &self.hops
    }

    /// The effective destination (last hop)
    pub fn destination(&self) -> &Endpoint {
        // Construction guarantees at least one hop.
        &self.hops[self.hops.len() - 1]
    }

    /// Transit bastions in front of the destination
    pub fn bastions(&self) -> &[Endpoint] {
        &self.hops[..self.hops.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Always false; kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_sorted_by_order() {
        let chain = GatewayChain::new(vec![
            Endpoint::with_password("target", "root", "p3").order(3),
            Endpoint::with_password("jump1", "ops", "p1").order(1),
            Endpoint::with_key("jump2", "ops", "KEY").order(2).port(2222),
        ])
        .unwrap();

        let hosts: Vec<&str> = chain.hops().iter().map(|h| h.host.as_str()).collect();
        assert_eq!(hosts, vec!["jump1", "jump2", "target"]);
        assert_eq!(chain.destination().host, "target");
        assert_eq!(chain.bastions().len(), 2);
        assert_eq!(chain.hops()[1].port, 2222);
    }

    #[test]
    fn test_chain_sort_is_stable() {
        let chain = GatewayChain::new(vec![
            Endpoint::with_password("a", "u", "p"),
            Endpoint::with_password("b", "u", "p"),
        ])
        .unwrap();
        assert_eq!(chain.hops()[0].host, "a");
        assert_eq!(chain.hops()[1].host, "b");
    }

    #[test]
    fn test_empty_chain_rejected() {
        let err = GatewayChain::new(Vec::new()).unwrap_err();
        assert!(matches!(err, SshError::EmptyChain));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_endpoint_deserialize_defaults() {
        let endpoint: Endpoint = serde_json::from_str(
            r#"{"host":"10.0.0.5","username":"deploy","auth_type":"passwd","password":"s3cret"}"#,
        )
        .unwrap();
        assert_eq!(endpoint.port, 22);
        assert_eq!(endpoint.order, 0);
        assert_eq!(endpoint.auth_type.as_str(), AuthType::PASSWORD);
        assert_eq!(endpoint.password.as_str(), "s3cret");
    }

    #[test]
    fn test_endpoint_debug_hides_credentials() {
        let endpoint = Endpoint::with_password("host", "user", "hunter2");
        let rendered = format!("{:?}", endpoint);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("host"));
    }
}
