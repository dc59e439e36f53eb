//! Chain authenticator
//!
//! Turns one endpoint's credential material into something the SSH
//! handshake can present. Resolution is purely local: no network I/O,
//! no retries.

use std::fmt;
use std::sync::Arc;

use russh::keys::PrivateKey;
use zeroize::Zeroizing;

use super::config::{AuthType, Endpoint};
use super::error::SshError;

/// Resolved authentication method for a single hop
#[derive(Clone)]
pub enum HopAuth {
    Password(Zeroizing<String>),
    PublicKey(Arc<PrivateKey>),
}

impl fmt::Debug for HopAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HopAuth::Password(_) => f.write_str("HopAuth::Password(..)"),
            HopAuth::PublicKey(key) => write!(f, "HopAuth::PublicKey({})", key.algorithm()),
        }
    }
}

impl HopAuth {
    /// Short name for log messages
    pub fn kind(&self) -> &'static str {
        match self {
            HopAuth::Password(_) => "password",
            HopAuth::PublicKey(_) => "publickey",
        }
    }
}

/// Resolve an endpoint's credentials
pub fn resolve_auth(endpoint: &Endpoint) -> Result<HopAuth, SshError> {
    match endpoint.auth_type.as_str() {
        AuthType::PASSWORD => Ok(HopAuth::Password(endpoint.password.clone())),
        AuthType::PASSPHRASE => {
            let key = parse_key(&endpoint.private_key, Some(endpoint.passphrase.as_str()))?;
            Ok(HopAuth::PublicKey(Arc::new(key)))
        }
        AuthType::PUBLIC_KEY => {
            let key = parse_key(&endpoint.private_key, None)?;
            Ok(HopAuth::PublicKey(Arc::new(key)))
        }
        other => Err(SshError::UnsupportedAuthType(other.to_string())),
    }
}

fn parse_key(material: &str, passphrase: Option<&str>) -> Result<PrivateKey, SshError> {
    if material.trim().is_empty() {
        return Err(SshError::KeyParse("private key is empty".to_string()));
    }
    russh::keys::decode_secret_key(material, passphrase)
        .map_err(|e| SshError::KeyParse(e.to_string()))
}
