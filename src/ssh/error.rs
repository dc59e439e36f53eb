//! SSH Error types

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Phase of a hop's connection attempt that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopPhase {
    /// Resolving the hop's credential material
    Auth,
    /// TCP dial of the first hop
    Dial,
    /// Opening a direct-tcpip channel through the previous hop
    Tunnel,
    /// SSH key exchange and user authentication
    Handshake,
}

impl fmt::Display for HopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HopPhase::Auth => "auth",
            HopPhase::Dial => "dial",
            HopPhase::Tunnel => "tunnel",
            HopPhase::Handshake => "handshake",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Gateway chain is empty")]
    EmptyChain,

    #[error("Unsupported auth type: {0}")]
    UnsupportedAuthType(String),

    #[error("Key parse error: {0}")]
    KeyParse(String),

    #[error("Hop {index} ({host}:{port}) {phase} failed: {reason}")]
    Hop {
        index: usize,
        host: String,
        port: u16,
        phase: HopPhase,
        reason: String,
    },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Disconnected")]
    Disconnected,

    /// A chain build failure, shared with every caller that waited on it
    #[error(transparent)]
    Shared(Arc<SshError>),
}

impl SshError {
    /// Hop index this error is attributed to, if any
    pub fn hop_index(&self) -> Option<usize> {
        match self {
            SshError::Hop { index, .. } => Some(*index),
            SshError::Shared(inner) => inner.hop_index(),
            _ => None,
        }
    }

    /// Failing phase for hop errors
    pub fn hop_phase(&self) -> Option<HopPhase> {
        match self {
            SshError::Hop { phase, .. } => Some(*phase),
            SshError::Shared(inner) => inner.hop_phase(),
            _ => None,
        }
    }

    /// Configuration errors are never worth retrying with the same input
    pub fn is_configuration(&self) -> bool {
        match self {
            SshError::EmptyChain | SshError::UnsupportedAuthType(_) | SshError::KeyParse(_) => true,
            SshError::Hop { phase, .. } => *phase == HopPhase::Auth,
            SshError::Shared(inner) => inner.is_configuration(),
            _ => false,
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyParse(err.to_string())
    }
}
