//! Session layer errors

use thiserror::Error;

use super::Capability;
use crate::display::DisplayError;
use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(i64),

    #[error("Capability not supported: {protocol} session has no {capability}")]
    UnsupportedCapability {
        protocol: String,
        capability: Capability,
    },

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Invalid connect options: {0}")]
    InvalidOptions(String),

    #[error("Session closed")]
    Closed,

    #[error("Client sink error: {0}")]
    Sink(String),

    #[error("SFTP error: {0}")]
    Sftp(String),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Display(#[from] DisplayError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<russh_sftp::client::error::Error> for SessionError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        SessionError::Sftp(err.to_string())
    }
}
