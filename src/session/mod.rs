//! Session Management Module
//!
//! A `Session` is a live backend connection behind a uniform handle. The
//! base contract is small (protocol tag, transport, close); everything else
//! is an optional capability that callers look up before use:
//!
//! - `TerminalCapable`: interactive shell driven by a [`TerminalSession`] pump
//! - `FileTransferCapable`: SFTP client on the destination host
//! - `DisplayCapable`: raw display-protocol tunnel
//!
//! Probing never panics; an absent capability is reported as
//! [`SessionError::UnsupportedCapability`].

mod error;
pub mod pool;
pub mod registry;
pub mod terminal;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::display::Tunnel;

pub use error::SessionError;
pub use pool::SessionPool;
pub use registry::{ConnectOptions, Connector, ConnectorRegistry, DisplayOptions};
pub use terminal::{
    MessageSink, Operation, RemoteShell, TermSize, TerminalMessage, TerminalSession,
};

/// Byte stream returned by a [`Dialer`]
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Ability to open a TCP connection to an arbitrary destination through
/// whatever path a session established
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, SessionError>;
}

/// Optional session abilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Terminal,
    FileTransfer,
    Display,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Terminal => "terminal",
            Capability::FileTransfer => "file transfer",
            Capability::Display => "display",
        };
        f.write_str(name)
    }
}

/// Interactive shell capability
#[async_trait]
pub trait TerminalCapable: Send + Sync {
    /// Geometry used when the client does not announce one
    fn default_size(&self) -> TermSize {
        TermSize::default()
    }

    /// Open a shell with the given geometry and start pumping its output
    /// into `sink`
    async fn start_terminal(
        &self,
        size: TermSize,
        sink: Arc<dyn MessageSink>,
    ) -> Result<TerminalSession, SessionError>;
}

/// File transfer capability
#[async_trait]
pub trait FileTransferCapable: Send + Sync {
    async fn open_sftp(&self) -> Result<SftpSession, SessionError>;
}

/// Display tunnel capability
pub trait DisplayCapable: Send + Sync {
    fn tunnel(&self) -> Arc<Tunnel>;
}

/// A live backend connection
#[async_trait]
pub trait Session: Send + Sync {
    /// Backend protocol tag, e.g. `ssh` or `rdp`
    fn protocol(&self) -> &str;

    /// Dial arbitrary destinations through this session's path
    fn transport(&self) -> Arc<dyn Dialer>;

    /// Release the underlying connection(s). Idempotent.
    async fn close(&self) -> Result<(), SessionError>;

    fn is_closed(&self) -> bool;

    fn as_terminal(&self) -> Option<&dyn TerminalCapable> {
        None
    }

    fn as_file_transfer(&self) -> Option<&dyn FileTransferCapable> {
        None
    }

    fn as_display(&self) -> Option<&dyn DisplayCapable> {
        None
    }
}

impl dyn Session {
    /// Capabilities this session supports
    pub fn capabilities(&self) -> Vec<Capability> {
        [
            Capability::Terminal,
            Capability::FileTransfer,
            Capability::Display,
        ]
        .into_iter()
        .filter(|c| self.supports(*c))
        .collect()
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Terminal => self.as_terminal().is_some(),
            Capability::FileTransfer => self.as_file_transfer().is_some(),
            Capability::Display => self.as_display().is_some(),
        }
    }

    fn unsupported(&self, capability: Capability) -> SessionError {
        SessionError::UnsupportedCapability {
            protocol: self.protocol().to_string(),
            capability,
        }
    }

    pub fn terminal(&self) -> Result<&dyn TerminalCapable, SessionError> {
        self.as_terminal()
            .ok_or_else(|| self.unsupported(Capability::Terminal))
    }

    pub fn file_transfer(&self) -> Result<&dyn FileTransferCapable, SessionError> {
        self.as_file_transfer()
            .ok_or_else(|| self.unsupported(Capability::FileTransfer))
    }

    pub fn display(&self) -> Result<&dyn DisplayCapable, SessionError> {
        self.as_display()
            .ok_or_else(|| self.unsupported(Capability::Display))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct NoDial;

    #[async_trait]
    impl Dialer for NoDial {
        async fn dial(&self, _host: &str, _port: u16) -> Result<BoxedStream, SessionError> {
            Err(SessionError::Closed)
        }
    }

    /// Session with no optional capabilities
    #[derive(Default)]
    pub(crate) struct BareSession {
        pub closed: AtomicBool,
        pub close_calls: AtomicUsize,
    }

    #[async_trait]
    impl Session for BareSession {
        fn protocol(&self) -> &str {
            "bare"
        }

        fn transport(&self) -> Arc<dyn Dialer> {
            Arc::new(NoDial)
        }

        async fn close(&self) -> Result<(), SessionError> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_missing_capability_reports_unsupported() {
        let session: Box<dyn Session> = Box::new(BareSession::default());
        assert!(session.capabilities().is_empty());
        assert!(!session.supports(Capability::Terminal));

        let err = session.terminal().err().unwrap();
        assert_eq!(
            err.to_string(),
            "Capability not supported: bare session has no terminal"
        );
        assert!(matches!(
            session.file_transfer().err().unwrap(),
            SessionError::UnsupportedCapability {
                capability: Capability::FileTransfer,
                ..
            }
        ));
        assert!(session.display().is_err());
    }
}
