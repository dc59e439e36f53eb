//! SSH module - gateway chains over russh
//!
//! # Features
//! - Per-hop credential resolution (password, key, passphrase-protected key)
//! - Multi-hop transport: each hop's SSH connection is carried over a
//!   direct-tcpip channel of the previous hop
//! - Lazy, once-only chain establishment shared by concurrent callers
//! - SSH backend session with terminal and SFTP capabilities

mod auth;
mod client;
mod config;
mod error;
mod proxy;
mod session;

pub use auth::{resolve_auth, HopAuth};
pub use client::{send_keepalive, ClientHandler, SshHopConnector};
pub use config::{AuthType, Endpoint, GatewayChain};
pub use error::{HopPhase, SshError};
pub use proxy::{ChainClient, HopConnector, HopFailure, Transport};
pub use session::{SshConnector, SshSession, SSH_PROTOCOL};
