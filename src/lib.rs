//! OxideGate - remote-access terminal gateway
//!
//! Opens interactive shells on hosts reachable only through a chain of SSH
//! bastions, and relays remote-desktop display sessions from a display
//! daemon, behind one session API:
//!
//! - [`ssh`]: gateway chains, per-hop authentication, the multi-hop transport
//! - [`display`]: display-protocol codec and tunnel
//! - [`session`]: capability model, terminal pump, connector registry, pool
//! - [`bridge`]: WebSocket relays for browser clients
//! - [`config`]: gateway settings and their storage

pub mod bridge;
pub mod config;
pub mod display;
pub mod session;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::GatewayConfig;
pub use session::{
    Capability, ConnectOptions, ConnectorRegistry, Session, SessionError, SessionPool,
};
pub use ssh::{Endpoint, GatewayChain, SshError};

/// Initialize logging
///
/// Filter comes from `RUST_LOG` (default `info`). Safe to call more than
/// once; later calls leave the first subscriber in place.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
        tracing::info!("logging initialized");
    }
}
