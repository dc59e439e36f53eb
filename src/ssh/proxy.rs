//! Multi-hop transport
//!
//! Builds SSH-over-SSH tunnels through an ordered gateway chain:
//! ```text
//! Gateway --SSH--> [Hop0] --direct-tcpip--> [Hop1] --direct-tcpip--> ... --> [HopN = destination]
//! ```
//!
//! The tunnel is established lazily, on the first `ensure_client` / `dial`,
//! and at most once per `Transport`. Concurrent first users wait on the same
//! build; a failed build is cached and reported to every caller, so retrying
//! means building a fresh `Transport`.
//!
//! The per-hop SSH work sits behind [`HopConnector`]; the russh
//! implementation lives in `client.rs`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::auth::{resolve_auth, HopAuth};
use super::client::SshHopConnector;
use super::config::{Endpoint, GatewayChain};
use super::error::{HopPhase, SshError};
use crate::session::{BoxedStream, Dialer, SessionError};

/// A single hop's failure, before it is attributed to a hop index
#[derive(Debug, Clone)]
pub struct HopFailure {
    pub phase: HopPhase,
    pub reason: String,
}

impl HopFailure {
    pub fn new(phase: HopPhase, reason: impl fmt::Display) -> Self {
        Self {
            phase,
            reason: reason.to_string(),
        }
    }
}

/// Per-hop connection primitives used by the chain walker
#[async_trait]
pub trait HopConnector: Send + Sync + 'static {
    /// Established, authenticated connection to one hop
    type Client: Send + Sync + 'static;
    /// Byte stream tunneled through a client
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Dial the first hop over the network and authenticate
    async fn connect_direct(
        &self,
        endpoint: &Endpoint,
        auth: &HopAuth,
    ) -> Result<Self::Client, HopFailure>;

    /// Run the SSH handshake for `endpoint` over an existing tunnel
    async fn connect_over(
        &self,
        stream: Self::Stream,
        endpoint: &Endpoint,
        auth: &HopAuth,
    ) -> Result<Self::Client, HopFailure>;

    /// Open a TCP stream to `host:port` through `via`
    async fn open_tunnel(
        &self,
        via: &Self::Client,
        host: &str,
        port: u16,
    ) -> Result<Self::Stream, SshError>;

    /// Best-effort disconnect
    async fn disconnect(&self, client: &Self::Client);
}

/// Every established hop of a chain; the last one is the destination
pub struct ChainClient<T> {
    hops: Vec<T>,
}

impl<T> ChainClient<T> {
    /// Connection to the destination (last hop)
    pub fn target(&self) -> &T {
        // `establish` never returns an empty client list.
        &self.hops[self.hops.len() - 1]
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }
}

fn hop_error(index: usize, hop: &Endpoint, phase: HopPhase, reason: impl fmt::Display) -> SshError {
    SshError::Hop {
        index,
        host: hop.host.clone(),
        port: hop.port,
        phase,
        reason: reason.to_string(),
    }
}

async fn teardown<C: HopConnector>(connector: &C, clients: &[C::Client]) {
    for client in clients.iter().rev() {
        connector.disconnect(client).await;
    }
}

/// Walk the chain in order, tunneling each hop through the previous one
///
/// Credentials for every hop are resolved before the first network call, so
/// configuration errors never touch the network. Any hop failure tears down
/// the hops already established.
async fn establish<C: HopConnector>(
    connector: &C,
    chain: &GatewayChain,
) -> Result<ChainClient<C::Client>, SshError> {
    let auths = chain
        .hops()
        .iter()
        .enumerate()
        .map(|(i, hop)| resolve_auth(hop).map_err(|e| hop_error(i, hop, HopPhase::Auth, e)))
        .collect::<Result<Vec<_>, _>>()?;

    info!("Establishing {}-hop gateway chain to {}", chain.len(), chain.destination().address());

    let mut clients: Vec<C::Client> = Vec::with_capacity(chain.len());

    for (i, (hop, auth)) in chain.hops().iter().zip(&auths).enumerate() {
        info!(
            "Hop {}: connecting to {}@{} ({})",
            i,
            hop.username,
            hop.address(),
            auth.kind()
        );

        let connected = match clients.last() {
            None => connector.connect_direct(hop, auth).await,
            Some(prev) => match connector.open_tunnel(prev, &hop.host, hop.port).await {
                Ok(stream) => {
                    debug!("Hop {}: tunnel open, starting handshake", i);
                    connector.connect_over(stream, hop, auth).await
                }
                Err(e) => Err(HopFailure::new(HopPhase::Tunnel, e)),
            },
        };

        match connected {
            Ok(client) => clients.push(client),
            Err(failure) => {
                warn!("Hop {} ({}) {} failed: {}", i, hop.address(), failure.phase, failure.reason);
                teardown(connector, &clients).await;
                return Err(hop_error(i, hop, failure.phase, failure.reason));
            }
        }
    }

    info!("Gateway chain established ({} hops)", clients.len());
    Ok(ChainClient { hops: clients })
}

type CachedClient<T> = Result<Arc<ChainClient<T>>, Arc<SshError>>;

/// Lazily established path through a gateway chain
pub struct Transport<C: HopConnector = SshHopConnector> {
    chain: GatewayChain,
    connector: C,
    client: OnceCell<CachedClient<C::Client>>,
    closed: AtomicBool,
    released: AtomicBool,
}

impl<C: HopConnector> Transport<C> {
    /// Build a transport; no network I/O happens until first use
    pub fn build(chain: GatewayChain, connector: C) -> Result<Self, SshError> {
        if chain.is_empty() {
            return Err(SshError::EmptyChain);
        }
        Ok(Self {
            chain,
            connector,
            client: OnceCell::new(),
            closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
        })
    }

    pub fn chain(&self) -> &GatewayChain {
        &self.chain
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the chain has been built successfully
    pub fn is_established(&self) -> bool {
        matches!(self.client.get(), Some(Ok(_)))
    }

    /// Establish the chain once and return the shared client
    pub async fn ensure_client(&self) -> Result<Arc<ChainClient<C::Client>>, SshError> {
        if self.is_closed() {
            return Err(SshError::TransportClosed);
        }

        let cached = self
            .client
            .get_or_init(|| async {
                establish(&self.connector, &self.chain)
                    .await
                    .map(Arc::new)
                    .map_err(Arc::new)
            })
            .await;

        let client = match cached {
            Ok(client) => client.clone(),
            Err(e) => return Err(SshError::Shared(e.clone())),
        };

        // close() may have raced with the build and found nothing to disconnect
        if self.is_closed() {
            self.release(&client).await;
            return Err(SshError::TransportClosed);
        }

        Ok(client)
    }

    /// Open a stream to `host:port` from the destination hop
    pub async fn dial(&self, host: &str, port: u16) -> Result<C::Stream, SshError> {
        let client = self.ensure_client().await?;
        debug!("Dialing {}:{} through gateway chain", host, port);
        self.connector.open_tunnel(client.target(), host, port).await
    }

    /// Disconnect every established hop, destination first. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(Ok(client)) = self.client.get() {
            info!("Closing gateway chain ({} hops)", client.hop_count());
            self.release(client).await;
        }
    }

    /// Disconnect the built chain; only the first caller does the work
    async fn release(&self, client: &ChainClient<C::Client>) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        teardown(&self.connector, &client.hops).await;
    }
}

#[async_trait]
impl<C: HopConnector> Dialer for Transport<C> {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, SessionError> {
        let stream = Transport::dial(self, host, port).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ssh::config::AuthType;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    #[derive(Debug)]
    pub(crate) struct FakeClient {
        pub host: String,
    }

    /// Records every hop operation instead of touching the network
    #[derive(Default)]
    pub(crate) struct FakeConnector {
        pub log: Mutex<Vec<String>>,
        pub direct_count: AtomicUsize,
        pub fail_at: Option<(String, HopPhase)>,
        pub delay: Option<Duration>,
    }

    impl FakeConnector {
        fn record(&self, entry: String) {
            self.log.lock().push(entry);
        }

        fn check_fail(&self, host: &str, phase: HopPhase) -> Result<(), HopFailure> {
            match &self.fail_at {
                Some((h, p)) if h == host && *p == phase => {
                    Err(HopFailure::new(phase, "scripted failure"))
                }
                _ => Ok(()),
            }
        }

        pub fn entries(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    #[async_trait]
    impl HopConnector for FakeConnector {
        type Client = FakeClient;
        type Stream = DuplexStream;

        async fn connect_direct(
            &self,
            endpoint: &Endpoint,
            _auth: &HopAuth,
        ) -> Result<FakeClient, HopFailure> {
            self.direct_count.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.check_fail(&endpoint.host, HopPhase::Dial)?;
            self.check_fail(&endpoint.host, HopPhase::Handshake)?;
            self.record(format!("direct:{}", endpoint.host));
            Ok(FakeClient {
                host: endpoint.host.clone(),
            })
        }

        async fn connect_over(
            &self,
            _stream: DuplexStream,
            endpoint: &Endpoint,
            _auth: &HopAuth,
        ) -> Result<FakeClient, HopFailure> {
            self.check_fail(&endpoint.host, HopPhase::Handshake)?;
            self.record(format!("over:{}", endpoint.host));
            Ok(FakeClient {
                host: endpoint.host.clone(),
            })
        }

        async fn open_tunnel(
            &self,
            via: &FakeClient,
            host: &str,
            port: u16,
        ) -> Result<DuplexStream, SshError> {
            if self.check_fail(host, HopPhase::Tunnel).is_err() {
                return Err(SshError::ChannelError("administratively prohibited".into()));
            }
            self.record(format!("tunnel:{}->{}:{}", via.host, host, port));
            let (stream, _peer) = tokio::io::duplex(64);
            Ok(stream)
        }

        async fn disconnect(&self, client: &FakeClient) {
            self.record(format!("disconnect:{}", client.host));
        }
    }

    pub(crate) fn three_hop_chain() -> GatewayChain {
        GatewayChain::new(vec![
            Endpoint::with_password("target", "root", "t").order(30),
            Endpoint::with_password("jump1", "ops", "j1").order(10),
            Endpoint::with_password("jump2", "ops", "j2").order(20).port(2222),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_hops_visited_in_order() {
        let transport = Transport::build(three_hop_chain(), FakeConnector::default()).unwrap();
        let client = transport.ensure_client().await.unwrap();
        assert_eq!(client.hop_count(), 3);
        assert_eq!(client.target().host, "target");
        assert_eq!(
            transport.connector().entries(),
            vec![
                "direct:jump1",
                "tunnel:jump1->jump2:2222",
                "over:jump2",
                "tunnel:jump2->target:22",
                "over:target",
            ]
        );
    }

    #[tokio::test]
    async fn test_build_is_lazy() {
        let transport = Transport::build(three_hop_chain(), FakeConnector::default()).unwrap();
        assert!(!transport.is_established());
        assert!(transport.connector().entries().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_first_use_builds_once() {
        let connector = FakeConnector {
            delay: Some(Duration::from_millis(30)),
            ..Default::default()
        };
        let transport = Arc::new(Transport::build(three_hop_chain(), connector).unwrap());

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let transport = transport.clone();
            tasks.push(tokio::spawn(async move { transport.ensure_client().await }));
        }

        let mut clients = Vec::new();
        for task in tasks {
            clients.push(task.await.unwrap().unwrap());
        }

        assert_eq!(transport.connector().direct_count.load(Ordering::SeqCst), 1);
        assert!(clients.iter().all(|c| Arc::ptr_eq(c, &clients[0])));
    }

    #[tokio::test]
    async fn test_handshake_failure_names_hop_and_is_cached() {
        let connector = FakeConnector {
            fail_at: Some(("jump2".into(), HopPhase::Handshake)),
            ..Default::default()
        };
        let transport = Transport::build(three_hop_chain(), connector).unwrap();

        let err = transport.ensure_client().await.err().unwrap();
        assert_eq!(err.hop_index(), Some(1));
        assert_eq!(err.hop_phase(), Some(HopPhase::Handshake));
        assert!(err.to_string().contains("jump2:2222"));

        // The established first hop is torn down, not reused.
        assert!(transport
            .connector()
            .entries()
            .contains(&"disconnect:jump1".to_string()));

        let again = transport.ensure_client().await.err().unwrap();
        assert_eq!(again.hop_index(), Some(1));
        assert_eq!(transport.connector().direct_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_hop_dial_failure() {
        let connector = FakeConnector {
            fail_at: Some(("jump1".into(), HopPhase::Dial)),
            ..Default::default()
        };
        let transport = Transport::build(three_hop_chain(), connector).unwrap();
        let err = transport.ensure_client().await.err().unwrap();
        assert_eq!(err.hop_index(), Some(0));
        assert_eq!(err.hop_phase(), Some(HopPhase::Dial));
    }

    #[tokio::test]
    async fn test_tunnel_failure_attributed_to_next_hop() {
        let connector = FakeConnector {
            fail_at: Some(("target".into(), HopPhase::Tunnel)),
            ..Default::default()
        };
        let transport = Transport::build(three_hop_chain(), connector).unwrap();
        let err = transport.ensure_client().await.err().unwrap();
        assert_eq!(err.hop_index(), Some(2));
        assert_eq!(err.hop_phase(), Some(HopPhase::Tunnel));
    }

    #[tokio::test]
    async fn test_bad_credentials_never_dial() {
        let mut endpoints = vec![
            Endpoint::with_password("jump1", "ops", "j1").order(1),
            Endpoint::with_password("target", "root", "t").order(2),
        ];
        endpoints[1].auth_type = AuthType("kerberos".into());
        let chain = GatewayChain::new(endpoints).unwrap();
        let transport = Transport::build(chain, FakeConnector::default()).unwrap();

        let err = transport.ensure_client().await.err().unwrap();
        assert!(err.is_configuration());
        assert_eq!(err.hop_index(), Some(1));
        assert_eq!(err.hop_phase(), Some(HopPhase::Auth));
        assert_eq!(transport.connector().direct_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dial_goes_through_destination() {
        let transport = Transport::build(three_hop_chain(), FakeConnector::default()).unwrap();
        transport.dial("db.internal", 5432).await.unwrap();
        let entries = transport.connector().entries();
        assert_eq!(entries.last().unwrap(), "tunnel:target->db.internal:5432");

        transport.dial("cache.internal", 6379).await.unwrap();
        assert_eq!(transport.connector().direct_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let transport = Transport::build(three_hop_chain(), FakeConnector::default()).unwrap();
        transport.ensure_client().await.unwrap();

        transport.close().await;
        transport.close().await;

        let disconnects: Vec<String> = transport
            .connector()
            .entries()
            .into_iter()
            .filter(|e| e.starts_with("disconnect:"))
            .collect();
        assert_eq!(
            disconnects,
            vec!["disconnect:target", "disconnect:jump2", "disconnect:jump1"]
        );

        assert!(matches!(
            transport.dial("db", 1).await.err().unwrap(),
            SshError::TransportClosed
        ));
    }

    fn disconnect_count(transport: &Transport<FakeConnector>) -> usize {
        transport
            .connector()
            .entries()
            .iter()
            .filter(|e| e.starts_with("disconnect:"))
            .count()
    }

    #[tokio::test]
    async fn test_ensure_client_after_close_keeps_single_teardown() {
        let transport = Transport::build(three_hop_chain(), FakeConnector::default()).unwrap();
        transport.ensure_client().await.unwrap();
        transport.close().await;

        assert!(matches!(
            transport.ensure_client().await.err().unwrap(),
            SshError::TransportClosed
        ));
        assert_eq!(disconnect_count(&transport), 3);
    }

    #[tokio::test]
    async fn test_close_during_build_disconnects_each_hop_once() {
        let connector = FakeConnector {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let transport = Arc::new(Transport::build(three_hop_chain(), connector).unwrap());

        let building = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.ensure_client().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.close().await;

        assert!(matches!(
            building.await.unwrap().err().unwrap(),
            SshError::TransportClosed
        ));
        // A late close after the build finished must not disconnect again
        transport.close().await;

        let mut entries = transport.connector().entries();
        entries.retain(|e| e.starts_with("disconnect:"));
        assert_eq!(
            entries,
            vec!["disconnect:target", "disconnect:jump2", "disconnect:jump1"]
        );
    }
}
