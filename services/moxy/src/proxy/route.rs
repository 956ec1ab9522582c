//! Per-port route lifecycle.
//!
//! A [`Route`] maps one local port to one remote address. Starting it spawns
//! an [`Acceptor`] and waits for the bind outcome. Every accepted connection
//! is connected upstream and wrapped in a [`RelayPair`] that the route keeps
//! in its active set until it finishes or the route is stopped.
//!
//! Stopping a route stops the acceptor first (no new connections, and any
//! connection setup still in flight is shut down with it), then stops every
//! active relay pair.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::acceptor::{Acceptor, BindOutcome};
use super::pump::{PumpOptions, RelayTag};
use super::relay::RelayPair;
use crate::config::ProxySettings;
use crate::error::{InvalidRemoteAddr, ProxyError, Result};
use crate::events::Dispatcher;

/// Where a route forwards its connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteAddr {
    /// A resolved socket address.
    Socket(SocketAddr),
    /// A host name (or IP literal) resolved on every connect.
    Host { host: String, port: u16 },
}

impl RemoteAddr {
    pub fn host(host: impl Into<String>, port: u16) -> Self {
        RemoteAddr::Host {
            host: host.into(),
            port,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            RemoteAddr::Socket(addr) => addr.port(),
            RemoteAddr::Host { port, .. } => *port,
        }
    }

    /// Open a connection to this address.
    pub async fn connect(&self) -> io::Result<TcpStream> {
        match self {
            RemoteAddr::Socket(addr) => TcpStream::connect(addr).await,
            RemoteAddr::Host { host, port } => TcpStream::connect((host.as_str(), *port)).await,
        }
    }
}

impl From<SocketAddr> for RemoteAddr {
    fn from(addr: SocketAddr) -> Self {
        RemoteAddr::Socket(addr)
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteAddr::Socket(addr) => write!(f, "{}", addr),
            RemoteAddr::Host { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

impl FromStr for RemoteAddr {
    type Err = InvalidRemoteAddr;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(RemoteAddr::Socket(addr));
        }

        let invalid = || InvalidRemoteAddr(s.to_string());
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || host.contains(':') {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(RemoteAddr::host(host, port))
    }
}

/// Immutable mapping of one local port to one remote address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub local_port: u16,
    pub remote: RemoteAddr,
}

impl RouteConfig {
    pub fn new(local_port: u16, remote: impl Into<RemoteAddr>) -> Self {
        Self {
            local_port,
            remote: remote.into(),
        }
    }
}

type RelaySet = Arc<Mutex<HashMap<u64, RelayPair>>>;

fn lock_relays(relays: &RelaySet) -> MutexGuard<'_, HashMap<u64, RelayPair>> {
    match relays.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Runtime state of a registered route.
pub struct Route {
    config: RouteConfig,
    settings: Arc<ProxySettings>,
    dispatcher: Arc<Dispatcher>,
    /// Server-wide token; every start cycle runs under a fresh child of it.
    parent: CancellationToken,
    acceptor: Option<Acceptor>,
    relays: RelaySet,
}

impl Route {
    pub fn new(
        config: RouteConfig,
        settings: Arc<ProxySettings>,
        dispatcher: Arc<Dispatcher>,
        parent: CancellationToken,
    ) -> Self {
        Self {
            config,
            settings,
            dispatcher,
            parent,
            acceptor: None,
            relays: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    pub fn local_port(&self) -> u16 {
        self.config.local_port
    }

    /// Whether the route currently holds a listening socket.
    pub fn is_bound(&self) -> bool {
        self.acceptor.as_ref().is_some_and(|a| !a.is_finished())
    }

    /// Number of relay pairs still running.
    pub fn active_relays(&self) -> usize {
        let mut relays = lock_relays(&self.relays);
        relays.retain(|_, pair| !pair.is_finished());
        relays.len()
    }

    /// Bind the route's port and start accepting.
    ///
    /// Waits until the bind outcome is known. Returns `Ok(true)` if this call
    /// bound the port and `Ok(false)` if the route was already bound.
    pub async fn start(&mut self) -> Result<bool> {
        if self.is_bound() {
            debug!(port = self.local_port(), "Route already bound");
            return Ok(false);
        }
        // A previous acceptor that exited on its own still needs joining.
        if self.acceptor.is_some() {
            self.stop().await;
        }

        let port = self.local_port();
        let bind_addr = SocketAddr::new(self.settings.bind_ip, port);
        let cancel = self.parent.child_token();

        let handler = ConnectionHandler {
            listen_port: port,
            remote: self.config.remote.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            relays: Arc::clone(&self.relays),
            cancel: cancel.clone(),
            options: PumpOptions {
                buffer_size: self.settings.relay_buffer_size,
                pause: self.settings.relay_pause,
            },
            connect_timeout: self.settings.connect_timeout,
            terminate_timeout: self.settings.terminate_timeout,
        };

        let mut acceptor = Acceptor::start(
            bind_addr,
            cancel,
            self.settings.terminate_timeout,
            move |stream, peer_addr| handler.clone().handle(stream, peer_addr),
        );

        match acceptor.wait_bound().await {
            BindOutcome::Bound { .. } => {
                info!(port, remote = %self.config.remote, "Route started");
                self.acceptor = Some(acceptor);
                Ok(true)
            }
            BindOutcome::Failed { port, error } => {
                acceptor.stop().await;
                Err(ProxyError::BindFailed {
                    port,
                    source: error,
                })
            }
        }
    }

    /// Stop accepting and tear down every active relay pair.
    ///
    /// Returns once the acceptor and all pumps have exited. Stopping an
    /// unbound route is a no-op.
    pub async fn stop(&mut self) {
        let port = self.local_port();

        if let Some(mut acceptor) = self.acceptor.take() {
            acceptor.stop().await;
        }

        let mut pairs: Vec<RelayPair> = lock_relays(&self.relays)
            .drain()
            .map(|(_, pair)| pair)
            .collect();

        if pairs.is_empty() {
            return;
        }

        let count = pairs.len();
        join_all(pairs.iter_mut().map(|pair| pair.stop())).await;
        info!(port, relays = count, "Route relays stopped");
    }
}

/// Per-connection setup run for each accepted socket.
#[derive(Clone)]
struct ConnectionHandler {
    listen_port: u16,
    remote: RemoteAddr,
    dispatcher: Arc<Dispatcher>,
    relays: RelaySet,
    cancel: CancellationToken,
    options: PumpOptions,
    connect_timeout: Duration,
    terminate_timeout: Duration,
}

impl ConnectionHandler {
    async fn handle(self, local: TcpStream, peer_addr: SocketAddr) {
        let upstream =
            match tokio::time::timeout(self.connect_timeout, self.remote.connect()).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(
                        port = self.listen_port,
                        peer_addr = %peer_addr,
                        remote = %self.remote,
                        error = %e,
                        "Upstream connection failed"
                    );
                    return;
                }
                Err(_) => {
                    warn!(
                        port = self.listen_port,
                        peer_addr = %peer_addr,
                        remote = %self.remote,
                        timeout_ms = self.connect_timeout.as_millis() as u64,
                        "Upstream connection timed out"
                    );
                    return;
                }
            };

        let remote_addr = match upstream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(port = self.listen_port, error = %e, "Upstream closed during setup");
                return;
            }
        };

        let tag = RelayTag {
            listen_port: self.listen_port,
            remote: remote_addr,
        };
        let pair = RelayPair::start(
            local,
            upstream,
            tag,
            Arc::clone(&self.dispatcher),
            self.options,
            &self.cancel,
            self.terminate_timeout,
        );
        let relay_id = pair.id();

        {
            let mut relays = lock_relays(&self.relays);
            relays.retain(|_, pair| !pair.is_finished());
            relays.insert(relay_id, pair);
        }

        debug!(
            relay_id,
            port = self.listen_port,
            peer_addr = %peer_addr,
            remote = %remote_addr,
            "Connection relayed"
        );
        self.dispatcher.connection_made(self.listen_port, remote_addr);
    }
}
