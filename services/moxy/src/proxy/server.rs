//! Route table and server lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::route::{RemoteAddr, Route, RouteConfig};
use crate::config::ProxySettings;
use crate::error::{ProxyError, Result};
use crate::events::{Dispatcher, ProxyObserver};

/// A runtime-configurable TCP port-forwarding server.
///
/// Routes are kept in registration order. All route-table operations take
/// the same lock and hold it until their sockets are bound or released, so
/// concurrent calls are applied one after another.
pub struct ProxyServer {
    started: AtomicBool,
    routes: Mutex<Vec<Route>>,
    dispatcher: Arc<Dispatcher>,
    settings: Arc<ProxySettings>,
    /// Root of every route, acceptor and relay token.
    shutdown: CancellationToken,
}

impl ProxyServer {
    /// Create a server with default settings.
    pub fn new() -> Self {
        Self::with_settings(ProxySettings::default())
    }

    /// Create a server with custom settings.
    pub fn with_settings(settings: ProxySettings) -> Self {
        Self {
            started: AtomicBool::new(false),
            routes: Mutex::new(Vec::new()),
            dispatcher: Arc::new(Dispatcher::new()),
            settings: Arc::new(settings),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Begin registering a route for `port`; finish with
    /// [`RouteBuilder::connect_to`].
    pub fn listen_on(&self, port: u16) -> RouteBuilder<'_> {
        RouteBuilder { server: self, port }
    }

    /// Bind every registered route, in registration order.
    ///
    /// If any route fails to bind, the routes bound by this call are stopped
    /// again, the server stays stopped and the bind error is returned. Calling
    /// `start` on a started server only logs a warning.
    pub async fn start(&self) -> Result<()> {
        let mut routes = self.routes.lock().await;

        if self.started.load(Ordering::SeqCst) {
            warn!("Server already started");
            return Ok(());
        }

        info!(route_count = routes.len(), "Starting proxy server");

        let mut bound_now = Vec::new();
        for index in 0..routes.len() {
            match routes[index].start().await {
                Ok(true) => bound_now.push(index),
                Ok(false) => {}
                Err(e) => {
                    error!(
                        port = e.port(),
                        error = %e,
                        rollback = bound_now.len(),
                        "Failed to start route, rolling back"
                    );
                    for &bound in &bound_now {
                        routes[bound].stop().await;
                    }
                    return Err(e);
                }
            }
        }

        self.started.store(true, Ordering::SeqCst);
        info!(route_count = routes.len(), "Proxy server started");
        Ok(())
    }

    /// Stop every route and wait for all acceptors and relays to exit.
    pub async fn stop(&self) {
        let mut routes = self.routes.lock().await;
        info!(route_count = routes.len(), "Stopping all port listeners");

        join_all(routes.iter_mut().map(|route| route.stop())).await;
        self.started.store(false, Ordering::SeqCst);

        info!("Proxy server stopped");
    }

    /// Stop listening on `port` but keep its route, so the next `start`
    /// binds it again.
    pub async fn stop_listening_on(&self, port: u16) {
        info!(port, "Stop listening on port");
        let mut routes = self.routes.lock().await;

        match routes.iter_mut().find(|route| route.local_port() == port) {
            Some(route) => route.stop().await,
            None => warn!(port, "Nothing is listening on port"),
        }
    }

    /// Stop listening on `port` and forget its route.
    pub async fn remove_listener_on(&self, port: u16) {
        info!(port, "Removing listener on port");
        let mut routes = self.routes.lock().await;

        match routes.iter().position(|route| route.local_port() == port) {
            Some(index) => {
                let mut route = routes.remove(index);
                route.stop().await;
            }
            None => warn!(port, "Nothing is listening on port"),
        }
    }

    /// Register an observer for connection and data events on every route.
    pub fn add_listener(&self, observer: Arc<dyn ProxyObserver>) {
        self.dispatcher.add_observer(observer);
    }

    /// Registered routes, in registration order.
    pub async fn routes(&self) -> Vec<RouteConfig> {
        let routes = self.routes.lock().await;
        routes.iter().map(|route| route.config().clone()).collect()
    }

    /// Whether a route holds a bound listening socket on `port`.
    pub async fn is_listening_on(&self, port: u16) -> bool {
        let routes = self.routes.lock().await;
        routes
            .iter()
            .any(|route| route.local_port() == port && route.is_bound())
    }

    /// Number of running relay pairs for the route on `port`.
    pub async fn active_relays(&self, port: u16) -> usize {
        let routes = self.routes.lock().await;
        routes
            .iter()
            .find(|route| route.local_port() == port)
            .map_or(0, Route::active_relays)
    }

    async fn register(&self, config: RouteConfig) -> Result<()> {
        let mut routes = self.routes.lock().await;
        let port = config.local_port;

        if routes.iter().any(|route| route.local_port() == port) {
            return Err(ProxyError::PortAlreadyRegistered { port });
        }

        let mut route = Route::new(
            config,
            Arc::clone(&self.settings),
            Arc::clone(&self.dispatcher),
            self.shutdown.clone(),
        );

        // A route added to a running server is only kept if it binds.
        if self.started.load(Ordering::SeqCst) {
            route.start().await?;
        }

        info!(port, remote = %route.config().remote, "Route registered");
        routes.push(route);
        Ok(())
    }
}

impl Default for ProxyServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if self.is_started() {
            warn!("Proxy server dropped while started, cancelling all routes");
        }
        self.shutdown.cancel();
    }
}

/// Second half of route registration, returned by [`ProxyServer::listen_on`].
#[must_use = "a route is only registered once connect_to is awaited"]
pub struct RouteBuilder<'a> {
    server: &'a ProxyServer,
    port: u16,
}

impl RouteBuilder<'_> {
    /// Forward connections on the local port to `remote`.
    ///
    /// Fails if the port already has a route. On a started server the route
    /// is bound before this returns; if binding fails the route is not kept.
    pub async fn connect_to(self, remote: impl Into<RemoteAddr>) -> Result<()> {
        self.server
            .register(RouteConfig::new(self.port, remote))
            .await
    }

    /// Forward connections on the local port to `host:port`, resolving the
    /// host on every connection.
    pub async fn connect_to_host(self, host: impl Into<String>, port: u16) -> Result<()> {
        self.connect_to(RemoteAddr::host(host, port)).await
    }
}
