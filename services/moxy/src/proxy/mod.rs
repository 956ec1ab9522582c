//! TCP port-forwarding engine.
//!
//! This module provides:
//! - The route table and server lifecycle
//! - Per-port listening sockets with a synchronous bind handshake
//! - Per-connection bidirectional relays
//! - Cancel-then-join termination of every background task
//!
//! ## Architecture
//!
//! ```text
//! ProxyServer -> Route -> Acceptor --accept--> connect upstream -> RelayPair
//!                  |                                                 |
//!                  +-------------- active relay set <----------------+
//!                                                     Pump (outbound)
//!                                                     Pump (inbound)
//! ```
//!
//! Every task runs under a cancellation token derived from the server's
//! root token: server -> route start cycle -> relay pair.
//!
//! ## Usage
//!
//! ```ignore
//! use moxy::ProxyServer;
//!
//! let server = ProxyServer::new();
//! server.listen_on(7878).connect_to_host("localhost", 9090).await?;
//! server.start().await?;
//! // ...
//! server.stop().await;
//! ```

mod acceptor;
mod pump;
mod relay;
mod route;
mod server;
mod worker;

pub use acceptor::{bind_listener, Acceptor, BindOutcome, LISTEN_BACKLOG};
pub use pump::{Direction, Pump, PumpExit, PumpOptions, PumpReport, RelayTag};
pub use relay::RelayPair;
pub use route::{RemoteAddr, Route, RouteConfig};
pub use server::{ProxyServer, RouteBuilder};
pub use worker::Worker;
