//! moxy: a runtime-configurable TCP port-forwarding proxy.
//!
//! Routes map a local port to a remote address and can be added, stopped and
//! removed while the server runs. Relayed bytes are passed through unchanged;
//! observers can watch connections and data without affecting the relay.

pub mod config;
pub mod error;
pub mod events;
pub mod proxy;

pub use config::{Config, ProxySettings, RouteSpec};
pub use error::{InvalidRemoteAddr, ProxyError};
pub use events::{Dispatcher, LoggingObserver, ProxyObserver};
pub use proxy::{
    BindOutcome, Direction, ProxyServer, RelayTag, RemoteAddr, RouteBuilder, RouteConfig,
};
