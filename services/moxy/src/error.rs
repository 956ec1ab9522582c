//! Error types for the proxy server.

use std::io;

use thiserror::Error;

/// Errors raised across the proxy API boundary.
///
/// Per-connection failures (upstream connect, relay I/O) never surface here;
/// they are contained at the relay and only logged.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A route for this local port is already registered.
    #[error("port_already_registered: there can only be one route per port, port {port} is already set up")]
    PortAlreadyRegistered { port: u16 },

    /// The listening socket for a route could not be bound.
    #[error("bind_failed: port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: io::Error,
    },
}

impl ProxyError {
    /// Get the stable reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::PortAlreadyRegistered { .. } => "port_already_registered",
            ProxyError::BindFailed { .. } => "bind_failed",
        }
    }

    /// The local port the error refers to.
    pub fn port(&self) -> u16 {
        match self {
            ProxyError::PortAlreadyRegistered { port } | ProxyError::BindFailed { port, .. } => {
                *port
            }
        }
    }
}

/// A remote address string that is not `HOST:PORT`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid remote address '{0}': expected HOST:PORT")]
pub struct InvalidRemoteAddr(pub String);

/// Result alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        let dup = ProxyError::PortAlreadyRegistered { port: 7878 };
        assert_eq!(dup.reason_code(), "port_already_registered");
        assert_eq!(dup.port(), 7878);

        let bind = ProxyError::BindFailed {
            port: 9090,
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert_eq!(bind.reason_code(), "bind_failed");
        assert_eq!(bind.port(), 9090);
    }

    #[test]
    fn test_display_mentions_port() {
        let err = ProxyError::PortAlreadyRegistered { port: 7878 };
        assert!(err.to_string().contains("7878"));
    }
}
