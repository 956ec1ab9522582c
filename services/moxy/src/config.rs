//! Proxy configuration.
//!
//! [`ProxySettings`] tunes the runtime behaviour of a [`crate::ProxyServer`].
//! [`Config`] is the env-driven configuration of the `moxy` binary.

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::proxy::RemoteAddr;

/// Default relay buffer size (10 KiB).
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 10 * 1024;

/// Smallest accepted relay buffer.
pub const MIN_RELAY_BUFFER_SIZE: usize = 1024;

/// Upper bound for the pause between relay iterations.
pub const MAX_RELAY_PAUSE: Duration = Duration::from_millis(50);

/// Default connect timeout for upstream connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default grace period a task gets to exit after cancellation.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime settings shared by every route of a server.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Local address listening sockets bind to.
    pub bind_ip: IpAddr,
    /// Size of each relay pump's read buffer.
    pub relay_buffer_size: usize,
    /// Pause between successive read/forward cycles of a pump.
    pub relay_pause: Duration,
    /// Timeout for connecting to a route's remote address.
    pub connect_timeout: Duration,
    /// Grace period before a cancelled task is aborted.
    pub terminate_timeout: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            relay_buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
            relay_pause: Duration::ZERO,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
        }
    }
}

impl ProxySettings {
    pub fn with_bind_ip(mut self, bind_ip: IpAddr) -> Self {
        self.bind_ip = bind_ip;
        self
    }

    pub fn with_relay_buffer_size(mut self, size: usize) -> Self {
        self.relay_buffer_size = size;
        self
    }

    pub fn with_relay_pause(mut self, pause: Duration) -> Self {
        self.relay_pause = pause;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    /// Check that the settings are within supported bounds.
    pub fn validate(&self) -> Result<()> {
        if self.relay_buffer_size < MIN_RELAY_BUFFER_SIZE {
            bail!(
                "relay buffer must be at least {} bytes, got {}",
                MIN_RELAY_BUFFER_SIZE,
                self.relay_buffer_size
            );
        }
        if self.relay_pause > MAX_RELAY_PAUSE {
            bail!(
                "relay pause must be at most {}ms, got {}ms",
                MAX_RELAY_PAUSE.as_millis(),
                self.relay_pause.as_millis()
            );
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be greater than zero");
        }
        Ok(())
    }
}

/// One `LOCAL_PORT=HOST:PORT` route entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub local_port: u16,
    pub remote: RemoteAddr,
}

impl FromStr for RouteSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (local, remote) = s
            .split_once('=')
            .with_context(|| format!("route '{}' must look like LOCAL_PORT=HOST:PORT", s))?;

        let local_port: u16 = local
            .trim()
            .parse()
            .with_context(|| format!("invalid local port in route '{}'", s))?;

        let remote: RemoteAddr = remote
            .trim()
            .parse()
            .with_context(|| format!("invalid remote address in route '{}'", s))?;

        Ok(Self { local_port, remote })
    }
}

/// Parse a `;` or `,` separated list of route entries.
pub fn parse_routes(raw: &str) -> Result<Vec<RouteSpec>> {
    raw.split([';', ','])
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(RouteSpec::from_str)
        .collect()
}

/// Binary configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Routes to register at startup.
    pub routes: Vec<RouteSpec>,

    /// Server runtime settings.
    pub settings: ProxySettings,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let raw_routes = std::env::var("MOXY_ROUTES")
            .context("Missing routes. Set MOXY_ROUTES (example: 7878=localhost:9090).")?;
        let routes = parse_routes(&raw_routes)?;
        if routes.is_empty() {
            bail!("MOXY_ROUTES does not contain any route");
        }

        let mut settings = ProxySettings::default();

        if let Some(bind_ip) = std::env::var("MOXY_BIND_IP")
            .ok()
            .map(|v| v.parse::<IpAddr>())
            .transpose()
            .context("MOXY_BIND_IP must be an IP address.")?
        {
            settings.bind_ip = bind_ip;
        }

        if let Some(size) = env_number("MOXY_RELAY_BUFFER_BYTES")? {
            settings.relay_buffer_size = size as usize;
        }

        if let Some(ms) = env_number("MOXY_RELAY_PAUSE_MS")? {
            settings.relay_pause = Duration::from_millis(ms);
        }

        if let Some(ms) = env_number("MOXY_CONNECT_TIMEOUT_MS")? {
            settings.connect_timeout = Duration::from_millis(ms);
        }

        settings.validate()?;

        let log_level = std::env::var("MOXY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            routes,
            settings,
            log_level,
        })
    }
}

fn env_number(name: &str) -> Result<Option<u64>> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().parse())
        .transpose()
        .with_context(|| format!("{} must be a non-negative integer.", name))
}
