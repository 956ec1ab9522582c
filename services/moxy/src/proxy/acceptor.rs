//! Listening socket lifecycle.
//!
//! An [`Acceptor`] owns one listening socket. Binding happens on the
//! acceptor's own task; the outcome is reported exactly once through a
//! oneshot handshake so the starter can wait for it. After a successful bind
//! the task accepts connections until cancelled, handing each one to the
//! `on_accept` callback as an independent task.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::worker::Worker;

/// Listen backlog for route sockets.
pub const LISTEN_BACKLOG: u32 = 1024;

/// Back-off after a failed accept call.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Result of a bind attempt, produced exactly once per acceptor start.
#[derive(Debug)]
pub enum BindOutcome {
    /// The listening socket is bound to `port`.
    Bound { port: u16 },
    /// The listening socket could not be bound.
    Failed { port: u16, error: io::Error },
}

impl BindOutcome {
    pub fn port(&self) -> u16 {
        match self {
            BindOutcome::Bound { port } | BindOutcome::Failed { port, .. } => *port,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, BindOutcome::Bound { .. })
    }
}

/// A running accept loop for one local address.
pub struct Acceptor {
    addr: SocketAddr,
    worker: Worker,
    bind_rx: Option<oneshot::Receiver<BindOutcome>>,
    /// First outcome seen by `wait_bound`, as the error kind on failure.
    reported: Option<std::result::Result<u16, io::ErrorKind>>,
}

impl Acceptor {
    /// Spawn the acceptor task for `addr`.
    ///
    /// `on_accept` is called on the accept loop for every connection and must
    /// only build the future that handles it; that future runs as its own
    /// task, tracked by the acceptor and shut down when the acceptor exits.
    pub fn start<F, Fut>(
        addr: SocketAddr,
        cancel: CancellationToken,
        terminate_timeout: Duration,
        on_accept: F,
    ) -> Self
    where
        F: FnMut(TcpStream, SocketAddr) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (bind_tx, bind_rx) = oneshot::channel();

        let worker = Worker::spawn(
            format!("acceptor:{}", addr.port()),
            cancel,
            terminate_timeout,
            move |cancel| run_accept_loop(addr, cancel, bind_tx, on_accept),
        );

        Self {
            addr,
            worker,
            bind_rx: Some(bind_rx),
            reported: None,
        }
    }

    /// Wait for the bind outcome.
    ///
    /// The first call waits until the acceptor task has reported. Later calls
    /// repeat that outcome without waiting; a repeated failure carries the
    /// original error kind.
    pub async fn wait_bound(&mut self) -> BindOutcome {
        let port = self.addr.port();

        if let Some(reported) = self.reported {
            return match reported {
                Ok(port) => BindOutcome::Bound { port },
                Err(kind) => BindOutcome::Failed {
                    port,
                    error: io::Error::new(kind, "bind already failed"),
                },
            };
        }

        let outcome = match self.bind_rx.take() {
            Some(bind_rx) => match bind_rx.await {
                Ok(outcome) => outcome,
                Err(_) => BindOutcome::Failed {
                    port,
                    error: io::Error::other("acceptor exited before reporting its bind outcome"),
                },
            },
            None => BindOutcome::Failed {
                port,
                error: io::Error::other("bind outcome already taken"),
            },
        };

        self.reported = Some(match &outcome {
            BindOutcome::Bound { port } => Ok(*port),
            BindOutcome::Failed { error, .. } => Err(error.kind()),
        });
        outcome
    }

    /// Whether the accept loop has exited.
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Stop accepting, close the listening socket and wait for the task and
    /// any in-flight connection setup to exit.
    pub async fn stop(&mut self) {
        self.worker.kill_and_wait().await;
    }
}

/// Create a listening socket with `SO_REUSEADDR` set.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

async fn run_accept_loop<F, Fut>(
    addr: SocketAddr,
    cancel: CancellationToken,
    bind_tx: oneshot::Sender<BindOutcome>,
    mut on_accept: F,
) where
    F: FnMut(TcpStream, SocketAddr) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = match bind_listener(addr) {
        Ok(listener) => listener,
        Err(e) => {
            warn!(bind_addr = %addr, error = %e, "Failed to bind listener");
            let _ = bind_tx.send(BindOutcome::Failed {
                port: addr.port(),
                error: e,
            });
            return;
        }
    };

    let port = listener
        .local_addr()
        .map(|local| local.port())
        .unwrap_or(addr.port());
    info!(bind_addr = %addr, port, "Listener bound");

    if bind_tx.send(BindOutcome::Bound { port }).is_err() {
        debug!(port, "Nobody is waiting for the bind outcome");
    }

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(port, error = %e, "Connection handler panicked");
                    }
                }
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(port, peer_addr = %peer_addr, "Connection accepted");
                    connections.spawn(on_accept(stream, peer_addr));
                }
                Err(e) => {
                    warn!(port, error = %e, "Accept error");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            },
        }
    }

    // Connection setup still in flight must not outlive the acceptor.
    connections.shutdown().await;
    drop(listener);
    info!(port, "Listener stopped");
}
