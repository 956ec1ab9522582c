//! Bidirectional relay for one accepted connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use super::pump::{Direction, Pump, PumpExit, PumpOptions, PumpReport, RelayTag};
use super::worker::Worker;
use crate::events::Dispatcher;

static RELAY_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_relay_id() -> u64 {
    RELAY_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Bytes moved by each pump, recorded when the pump exits.
#[derive(Default)]
struct RelayTotals {
    outbound: AtomicU64,
    inbound: AtomicU64,
}

impl RelayTotals {
    fn record(&self, report: &PumpReport) {
        let counter = match report.direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        };
        counter.store(report.bytes, Ordering::Release);
    }
}

/// Two pumps relaying one local connection to its upstream connection.
///
/// Both pumps share one cancellation token (a child of the owning route's
/// token): when either pump ends, or the pair is stopped, both exit and both
/// sockets are closed.
pub struct RelayPair {
    id: u64,
    tag: RelayTag,
    cancel: CancellationToken,
    totals: Arc<RelayTotals>,
    outbound: Worker,
    inbound: Worker,
}

impl RelayPair {
    /// Split both streams and spawn one pump per direction.
    pub fn start(
        local: TcpStream,
        upstream: TcpStream,
        tag: RelayTag,
        dispatcher: Arc<Dispatcher>,
        options: PumpOptions,
        parent: &CancellationToken,
        terminate_timeout: Duration,
    ) -> Self {
        let id = next_relay_id();
        let cancel = parent.child_token();
        let totals = Arc::new(RelayTotals::default());

        let (local_read, local_write) = local.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let span = tracing::info_span!(
            "relay",
            relay_id = id,
            port = tag.listen_port,
            remote = %tag.remote
        );

        let outbound = {
            let pump = Pump::new(tag, Direction::Outbound, Arc::clone(&dispatcher), options);
            let span = span.clone();
            let totals = Arc::clone(&totals);
            Worker::spawn(
                format!("relay:{}:outbound", id),
                cancel.clone(),
                terminate_timeout,
                move |cancel| {
                    async move {
                        let report = pump.run(local_read, upstream_write, cancel).await;
                        log_report(id, &tag, &report);
                        totals.record(&report);
                    }
                    .instrument(span)
                },
            )
        };

        let inbound = {
            let pump = Pump::new(tag, Direction::Inbound, dispatcher, options);
            let totals = Arc::clone(&totals);
            Worker::spawn(
                format!("relay:{}:inbound", id),
                cancel.clone(),
                terminate_timeout,
                move |cancel| {
                    async move {
                        let report = pump.run(upstream_read, local_write, cancel).await;
                        log_report(id, &tag, &report);
                        totals.record(&report);
                    }
                    .instrument(span)
                },
            )
        };

        debug!(relay_id = id, port = tag.listen_port, remote = %tag.remote, "Relay started");

        Self {
            id,
            tag,
            cancel,
            totals,
            outbound,
            inbound,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether both pumps have exited.
    pub fn is_finished(&self) -> bool {
        self.outbound.is_finished() && self.inbound.is_finished()
    }

    /// Bytes relayed as `(outbound, inbound)` by pumps that have exited.
    /// A direction still running counts as zero.
    pub fn bytes_relayed(&self) -> (u64, u64) {
        (
            self.totals.outbound.load(Ordering::Acquire),
            self.totals.inbound.load(Ordering::Acquire),
        )
    }

    /// Stop both pumps and wait for them to exit.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.outbound.kill_and_wait().await;
        self.inbound.kill_and_wait().await;
        debug!(
            relay_id = self.id,
            port = self.tag.listen_port,
            remote = %self.tag.remote,
            "Relay stopped"
        );
    }
}

fn log_report(relay_id: u64, tag: &RelayTag, report: &PumpReport) {
    match &report.exit {
        PumpExit::Failed(e) => warn!(
            relay_id,
            port = tag.listen_port,
            remote = %tag.remote,
            direction = report.direction.as_str(),
            bytes = report.bytes,
            error = %e,
            "Relay failed"
        ),
        other => debug!(
            relay_id,
            port = tag.listen_port,
            remote = %tag.remote,
            direction = report.direction.as_str(),
            bytes = report.bytes,
            exit = ?other,
            "Relay finished"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn connected_pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    fn options() -> PumpOptions {
        PumpOptions {
            buffer_size: 4096,
            pause: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_relays_both_directions_and_stops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        // client <-> local (accepted side), upstream <-> remote (far end)
        let (mut client, local) = connected_pair(&listener).await;
        let (upstream, mut remote) = connected_pair(&listener).await;

        let tag = RelayTag {
            listen_port: 7878,
            remote: upstream.peer_addr().unwrap(),
        };
        let root = CancellationToken::new();
        let mut pair = RelayPair::start(
            local,
            upstream,
            tag,
            Arc::new(Dispatcher::new()),
            options(),
            &root,
            Duration::from_secs(1),
        );

        client.write_all(b"Hello World").await.unwrap();
        let mut buf = [0u8; 11];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Hello World");

        remote.write_all(b"From Remote").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"From Remote");

        assert!(!pair.is_finished());
        assert_eq!(pair.bytes_relayed(), (0, 0));
        pair.stop().await;
        assert!(pair.is_finished());
        assert_eq!(pair.bytes_relayed(), (11, 11));

        // Both far ends observe the close.
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
        assert_eq!(remote.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remote_close_tears_down_pair() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut client, local) = connected_pair(&listener).await;
        let (upstream, remote) = connected_pair(&listener).await;

        let tag = RelayTag {
            listen_port: 7878,
            remote: upstream.peer_addr().unwrap(),
        };
        let root = CancellationToken::new();
        let mut pair = RelayPair::start(
            local,
            upstream,
            tag,
            Arc::new(Dispatcher::new()),
            options(),
            &root,
            Duration::from_secs(1),
        );

        drop(remote);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !pair.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pair should finish after the remote closes");

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut rest))
            .await
            .expect("client side should be closed too")
            .ok();
        pair.stop().await;
    }
}
