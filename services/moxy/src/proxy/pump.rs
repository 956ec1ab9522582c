//! One-directional byte relay.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Level};

use crate::events::Dispatcher;

/// Longest preview of a chunk written to debug logs.
const PREVIEW_LEN: usize = 64;

/// Direction of a pump relative to the listening side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local client to remote endpoint.
    Outbound,
    /// Remote endpoint to local client.
    Inbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }
}

/// Identifies the connection a pump belongs to in events and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTag {
    /// Port the client connected to.
    pub listen_port: u16,
    /// Address of the remote endpoint.
    pub remote: SocketAddr,
}

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    /// The source reached end of stream.
    EndOfStream,
    /// One endpoint reset or dropped the connection.
    Disconnected,
    /// The pump's token was cancelled.
    Cancelled,
    /// Any other I/O failure.
    Failed(io::Error),
}

/// Summary of a finished pump.
#[derive(Debug)]
pub struct PumpReport {
    pub direction: Direction,
    pub bytes: u64,
    pub exit: PumpExit,
}

/// Byte pump settings.
#[derive(Debug, Clone, Copy)]
pub struct PumpOptions {
    pub buffer_size: usize,
    pub pause: Duration,
}

/// Copies bytes from one endpoint to another until end of stream,
/// disconnection, failure or cancellation.
pub struct Pump {
    tag: RelayTag,
    direction: Direction,
    dispatcher: Arc<Dispatcher>,
    options: PumpOptions,
}

impl Pump {
    pub fn new(
        tag: RelayTag,
        direction: Direction,
        dispatcher: Arc<Dispatcher>,
        options: PumpOptions,
    ) -> Self {
        Self {
            tag,
            direction,
            dispatcher,
            options,
        }
    }

    /// Relay `source` into `destination`.
    ///
    /// Reads, writes and the optional pause all race against `cancel`. On
    /// exit the token is cancelled so that the opposite pump of the same
    /// connection unblocks, and both endpoints are dropped. The returned
    /// report is logged by the owner.
    pub async fn run<R, W>(
        self,
        mut source: R,
        mut destination: W,
        cancel: CancellationToken,
    ) -> PumpReport
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.options.buffer_size.max(1)];
        let mut bytes = 0u64;

        let exit = loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break PumpExit::Cancelled,
                read = source.read(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => break PumpExit::EndOfStream,
                Ok(n) => n,
                Err(e) => break classify(e),
            };

            let chunk = &buf[..n];
            let written = tokio::select! {
                biased;
                _ = cancel.cancelled() => break PumpExit::Cancelled,
                written = write_chunk(&mut destination, chunk) => written,
            };
            if let Err(e) = written {
                break classify(e);
            }

            bytes += n as u64;
            self.log_chunk(chunk);
            self.notify(chunk);

            if !self.options.pause.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break PumpExit::Cancelled,
                    _ = tokio::time::sleep(self.options.pause) => {}
                }
            }
        };

        // Unblock the sibling pump; the endpoints close when dropped below.
        cancel.cancel();
        drop(source);
        drop(destination);

        PumpReport {
            direction: self.direction,
            bytes,
            exit,
        }
    }

    fn notify(&self, chunk: &[u8]) {
        match self.direction {
            Direction::Outbound => {
                self.dispatcher
                    .sent_data(self.tag.listen_port, self.tag.remote, chunk)
            }
            Direction::Inbound => {
                self.dispatcher
                    .received_data(self.tag.listen_port, self.tag.remote, chunk)
            }
        }
    }

    fn log_chunk(&self, chunk: &[u8]) {
        if !tracing::enabled!(Level::DEBUG) {
            return;
        }
        debug!(
            port = self.tag.listen_port,
            remote = %self.tag.remote,
            direction = self.direction.as_str(),
            bytes = chunk.len(),
            preview = %preview(chunk),
            "Relayed chunk"
        );
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(destination: &mut W, chunk: &[u8]) -> io::Result<()> {
    destination.write_all(chunk).await?;
    destination.flush().await
}

/// Map an I/O error to a pump exit; peer-side disconnects are not failures.
fn classify(e: io::Error) -> PumpExit {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => PumpExit::Disconnected,
        _ => PumpExit::Failed(e),
    }
}

/// Printable rendering of the start of a chunk.
fn preview(chunk: &[u8]) -> String {
    let shown = &chunk[..chunk.len().min(PREVIEW_LEN)];
    let mut out: String = shown
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect();
    if chunk.len() > PREVIEW_LEN {
        out.push_str("...");
    }
    out
}
