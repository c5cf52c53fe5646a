//! Per-connection tasks: the receive loop and the send loop.
//!
//! Each established connection runs one reader task and one writer task over the two
//! halves of its stream. The reader posts one read at a time on its receive context
//! and feeds every completion to the decoder. The writer takes outbound jobs in order
//! and runs each to completion, one chunk at a time, before starting the next.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tandem_core::{DecodeError, EncodeError, Endpoint, Lease, ReceiveContext, SendContext};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::engine::Shared;

/// Work queued for a connection's writer.
pub(crate) enum Outbound {
    Text(String),
    File(PathBuf),
    /// Flush queued work, half-close the write side, then report.
    Shutdown(oneshot::Sender<io::Result<()>>),
}

/// Registry entry for a live connection.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl ConnectionHandle {
    /// Queue work for the writer. False if the writer has already exited.
    pub(crate) fn send(&self, job: Outbound) -> bool {
        self.outbound.send(job).is_ok()
    }

    /// Stop both tasks. Their contexts go back to the pools as the tasks unwind.
    pub(crate) fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Why a connection ended on its own.
#[derive(Debug)]
pub(crate) enum Closure {
    PeerClosed,
    IdleTimeout,
    Socket(io::Error),
    Decode(DecodeError),
    Encode(EncodeError),
}

impl Closure {
    pub(crate) fn describe(&self, endpoint: Endpoint) -> String {
        match self {
            Closure::PeerClosed => format!("{endpoint} closed the connection."),
            Closure::IdleTimeout => format!("{endpoint} timed out while idle."),
            Closure::Socket(e) => format!("Connection to {endpoint} failed: {e}"),
            Closure::Decode(e) => format!("Dropped {endpoint}: {e}"),
            Closure::Encode(e) => format!("Send to {endpoint} aborted: {e}"),
        }
    }
}

impl fmt::Display for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Closure::PeerClosed => f.write_str("peer closed"),
            Closure::IdleTimeout => f.write_str("idle timeout"),
            Closure::Socket(e) => write!(f, "socket error: {e}"),
            Closure::Decode(e) => write!(f, "decode error: {e}"),
            Closure::Encode(e) => write!(f, "encode error: {e}"),
        }
    }
}

/// Tasks spawned but not yet reading. Dropping it abandons the connection.
pub(crate) struct Pending {
    handle: ConnectionHandle,
    go: oneshot::Sender<()>,
}

impl Pending {
    pub(crate) fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Start the receive loop. Call once the handle is registered.
    pub(crate) fn start(self) {
        let _ = self.go.send(());
    }
}

/// Split `stream` and spawn its reader and writer. The reader waits for
/// [`Pending::start`] so it cannot tear down an entry that is not registered yet.
pub(crate) fn open(shared: &Arc<Shared>, endpoint: Endpoint, stream: TcpStream) -> Pending {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let (go_tx, go_rx) = oneshot::channel();
    let reader = tokio::spawn(receive_loop(shared.clone(), endpoint, read_half, go_rx));
    let writer = tokio::spawn(send_loop(shared.clone(), endpoint, write_half, rx));
    Pending {
        handle: ConnectionHandle {
            outbound: tx,
            reader: reader.abort_handle(),
            writer: writer.abort_handle(),
        },
        go: go_tx,
    }
}

/// The reader's receive context. Reports a half-received file however the reader
/// ends, including when its task is aborted by the writer or by `disconnect`.
struct Inbound {
    ctx: Lease<ReceiveContext>,
    shared: Arc<Shared>,
    endpoint: Endpoint,
}

impl Drop for Inbound {
    fn drop(&mut self) {
        if let Some((path, written)) = self.ctx.token.partial_file() {
            self.shared.collaborator.notify(&format!(
                "Transfer from {} interrupted; kept {written} bytes in {}.",
                self.endpoint,
                path.display()
            ));
        }
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    endpoint: Endpoint,
    mut reader: OwnedReadHalf,
    go: oneshot::Receiver<()>,
) {
    if go.await.is_err() {
        return;
    }
    let mut inbound = Inbound {
        ctx: shared.lease_receive(),
        shared: shared.clone(),
        endpoint,
    };
    let closure = receive(&shared, endpoint, &mut reader, &mut inbound.ctx).await;
    drop(inbound);
    shared.teardown(endpoint, closure);
}

async fn receive(
    shared: &Shared,
    endpoint: Endpoint,
    reader: &mut OwnedReadHalf,
    ctx: &mut ReceiveContext,
) -> Closure {
    let idle = shared.config.idle_timeout();
    let collaborator = &shared.collaborator;
    let ReceiveContext { region, token } = ctx;
    loop {
        let read = reader.read(&mut region[..]);
        let result = match idle {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(r) => r,
                Err(_) => return Closure::IdleTimeout,
            },
            None => read.await,
        };
        let n = match result {
            Ok(0) => return Closure::PeerClosed,
            Ok(n) => n,
            Err(e) => return Closure::Socket(e),
        };
        tracing::trace!(%endpoint, n, "received");
        if let Err(e) = token.feed(&region[..n], |d| collaborator.on_received(endpoint, &d)) {
            return Closure::Decode(e);
        }
    }
}

async fn send_loop(
    shared: Arc<Shared>,
    endpoint: Endpoint,
    mut writer: OwnedWriteHalf,
    mut jobs: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(job) = jobs.recv().await {
        let (mut ctx, loaded) = match job {
            Outbound::Shutdown(ack) => {
                let _ = ack.send(writer.shutdown().await);
                return;
            }
            Outbound::Text(text) => {
                let mut ctx = shared.lease_send();
                let loaded = ctx.token.load_text(&text);
                (ctx, loaded)
            }
            Outbound::File(path) => {
                let mut ctx = shared.lease_send();
                let loaded = ctx.token.load_file(&path);
                (ctx, loaded)
            }
        };
        if let Err(e) = loaded {
            tracing::warn!(%endpoint, error = %e, "cannot encode outbound message");
            shared
                .collaborator
                .notify(&format!("Cannot send to {endpoint}: {e}"));
            continue;
        }
        let what = if ctx.token.is_file() {
            format!("file {}", ctx.token.label())
        } else {
            "text".to_string()
        };
        match transmit(&shared, endpoint, &mut writer, &mut ctx).await {
            Ok(()) => {
                let sent = ctx.token.bytes_sent();
                drop(ctx);
                tracing::debug!(%endpoint, bytes = sent, "send complete");
                shared
                    .collaborator
                    .notify(&format!("Sent {what} to {endpoint}."));
            }
            Err(closure) => {
                drop(ctx);
                shared.teardown(endpoint, closure);
                return;
            }
        }
    }
}

/// Chunked send of the message loaded in `ctx`. Chunk N+1 is filled only after chunk N
/// has been written.
async fn transmit(
    shared: &Shared,
    endpoint: Endpoint,
    writer: &mut OwnedWriteHalf,
    ctx: &mut SendContext,
) -> Result<(), Closure> {
    let SendContext { region, token } = ctx;
    while !token.is_complete() {
        let n = token.fill(region).map_err(Closure::Encode)?;
        writer
            .write_all(&region[..n])
            .await
            .map_err(Closure::Socket)?;
        token.complete_chunk(n).map_err(Closure::Encode)?;
        if token.is_file() {
            shared
                .collaborator
                .on_progress(endpoint, token.label(), token.fraction());
        }
    }
    Ok(())
}
