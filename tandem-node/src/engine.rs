//! Connection lifecycle controller: listener, accept workers, connect, disconnect, send.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tandem_core::{
    wire, AcceptContext, ArenaError, BufferArena, ConnectContext, ConnectionRegistry,
    ContextPool, EncodeError, Endpoint, Lease, OperationKind, ReceiveContext, RegistryError,
    SendContext,
};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::collaborator::Collaborator;
use crate::config::NodeConfig;
use crate::connection::{self, Closure, ConnectionHandle, Outbound};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);
/// How long a disconnect waits for queued sends and the write-side shutdown.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Error returned synchronously by engine calls.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Usage error (`NotConnected`) or lookup error (`UnknownEndpoint`).
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("connect to {endpoint} failed: {source}")]
    ConnectFailed {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("connection to {0} is closing")]
    Closed(Endpoint),
    #[error("{0} is not a regular file")]
    NotAFile(PathBuf),
    #[error("engine is shutting down")]
    ShuttingDown,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Result of a successful `connect` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// The endpoint was already connected or connecting; nothing was attempted.
    AlreadyConnected,
}

/// Point-in-time pool and registry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub connections: usize,
    pub idle_send_contexts: usize,
    pub idle_receive_contexts: usize,
    pub arena_regions: usize,
    pub arena_regions_assigned: usize,
}

/// State shared by the engine handle and every connection task.
pub(crate) struct Shared {
    pub(crate) config: NodeConfig,
    pub(crate) collaborator: Arc<dyn Collaborator>,
    pub(crate) registry: ConnectionRegistry<ConnectionHandle>,
    arena: BufferArena,
    accept_pool: Arc<ContextPool<AcceptContext>>,
    connect_pool: Arc<ContextPool<ConnectContext>>,
    send_pool: Arc<ContextPool<SendContext>>,
    receive_pool: Arc<ContextPool<ReceiveContext>>,
    acceptors: Mutex<Vec<AbortHandle>>,
    closing: AtomicBool,
}

impl Shared {
    pub(crate) fn lease_send(&self) -> Lease<SendContext> {
        self.send_pool
            .lease(|| SendContext::new(self.arena.assign_or_detached()))
    }

    pub(crate) fn lease_receive(&self) -> Lease<ReceiveContext> {
        self.receive_pool.lease(|| {
            ReceiveContext::new(
                self.arena.assign_or_detached(),
                self.config.download_dir.clone(),
            )
        })
    }

    /// Name, capacity and idle count of each context pool.
    fn pool_levels(&self) -> [(&'static str, usize, usize); 4] {
        [
            (self.accept_pool.name(), self.accept_pool.capacity(), self.accept_pool.idle()),
            (self.connect_pool.name(), self.connect_pool.capacity(), self.connect_pool.idle()),
            (self.send_pool.name(), self.send_pool.capacity(), self.send_pool.idle()),
            (self.receive_pool.name(), self.receive_pool.capacity(), self.receive_pool.idle()),
        ]
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Tear down a connection that ended on its own. Whoever removes the registry
    /// entry reports; a connection already removed by `disconnect` is left alone.
    pub(crate) fn teardown(&self, endpoint: Endpoint, closure: Closure) {
        let Some(handle) = self.registry.remove(endpoint) else {
            debug!(%endpoint, reason = %closure, "connection ended after removal");
            return;
        };
        handle.abort();
        match &closure {
            Closure::PeerClosed => info!(%endpoint, "peer closed connection"),
            other => warn!(%endpoint, reason = %other, "connection torn down"),
        }
        self.collaborator.notify(&closure.describe(endpoint));
        self.collaborator.on_disconnected(endpoint);
    }

    /// Register an accepted stream and start receiving on it.
    fn admit(self: &Arc<Self>, endpoint: Endpoint, stream: TcpStream) {
        if self.is_closing() {
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            warn!(%endpoint, error = %e, "discarding accepted socket");
            return;
        }
        let pending = connection::open(self, endpoint, stream);
        if let Err(e) = self.registry.insert(endpoint, pending.handle()) {
            warn!(%endpoint, error = %e, "rejecting accepted socket");
            return;
        }
        pending.start();
        info!(%endpoint, "accepted connection");
        self.collaborator.notify(&format!("{endpoint} connected."));
    }

    /// Turn the reservation for `endpoint` into a live connection over `stream`.
    /// A shutdown that began meanwhile wins: the new entry is withdrawn.
    fn register_outbound(
        self: &Arc<Self>,
        endpoint: Endpoint,
        stream: TcpStream,
    ) -> Result<(), EngineError> {
        let pending = connection::open(self, endpoint, stream);
        self.registry.establish(endpoint, pending.handle())?;
        // Shutdown sets the flag before draining, so one of the two sees this entry.
        if self.is_closing() {
            if let Some(handle) = self.registry.remove(endpoint) {
                handle.abort();
            }
            return Err(EngineError::ShuttingDown);
        }
        pending.start();
        Ok(())
    }

    /// Shut down the write side after queued sends drain, then stop both tasks.
    async fn close_gracefully(&self, endpoint: Endpoint, handle: ConnectionHandle) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let graceful = handle.send(Outbound::Shutdown(ack_tx))
            && matches!(
                tokio::time::timeout(DISCONNECT_GRACE, ack_rx).await,
                Ok(Ok(Ok(())))
            );
        handle.abort();
        debug!(%endpoint, graceful, "connection closed");
    }
}

/// Releases an outbound reservation unless it became a live connection.
struct Reservation<'a> {
    registry: &'a ConnectionRegistry<ConnectionHandle>,
    endpoint: Endpoint,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.registry.release(self.endpoint);
    }
}

/// Handle to a running engine. Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
}

impl Engine {
    /// Preallocate arena and pools, bind the listener and start accepting.
    pub async fn start(
        config: NodeConfig,
        collaborator: Arc<dyn Collaborator>,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Config)?;
        let regions = config
            .max_sends
            .checked_add(config.max_receives)
            .ok_or_else(|| EngineError::Config("pool sizes overflow".into()))?;
        let arena = BufferArena::for_contexts(regions, config.buffer_size)?;

        let sends: Vec<SendContext> = (0..config.max_sends)
            .filter_map(|_| arena.assign())
            .map(SendContext::new)
            .collect();
        let receives: Vec<ReceiveContext> = (0..config.max_receives)
            .filter_map(|_| arena.assign())
            .map(|r| ReceiveContext::new(r, config.download_dir.clone()))
            .collect();
        let accepts: Vec<AcceptContext> = (0..config.max_accepts)
            .map(|_| AcceptContext::default())
            .collect();
        let connects: Vec<ConnectContext> = (0..config.max_connects)
            .map(|_| ConnectContext::default())
            .collect();

        let listener = bind_listener(config.listen_socket_addr(), config.backlog)?;
        let local_addr = listener.local_addr()?;
        let max_accepts = config.max_accepts;

        let shared = Arc::new(Shared {
            config,
            collaborator,
            registry: ConnectionRegistry::new(),
            arena,
            accept_pool: Arc::new(ContextPool::with_contexts(OperationKind::Accept.as_str(), accepts)),
            connect_pool: Arc::new(ContextPool::with_contexts(OperationKind::Connect.as_str(), connects)),
            send_pool: Arc::new(ContextPool::with_contexts(OperationKind::Send.as_str(), sends)),
            receive_pool: Arc::new(ContextPool::with_contexts(OperationKind::Receive.as_str(), receives)),
            acceptors: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
        });

        let listener = Arc::new(listener);
        let acceptors: Vec<AbortHandle> = (0..max_accepts)
            .map(|_| tokio::spawn(accept_loop(shared.clone(), listener.clone())).abort_handle())
            .collect();
        *shared.acceptors.lock() = acceptors;
        for (name, capacity, idle) in shared.pool_levels() {
            debug!(pool = name, capacity, idle, "context pool ready");
        }

        info!(%local_addr, accepts = max_accepts, "listening");
        Ok(Engine { shared, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open an outbound connection. A second call for an endpoint that is connected
    /// or still connecting does nothing and reports `AlreadyConnected`.
    pub async fn connect(&self, endpoint: Endpoint) -> Result<ConnectOutcome, EngineError> {
        let shared = &self.shared;
        if shared.is_closing() {
            return Err(EngineError::ShuttingDown);
        }
        if shared.registry.reserve(endpoint).is_err() {
            shared
                .collaborator
                .notify(&format!("Already connected to {endpoint}."));
            return Ok(ConnectOutcome::AlreadyConnected);
        }
        let _reservation = Reservation {
            registry: &shared.registry,
            endpoint,
        };

        let mut ctx = shared.connect_pool.lease(ConnectContext::default);
        ctx.target = Some(endpoint);
        let stream = match open_stream(endpoint).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%endpoint, error = %e, "connect failed");
                shared
                    .collaborator
                    .notify(&format!("Failed to connect to {endpoint}: {e}"));
                return Err(EngineError::ConnectFailed {
                    endpoint,
                    source: e,
                });
            }
        };
        drop(ctx);

        shared.register_outbound(endpoint, stream)?;

        info!(%endpoint, "connected");
        shared
            .collaborator
            .notify(&format!("Connected to {endpoint}."));
        shared.collaborator.on_connected(endpoint);
        Ok(ConnectOutcome::Connected)
    }

    /// Gracefully close a live connection.
    pub async fn disconnect(&self, endpoint: Endpoint) -> Result<(), EngineError> {
        let handle = self
            .shared
            .registry
            .remove(endpoint)
            .ok_or(RegistryError::UnknownEndpoint(endpoint))?;
        self.shared.close_gracefully(endpoint, handle).await;
        self.shared
            .collaborator
            .notify(&format!("Disconnected from {endpoint}."));
        self.shared.collaborator.on_disconnected(endpoint);
        Ok(())
    }

    /// Queue a text message. Fails immediately if `endpoint` is not connected.
    pub fn send_text(&self, endpoint: Endpoint, text: impl Into<String>) -> Result<(), EngineError> {
        let handle = self.shared.registry.get(endpoint)?;
        let text = text.into();
        if wire::text_len_field(text.len()).is_none() {
            return Err(EncodeError::TextTooLong(text.len()).into());
        }
        if !handle.send(Outbound::Text(text)) {
            return Err(EngineError::Closed(endpoint));
        }
        Ok(())
    }

    /// Queue a file for streaming. Fails immediately if `endpoint` is not connected
    /// or `path` is not a readable regular file.
    pub fn send_file(&self, endpoint: Endpoint, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let handle = self.shared.registry.get(endpoint)?;
        let path = path.as_ref();
        if !std::fs::metadata(path)?.is_file() {
            return Err(EngineError::NotAFile(path.to_path_buf()));
        }
        if !handle.send(Outbound::File(path.to_path_buf())) {
            return Err(EngineError::Closed(endpoint));
        }
        Ok(())
    }

    pub fn is_connected(&self, endpoint: Endpoint) -> bool {
        self.shared.registry.is_connected(endpoint)
    }

    /// Live connections.
    pub fn connections(&self) -> Vec<Endpoint> {
        self.shared.registry.endpoints()
    }

    pub fn stats(&self) -> EngineStats {
        let s = &self.shared;
        EngineStats {
            connections: s.registry.endpoints().len(),
            idle_send_contexts: s.send_pool.idle(),
            idle_receive_contexts: s.receive_pool.idle(),
            arena_regions: s.arena.capacity(),
            arena_regions_assigned: s.arena.assigned(),
        }
    }

    /// Stop accepting and close every connection.
    pub async fn shutdown(&self) {
        self.shared.closing.store(true, Ordering::Release);
        let acceptors = std::mem::take(&mut *self.shared.acceptors.lock());
        for acceptor in acceptors {
            acceptor.abort();
        }
        for (endpoint, handle) in self.shared.registry.drain() {
            self.shared.close_gracefully(endpoint, handle).await;
            self.shared.collaborator.on_disconnected(endpoint);
        }
        info!(addr = %self.local_addr, "engine stopped");
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

async fn open_stream(endpoint: Endpoint) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(endpoint.addr()).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// One of `max_accepts` workers sharing the listener. A completed accept is handed to
/// its own task so the next accept is posted before the current one is processed.
async fn accept_loop(shared: Arc<Shared>, listener: Arc<TcpListener>) {
    loop {
        let mut ctx = shared.accept_pool.lease(AcceptContext::default);
        match listener.accept().await {
            Ok((stream, addr)) => {
                let endpoint = Endpoint::from(addr);
                ctx.peer = Some(endpoint);
                drop(ctx);
                let shared = shared.clone();
                tokio::spawn(async move { shared.admit(endpoint, stream) });
            }
            Err(e) => {
                drop(ctx);
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{wire::encode_file_header, wire::encode_text_frame, Delivery, PREFIX_SIZE};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Notify(String),
        Connected(Endpoint),
        Disconnected(Endpoint),
        Progress(Endpoint, String, f64),
        Received(Endpoint, Delivery),
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Event>,
    }

    impl Collaborator for Recorder {
        fn notify(&self, message: &str) {
            let _ = self.tx.send(Event::Notify(message.to_string()));
        }
        fn on_connected(&self, endpoint: Endpoint) {
            let _ = self.tx.send(Event::Connected(endpoint));
        }
        fn on_disconnected(&self, endpoint: Endpoint) {
            let _ = self.tx.send(Event::Disconnected(endpoint));
        }
        fn on_progress(&self, endpoint: Endpoint, label: &str, fraction: f64) {
            let _ = self
                .tx
                .send(Event::Progress(endpoint, label.to_string(), fraction));
        }
        fn on_received(&self, endpoint: Endpoint, delivery: &Delivery) {
            let _ = self.tx.send(Event::Received(endpoint, delivery.clone()));
        }
    }

    struct Node {
        engine: Engine,
        events: mpsc::UnboundedReceiver<Event>,
        dir: tempfile::TempDir,
    }

    impl Node {
        fn endpoint(&self) -> Endpoint {
            Endpoint::from(self.engine.local_addr())
        }

        fn download_dir(&self) -> &Path {
            self.dir.path()
        }

        /// Wait for the first event matching `pred`, returning it with everything skipped.
        async fn wait_for(&mut self, pred: impl Fn(&Event) -> bool) -> (Event, Vec<Event>) {
            let mut skipped = Vec::new();
            let found = tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    let ev = self.events.recv().await.expect("engine dropped collaborator");
                    if pred(&ev) {
                        return ev;
                    }
                    skipped.push(ev);
                }
            })
            .await
            .expect("timed out waiting for event");
            (found, skipped)
        }
    }

    fn test_config(dir: &Path) -> NodeConfig {
        NodeConfig {
            listen_addr: "127.0.0.1".parse().unwrap(),
            port: 0,
            buffer_size: 1024,
            max_accepts: 2,
            max_connects: 2,
            max_sends: 2,
            max_receives: 2,
            download_dir: dir.to_path_buf(),
            ..NodeConfig::default()
        }
    }

    async fn node_with(edit: impl FnOnce(&mut NodeConfig)) -> Node {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        edit(&mut config);
        let (tx, events) = mpsc::unbounded_channel();
        let engine = Engine::start(config, Arc::new(Recorder { tx })).await.unwrap();
        Node {
            engine,
            events,
            dir,
        }
    }

    async fn node() -> Node {
        node_with(|_| {}).await
    }

    /// Connect `a` to `b` and wait until `b` has registered the inbound side.
    async fn link(a: &mut Node, b: &mut Node) -> Endpoint {
        let target = b.endpoint();
        assert_eq!(
            a.engine.connect(target).await.unwrap(),
            ConnectOutcome::Connected
        );
        a.wait_for(|e| *e == Event::Connected(target)).await;
        b.wait_for(|e| matches!(e, Event::Notify(m) if m.ends_with(" connected.")))
            .await;
        target
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn text_in_single_delivery() {
        let mut a = node().await;
        let mut b = node().await;
        let target = link(&mut a, &mut b).await;

        a.engine.send_text(target, "hello").unwrap();
        let (ev, _) = b.wait_for(|e| matches!(e, Event::Received(..))).await;
        assert!(matches!(ev, Event::Received(_, Delivery::Text(t)) if t == "hello"));
        a.wait_for(|e| matches!(e, Event::Notify(m) if m.starts_with("Sent text")))
            .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn text_in_one_byte_deliveries() {
        let mut b = node().await;
        let mut client = TcpStream::connect(b.engine.local_addr()).await.unwrap();
        client.set_nodelay(true).unwrap();
        let frame = encode_text_frame("hello").unwrap();
        assert_eq!(frame.len(), PREFIX_SIZE + 5);
        for byte in &frame {
            client.write_all(std::slice::from_ref(byte)).await.unwrap();
            client.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let (ev, _) = b.wait_for(|e| matches!(e, Event::Received(..))).await;
        assert!(matches!(ev, Event::Received(_, Delivery::Text(t)) if t == "hello"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn file_of_three_buffers() {
        let mut a = node().await;
        let mut b = node().await;
        let target = link(&mut a, &mut b).await;

        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("a.bin");
        std::fs::write(&src, vec![0xABu8; 3 * 1024]).unwrap();
        a.engine.send_file(target, &src).unwrap();

        let (ev, _) = b.wait_for(|e| matches!(e, Event::Received(..))).await;
        let Event::Received(_, Delivery::File { name, path, len }) = ev else {
            panic!("expected a file, got {ev:?}");
        };
        assert_eq!(name, "a.bin");
        assert_eq!(len, 3 * 1024);
        assert_eq!(path, b.download_dir().join("a.bin"));
        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 3 * 1024);
        assert!(content.iter().all(|&x| x == 0xAB));

        let (_, before) = a
            .wait_for(|e| matches!(e, Event::Notify(m) if m.starts_with("Sent file a.bin")))
            .await;
        let fractions: Vec<f64> = before
            .iter()
            .filter_map(|e| match e {
                Event::Progress(ep, label, f) if *ep == target && label == "a.bin" => Some(*f),
                _ => None,
            })
            .collect();
        assert!(fractions.len() >= 3);
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(fractions.last().copied(), Some(1.0));
    }

    #[tokio::test]
    async fn send_to_unknown_endpoint_is_usage_error() {
        let a = node().await;
        let nobody: Endpoint = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(
            a.engine.send_text(nobody, "hi"),
            Err(EngineError::Registry(RegistryError::NotConnected(ep))) if ep == nobody
        ));
        assert!(matches!(
            a.engine.send_file(nobody, "/dev/null"),
            Err(EngineError::Registry(RegistryError::NotConnected(_)))
        ));
        assert_eq!(a.engine.stats().idle_send_contexts, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn back_to_back_connects_register_once() {
        let mut a = node().await;
        let b = node().await;
        let target = b.endpoint();
        let (first, second) = tokio::join!(a.engine.connect(target), a.engine.connect(target));
        let mut outcomes = vec![first.unwrap(), second.unwrap()];
        outcomes.sort_by_key(|o| *o == ConnectOutcome::AlreadyConnected);
        assert_eq!(
            outcomes,
            vec![ConnectOutcome::Connected, ConnectOutcome::AlreadyConnected]
        );
        assert_eq!(a.engine.connections(), vec![target]);
        a.wait_for(|e| matches!(e, Event::Notify(m) if m.starts_with("Already connected")))
            .await;

        assert_eq!(
            a.engine.connect(target).await.unwrap(),
            ConnectOutcome::AlreadyConnected
        );
        assert_eq!(a.engine.connections().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_unknown_endpoint_is_lookup_error() {
        let a = node().await;
        let nobody: Endpoint = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(
            a.engine.disconnect(nobody).await,
            Err(EngineError::Registry(RegistryError::UnknownEndpoint(_)))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_closes_both_sides() {
        let mut a = node().await;
        let mut b = node().await;
        let target = link(&mut a, &mut b).await;

        a.engine.disconnect(target).await.unwrap();
        a.wait_for(|e| *e == Event::Disconnected(target)).await;
        assert!(!a.engine.is_connected(target));
        assert!(matches!(
            a.engine.send_text(target, "late"),
            Err(EngineError::Registry(RegistryError::NotConnected(_)))
        ));

        b.wait_for(|e| matches!(e, Event::Disconnected(_))).await;
        assert!(b.engine.connections().is_empty());
        assert_eq!(b.engine.stats().idle_receive_contexts, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_connect_leaves_no_entry() {
        let mut a = node().await;
        let closed = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let target = Endpoint::from(closed);
        assert!(matches!(
            a.engine.connect(target).await,
            Err(EngineError::ConnectFailed { .. })
        ));
        assert!(a.engine.connections().is_empty());
        a.wait_for(|e| matches!(e, Event::Notify(m) if m.starts_with("Failed to connect")))
            .await;
        // The reservation is gone, so a retry is a fresh attempt.
        assert!(matches!(
            a.engine.connect(target).await,
            Err(EngineError::ConnectFailed { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interrupted_file_keeps_partial_content() {
        let mut b = node().await;
        let mut client = TcpStream::connect(b.engine.local_addr()).await.unwrap();
        let mut bytes = encode_file_header("part.bin", 1000).unwrap();
        bytes.extend_from_slice(&[7u8; 300]);
        client.write_all(&bytes).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(client);

        let (_, before) = b.wait_for(|e| matches!(e, Event::Disconnected(_))).await;
        assert!(before
            .iter()
            .any(|e| matches!(e, Event::Notify(m) if m.contains("interrupted"))));
        let kept = std::fs::read(b.download_dir().join("part.bin")).unwrap();
        assert_eq!(kept, vec![7u8; 300]);
        assert_eq!(b.engine.stats().idle_receive_contexts, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_prefix_drops_connection_only() {
        let mut b = node().await;
        let mut bad = TcpStream::connect(b.engine.local_addr()).await.unwrap();
        let mut frame = encode_text_frame("x").unwrap();
        frame[0] = 42;
        bad.write_all(&frame).await.unwrap();
        let (ev, _) = b.wait_for(|e| matches!(e, Event::Notify(m) if m.starts_with("Dropped"))).await;
        assert!(matches!(ev, Event::Notify(m) if m.contains("unknown message kind 42")));

        let mut good = TcpStream::connect(b.engine.local_addr()).await.unwrap();
        good.write_all(&encode_text_frame("still listening").unwrap())
            .await
            .unwrap();
        let (ev, _) = b.wait_for(|e| matches!(e, Event::Received(..))).await;
        assert!(matches!(ev, Event::Received(_, Delivery::Text(t)) if t == "still listening"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_connection_times_out() {
        let mut a = node().await;
        let mut b = node_with(|c| c.idle_timeout_secs = Some(1)).await;
        let target = link(&mut a, &mut b).await;
        let (ev, _) = b.wait_for(|e| matches!(e, Event::Disconnected(_))).await;
        assert!(matches!(ev, Event::Disconnected(_)));
        a.wait_for(|e| *e == Event::Disconnected(target)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_sends_arrive_in_order() {
        let mut a = node().await;
        let mut b = node().await;
        let target = link(&mut a, &mut b).await;
        for i in 0..10 {
            a.engine.send_text(target, format!("m{i}")).unwrap();
        }
        let mut got = Vec::new();
        while got.len() < 10 {
            let (ev, _) = b.wait_for(|e| matches!(e, Event::Received(..))).await;
            if let Event::Received(_, Delivery::Text(t)) = ev {
                got.push(t);
            }
        }
        let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        assert_eq!(got, expected);
        let stats = a.engine.stats();
        assert_eq!(stats.arena_regions, 4);
        assert_eq!(stats.arena_regions_assigned, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_disconnects_everyone() {
        let mut a = node().await;
        let mut b = node().await;
        let target = link(&mut a, &mut b).await;
        a.engine.shutdown().await;
        a.wait_for(|e| *e == Event::Disconnected(target)).await;
        assert!(a.engine.connections().is_empty());
        assert!(matches!(
            a.engine.connect(target).await,
            Err(EngineError::ShuttingDown)
        ));
        b.wait_for(|e| matches!(e, Event::Disconnected(_))).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn receive_burst_keeps_arena_contexts_pooled() {
        let mut b = node_with(|c| c.max_receives = 1).await;
        let regions = b.engine.stats().arena_regions;
        assert_eq!(b.engine.stats().arena_regions_assigned, regions);

        let mut first = TcpStream::connect(b.engine.local_addr()).await.unwrap();
        let mut second = TcpStream::connect(b.engine.local_addr()).await.unwrap();
        first.write_all(&encode_text_frame("one").unwrap()).await.unwrap();
        second.write_all(&encode_text_frame("two").unwrap()).await.unwrap();
        for _ in 0..2 {
            b.wait_for(|e| matches!(e, Event::Received(..))).await;
        }
        assert_eq!(b.engine.stats().idle_receive_contexts, 0);
        assert_eq!(b.engine.shared.receive_pool.outstanding(), 1);

        // Whichever reader holds the burst context, returning it must not evict
        // the arena-backed one.
        drop(second);
        b.wait_for(|e| matches!(e, Event::Disconnected(_))).await;
        drop(first);
        b.wait_for(|e| matches!(e, Event::Disconnected(_))).await;

        let stats = b.engine.stats();
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.idle_receive_contexts, 1);
        assert_eq!(stats.arena_regions_assigned, regions);
        assert_eq!(b.engine.shared.receive_pool.outstanding(), 0);
        let pooled = b.engine.shared.receive_pool.pop().unwrap();
        assert!(!pooled.region.is_detached());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_mid_file_reports_partial_content() {
        let mut b = node().await;
        let mut client = TcpStream::connect(b.engine.local_addr()).await.unwrap();
        let client_ep = Endpoint::from(client.local_addr().unwrap());
        b.wait_for(|e| matches!(e, Event::Notify(m) if m.ends_with(" connected.")))
            .await;

        let mut bytes = encode_file_header("cut.bin", 1000).unwrap();
        bytes.extend_from_slice(&[3u8; 200]);
        client.write_all(&bytes).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        b.engine.disconnect(client_ep).await.unwrap();
        let (ev, _) = b
            .wait_for(|e| matches!(e, Event::Notify(m) if m.contains("interrupted")))
            .await;
        assert!(matches!(ev, Event::Notify(m) if m.contains("kept 200 bytes")));
        let kept = std::fs::read(b.download_dir().join("cut.bin")).unwrap();
        assert_eq!(kept, vec![3u8; 200]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn outbound_registration_loses_to_shutdown() {
        let a = node().await;
        let b = node().await;
        let target = b.endpoint();
        let stream = TcpStream::connect(target.addr()).await.unwrap();

        a.engine.shared.registry.reserve(target).unwrap();
        a.engine.shared.closing.store(true, Ordering::Release);
        assert!(matches!(
            a.engine.shared.register_outbound(target, stream),
            Err(EngineError::ShuttingDown)
        ));
        assert!(!a.engine.is_connected(target));
        assert!(!a.engine.shared.registry.contains(target));
    }
}
