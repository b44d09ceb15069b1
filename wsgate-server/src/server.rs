//! WebSocket server: accept loop, reader tasks, worker pool wiring.

use crate::error::ServerError;
use crate::registry::{self, IoCmd};
use crate::service::Service;
use crate::stream::MaybeTlsStream;
use crate::worker::{encode_message, ConnEvent, WorkItem, Worker};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_rustls::TlsAcceptor;
use wsgate_protocol::{CloseCode, Frame, Message, DEFAULT_FRAGMENT_SIZE};

const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_BACKLOG: u32 = 128;
const DEFAULT_READ_BUFFER: usize = 8192;
const DEFAULT_WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Number of worker tasks (0 = default of 4).
    pub pool_size: usize,
    /// Capacity of the work and reply queues (0 = default of 1024).
    pub queue_capacity: usize,
    /// Listen backlog (0 = default of 128).
    pub backlog: u32,
    /// Read buffer size in bytes (0 = default of 8192).
    pub read_buffer_size: usize,
    /// Payloads above this size are split into continuation frames
    /// (0 = default of 1 MiB).
    pub fragment_size: usize,
    /// How long a single write may stall before the connection is dropped.
    pub write_timeout: std::time::Duration,
    /// TLS acceptor (if TLS is enabled).
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("pool_size", &self.pool_size())
            .field("queue_capacity", &self.queue_capacity())
            .field("backlog", &self.backlog())
            .field("read_buffer_size", &self.read_buffer_size())
            .field("fragment_size", &self.fragment_size())
            .field("write_timeout", &self.write_timeout)
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9800".parse().unwrap(),
            pool_size: 0,
            queue_capacity: 0,
            backlog: 0,
            read_buffer_size: 0,
            fragment_size: 0,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            tls_acceptor: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds a runtime config from the loaded file/env configuration.
    pub fn from_network(network: &crate::config::NetworkConfig) -> Self {
        Self {
            bind_addr: network.bind_addr,
            pool_size: network.pool_size,
            queue_capacity: network.queue_capacity,
            backlog: network.backlog,
            read_buffer_size: network.read_buffer_size,
            fragment_size: network.fragment_size,
            write_timeout: network.write_timeout(),
            tls_acceptor: None,
        }
    }

    /// Sets the TLS acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    /// Returns whether TLS is enabled.
    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub fn pool_size(&self) -> usize {
        if self.pool_size == 0 {
            DEFAULT_POOL_SIZE
        } else {
            self.pool_size
        }
    }

    pub fn queue_capacity(&self) -> usize {
        if self.queue_capacity == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            self.queue_capacity
        }
    }

    pub fn backlog(&self) -> u32 {
        if self.backlog == 0 {
            DEFAULT_BACKLOG
        } else {
            self.backlog
        }
    }

    pub fn read_buffer_size(&self) -> usize {
        if self.read_buffer_size == 0 {
            DEFAULT_READ_BUFFER
        } else {
            self.read_buffer_size
        }
    }

    pub fn fragment_size(&self) -> usize {
        if self.fragment_size == 0 {
            DEFAULT_FRAGMENT_SIZE
        } else {
            self.fragment_size
        }
    }
}

/// Lifecycle state of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Running,
    Halting,
    Halted,
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub messages_in: AtomicU64,
    pub messages_out: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Handle for pushing messages to connections from outside a handler.
#[derive(Clone)]
pub struct ServerHandle {
    io_tx: mpsc::Sender<IoCmd>,
    fragment_size: usize,
    stats: Arc<ServerStats>,
}

impl ServerHandle {
    /// Sends a data message to a connection. Awaits while the reply queue
    /// is full.
    pub async fn send(&self, cid: u64, message: Message) -> Result<(), ServerError> {
        let bytes = encode_message(message, self.fragment_size)?;
        self.stats.messages_out.fetch_add(1, Ordering::Relaxed);
        self.io_tx
            .send(IoCmd::Data { cid, bytes })
            .await
            .map_err(|_| ServerError::ShuttingDown)
    }

    /// Closes a connection with a normal-closure close frame.
    pub async fn close(&self, cid: u64) -> Result<(), ServerError> {
        let bytes = Frame::close(CloseCode::Normal, "").encode()?.freeze();
        self.io_tx
            .send(IoCmd::CloseAfter { cid, bytes })
            .await
            .map_err(|_| ServerError::ShuttingDown)
    }
}

/// WebSocket server over a [`Service`].
pub struct WsServer<S: Service> {
    config: ServerConfig,
    service: Arc<S>,
    stats: Arc<ServerStats>,
    state: watch::Sender<ServerState>,
    shutdown: broadcast::Sender<()>,
    io_tx: mpsc::Sender<IoCmd>,
    io_rx: parking_lot::Mutex<Option<mpsc::Receiver<IoCmd>>>,
    next_cid: AtomicU64,
    bound_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl<S: Service> WsServer<S> {
    /// Creates a new server.
    pub fn new(config: ServerConfig, service: S) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (state_tx, _) = watch::channel(ServerState::Idle);
        let (io_tx, io_rx) = mpsc::channel(config.queue_capacity());
        Self {
            config,
            service: Arc::new(service),
            stats: Arc::new(ServerStats::default()),
            state: state_tx,
            shutdown: shutdown_tx,
            io_tx,
            io_rx: parking_lot::Mutex::new(Some(io_rx)),
            next_cid: AtomicU64::new(1),
            bound_addr: parking_lot::Mutex::new(None),
        }
    }

    /// Runs the server until [`stop`](Self::stop) is called.
    pub async fn run(&self) -> Result<(), ServerError> {
        let io_rx = self
            .io_rx
            .lock()
            .take()
            .ok_or(ServerError::AlreadyRunning)?;

        let listener = self.bind()?;
        let local_addr = listener.local_addr()?;
        *self.bound_addr.lock() = Some(local_addr);
        let _ = self.state.send_replace(ServerState::Running);

        let tls_mode = if self.config.tls_enabled() {
            "TLS"
        } else {
            "plain"
        };
        tracing::info!("Server listening on {} ({})", local_addr, tls_mode);

        let registry_task = tokio::spawn(registry::run(
            io_rx,
            self.service.clone(),
            self.stats.clone(),
            self.config.write_timeout,
        ));

        let pool_size = self.config.pool_size();
        let mut work_txs = Vec::with_capacity(pool_size);
        let mut worker_tasks = Vec::with_capacity(pool_size);
        for id in 0..pool_size {
            let (tx, rx) = mpsc::channel::<WorkItem>(self.config.queue_capacity());
            let worker = Worker::new(
                id,
                self.service.clone(),
                self.io_tx.clone(),
                self.config.fragment_size(),
                self.stats.clone(),
            );
            worker_tasks.push(tokio::spawn(worker.run(rx)));
            work_txs.push(tx);
        }

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let work_tx = work_txs[(cid as usize) % pool_size].clone();
                            let io_tx = self.io_tx.clone();
                            let tls_acceptor = self.config.tls_acceptor.clone();
                            let service = self.service.clone();
                            let stats = self.stats.clone();
                            let read_buffer_size = self.config.read_buffer_size();
                            let conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let stream = match maybe_tls_accept(tcp_stream, tls_acceptor.as_deref(), addr).await {
                                    Ok(s) => s,
                                    Err(e) => {
                                        tracing::warn!("[{}] TLS handshake failed: {}", addr, e);
                                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                        stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                        return;
                                    }
                                };

                                tracing::info!("[cid={}] client connected: {}", cid, addr);
                                let (reader, writer) = tokio::io::split(stream);
                                if io_tx.send(IoCmd::Register { cid, writer }).await.is_err() {
                                    return;
                                }
                                service.on_connect(cid, addr);

                                read_loop(cid, reader, work_tx, read_buffer_size, conn_shutdown).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        // Readers stop on the shutdown signal; dropping our work senders
        // lets each worker drain its queue and exit.
        drop(work_txs);
        for task in worker_tasks {
            let _ = task.await;
        }

        // Queued replies are written before the registry closes everything.
        let _ = self.io_tx.send(IoCmd::Halt).await;
        let _ = registry_task.await;

        let _ = self.state.send_replace(ServerState::Halted);
        Ok(())
    }

    fn bind(&self) -> Result<tokio::net::TcpListener, ServerError> {
        let socket = if self.config.bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(self.config.bind_addr)?;
        Ok(socket.listen(self.config.backlog())?)
    }

    /// Signals shutdown and waits until every task has exited. A server
    /// that was never started has nothing to wait for.
    pub async fn stop(&self) {
        if self.state() == ServerState::Idle {
            return;
        }
        let _ = self.state.send_replace(ServerState::Halting);
        let _ = self.shutdown.send(());

        let mut state_rx = self.state.subscribe();
        while *state_rx.borrow() != ServerState::Halted {
            if state_rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Returns a handle for out-of-band sends.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            io_tx: self.io_tx.clone(),
            fragment_size: self.config.fragment_size(),
            stats: self.stats.clone(),
        }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Returns whether the server is accepting connections.
    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Returns the bound address once the server is running. Useful when
    /// binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

/// Optionally performs TLS handshake on the stream.
async fn maybe_tls_accept(
    tcp_stream: TcpStream,
    acceptor: Option<&TlsAcceptor>,
    addr: SocketAddr,
) -> Result<MaybeTlsStream, ServerError> {
    match acceptor {
        Some(acceptor) => {
            tracing::debug!("[{}] Performing TLS handshake", addr);
            let tls_stream = acceptor
                .accept(tcp_stream)
                .await
                .map_err(|e| ServerError::TlsHandshake(e.to_string()))?;
            Ok(MaybeTlsStream::Tls { inner: tls_stream })
        }
        None => Ok(MaybeTlsStream::Tcp { inner: tcp_stream }),
    }
}

/// Reads from one connection until EOF, error or shutdown, forwarding bytes
/// to the connection's owning worker.
async fn read_loop(
    cid: u64,
    mut reader: tokio::io::ReadHalf<MaybeTlsStream>,
    work_tx: mpsc::Sender<WorkItem>,
    read_buffer_size: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; read_buffer_size];
    loop {
        tokio::select! {
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        tracing::debug!("[cid={}] connection closed by peer", cid);
                        let _ = work_tx.send(WorkItem { cid, event: ConnEvent::Eof }).await;
                        return;
                    }
                    Ok(n) => {
                        let bytes = Bytes::copy_from_slice(&buf[..n]);
                        if work_tx.send(WorkItem { cid, event: ConnEvent::Data(bytes) }).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("[cid={}] read error: {}", cid, e);
                        let _ = work_tx.send(WorkItem { cid, event: ConnEvent::Eof }).await;
                        return;
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!("[cid={}] shutdown signal received", cid);
                return;
            }
        }
    }
}
