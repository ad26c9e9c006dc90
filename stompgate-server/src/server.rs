//! TCP server implementation.

use crate::broker::FrameSink;
use crate::config::Config;
use crate::error::{ServerError, SinkClosed};
use crate::handler::{Flow, HandlerSettings, ProtocolHandler};
use crate::memory::MemoryBroker;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stompgate_protocol::{Decoder, Encoder, Frame};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Dispatcher settings for every connection.
    pub handler: HandlerSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(Config::default().network.bind_addr)
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            idle_timeout: Duration::from_secs(300),
            max_connections: 1000,
            handler: HandlerSettings::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            handler: HandlerSettings {
                server_name: config.protocol.server_name.clone(),
                close_on_parse_error: config.protocol.close_on_parse_error,
                ..HandlerSettings::default()
            },
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub frames_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Item on a connection's outbound queue.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    /// Stop writing; the connection is done.
    Close,
}

/// Outbound sink backed by the connection's writer queue.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }
}

impl FrameSink for ChannelSink {
    fn deliver(&self, frame: Frame) -> Result<(), SinkClosed> {
        self.tx.send(Outbound::Frame(frame)).map_err(|_| SinkClosed)
    }
}

/// Writes queued frames until the queue closes, a `Close` arrives, or a
/// fatal ERROR frame has been written.
pub async fn write_frames<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(8192);
    while let Some(Outbound::Frame(frame)) = rx.recv().await {
        buf.clear();
        Encoder::encode_into(&frame, &mut buf);
        writer.write_all(&buf).await?;
        if frame.is_fatal() {
            break;
        }
    }
    writer.flush().await?;
    writer.shutdown().await
}

/// Why a connection's read loop ended.
enum Ending {
    /// The dispatcher asked to close.
    Closed,
    Eof,
    Idle,
    Shutdown,
    Failed(std::io::Error),
}

/// STOMP bridge server.
pub struct Server {
    config: ServerConfig,
    broker: MemoryBroker,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig, broker: MemoryBroker) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            broker,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => self.accept(tcp_stream, addr),
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

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn accept(&self, tcp_stream: TcpStream, addr: SocketAddr) {
        if self.stats.connections_active.load(Ordering::Relaxed)
            >= self.config.max_connections as u64
        {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            return;
        }

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let broker = self.broker.clone();
        let stats = self.stats.clone();
        let config = self.config.clone();
        let mut conn_shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let result = Self::handle_connection(
                tcp_stream,
                addr,
                broker,
                &config,
                &stats,
                &mut conn_shutdown,
            )
            .await;

            if let Err(e) = result {
                tracing::debug!("Connection {} error: {}", addr, e);
                stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            tracing::info!("Client disconnected: {}", addr);
        });
    }

    /// Handles a single connection.
    ///
    /// The read loop feeds the decoder and the dispatcher; a writer task
    /// drains the outbound queue so broker deliveries never wait on reads.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        broker: MemoryBroker,
        config: &ServerConfig,
        stats: &ServerStats,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        tracing::info!("Client connected: {}", addr);

        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_frames(writer, rx));

        let connection = broker.open_connection();
        let handler = ProtocolHandler::new(
            addr.to_string(),
            connection.clone(),
            connection,
            Arc::new(ChannelSink::new(tx.clone())),
        )
        .with_settings(config.handler.clone());

        let mut decoder = Decoder::new();
        let mut buf = [0u8; 8192];

        let ending = loop {
            tokio::select! {
                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => break Ending::Eof,
                        Ok(n) => {
                            tracing::trace!("[{}] Received {} bytes", addr, n);
                            decoder.extend(&buf[..n]);
                        }
                        Err(e) => break Ending::Failed(e),
                    }
                }
                _ = tokio::time::sleep(config.idle_timeout) => break Ending::Idle,
                _ = shutdown.recv() => break Ending::Shutdown,
            }

            if Self::dispatch(&handler, &mut decoder) == Flow::Close {
                break Ending::Closed;
            }
        };

        // No-op after DISCONNECT.
        handler.close(true);
        stats
            .frames_total
            .fetch_add(handler.state().frame_count(), Ordering::Relaxed);

        let _ = tx.send(Outbound::Close);
        drop(handler);
        drop(tx);
        match writer_task.await {
            Ok(Err(e)) => tracing::debug!("[{}] Write error: {}", addr, e),
            Err(e) => tracing::warn!("[{}] Writer task failed: {}", addr, e),
            Ok(Ok(())) => {}
        }

        match ending {
            Ending::Closed => Ok(()),
            Ending::Eof => {
                tracing::debug!("[{}] Connection closed by client", addr);
                Ok(())
            }
            Ending::Idle => {
                tracing::debug!("[{}] Idle timeout", addr);
                Ok(())
            }
            Ending::Shutdown => Err(ServerError::ShuttingDown),
            Ending::Failed(e) => Err(ServerError::Io(e)),
        }
    }

    /// Hands every complete frame in the decoder to the dispatcher.
    fn dispatch(handler: &ProtocolHandler, decoder: &mut Decoder) -> Flow {
        loop {
            match decoder.decode_frame() {
                Ok(Some(frame)) => {
                    if handler.handle(frame) == Flow::Close {
                        return Flow::Close;
                    }
                }
                Ok(None) => return Flow::Continue,
                Err(e) => return handler.handle_parse_failure(e),
            }
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}
