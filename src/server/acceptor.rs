//! TCP acceptor, connection lifecycle, and the server entry point.
//!
//! [`CommandServer`] composes the acceptor, the per-connection read/write
//! tasks, and the command router. The lifecycle per accepted socket:
//!
//! 1. Assign the next sequential [`ClientId`]
//! 2. Spawn the writer task and register it in the connection registry
//! 3. Fire [`SessionHooks::on_connect`] so directors can prepare
//!    per-session state before any frame is read
//! 4. Run the read loop until EOF, a socket error, or a protocol
//!    violation
//! 5. Deregister and fire [`SessionHooks::on_disconnect`]
//!
//! The accept loop always re-arms after an accept error; a single failed
//! accept must never stop the server from taking new connections.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::config::ServerConfig;
use crate::error::{RanchwireError, Result};
use crate::protocol::{CommandId, FrameDecoder, FrameLimits, RollingCipher, WireDecode};
use crate::server::connection::{spawn_writer_task, ClientId, ConnectionRegistry};
use crate::server::router::{CommandContext, CommandRouter, CommandSender};

/// Lifecycle callbacks for directors to create and tear down per-session
/// state in their own stores.
///
/// Both methods default to no-ops. `on_connect` fires before the first
/// frame is read; `on_disconnect` fires after the connection is out of
/// the registry.
pub trait SessionHooks: Send + Sync {
    /// A connection was accepted and registered.
    fn on_connect(&self, _client: ClientId) {}

    /// A connection closed and was deregistered.
    fn on_disconnect(&self, _client: ClientId) {}
}

impl<T: SessionHooks + ?Sized> SessionHooks for Arc<T> {
    fn on_connect(&self, client: ClientId) {
        (**self).on_connect(client)
    }

    fn on_disconnect(&self, client: ClientId) {
        (**self).on_disconnect(client)
    }
}

/// Default hooks: do nothing.
struct NoHooks;

impl SessionHooks for NoHooks {}

/// Builder for configuring and creating a [`CommandServer`].
pub struct CommandServerBuilder {
    config: ServerConfig,
    router: CommandRouter,
    hooks: Arc<dyn SessionHooks>,
}

impl CommandServerBuilder {
    /// Create a builder with default configuration and no handlers.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            router: CommandRouter::new(),
            hooks: Arc::new(NoHooks),
        }
    }

    /// Replace the transport configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Install session lifecycle hooks.
    pub fn hooks(mut self, hooks: impl SessionHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Bind a typed handler for an inbound command id.
    pub fn handle<T, F, Fut>(mut self, command: CommandId, handler: F) -> Self
    where
        F: Fn(CommandContext, T) -> Fut + Send + Sync + 'static,
        T: WireDecode + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.router.register(command, handler);
        self
    }

    /// Finish building the server.
    pub fn build(self) -> CommandServer {
        CommandServer {
            config: Arc::new(self.config),
            router: Arc::new(self.router),
            registry: Arc::new(ConnectionRegistry::new()),
            hooks: self.hooks,
            next_id: AtomicU32::new(1),
        }
    }
}

impl Default for CommandServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The dedicated-server command transport: acceptor, connections, and
/// dispatch, behind a registration and send API.
pub struct CommandServer {
    config: Arc<ServerConfig>,
    router: Arc<CommandRouter>,
    registry: Arc<ConnectionRegistry>,
    hooks: Arc<dyn SessionHooks>,
    next_id: AtomicU32,
}

impl CommandServer {
    /// Create a builder.
    pub fn builder() -> CommandServerBuilder {
        CommandServerBuilder::new()
    }

    /// Outbound command queue handle for directors.
    pub fn sender(&self) -> CommandSender {
        CommandSender::new(
            self.registry.clone(),
            self.config.buffer_mode.buffer_size(),
        )
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Bind a TCP endpoint and run the accept loop for the life of the
    /// process.
    pub async fn host(&self, addr: impl ToSocketAddrs) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Run the accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "listening");
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
                    tracing::debug!(client = %id, %peer, "accepted");
                    self.spawn_connection(id, stream);
                }
                Err(e) => {
                    // One bad accept must not stop the listener.
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            }
        }
    }

    fn spawn_connection(&self, id: ClientId, stream: TcpStream) {
        let _ = stream.set_nodelay(true);

        let config = self.config.clone();
        let router = self.router.clone();
        let registry = self.registry.clone();
        let hooks = self.hooks.clone();

        tokio::spawn(async move {
            connection_task(id, stream, config, router, registry, hooks).await;
        });
    }
}

/// Deregisters the connection and fires the disconnect hook on drop, so
/// teardown runs on every exit path out of [`connection_task`], including
/// an unwind.
struct ConnectionGuard {
    id: ClientId,
    registry: Arc<ConnectionRegistry>,
    hooks: Arc<dyn SessionHooks>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        self.hooks.on_disconnect(self.id);
    }
}

/// Owns one connection from registration to teardown.
async fn connection_task(
    id: ClientId,
    stream: TcpStream,
    config: Arc<ServerConfig>,
    router: Arc<CommandRouter>,
    registry: Arc<ConnectionRegistry>,
    hooks: Arc<dyn SessionHooks>,
) {
    let (read_half, write_half) = stream.into_split();
    let (writer, writer_task) = spawn_writer_task(write_half, config.writer);

    registry.insert(id, writer);
    hooks.on_connect(id);

    let sender = CommandSender::new(registry.clone(), config.buffer_mode.buffer_size());
    let _guard = ConnectionGuard { id, registry, hooks };

    let result = tokio::select! {
        read = read_loop(id, read_half, &config, &router, sender) => read,
        write = writer_task => match write {
            Ok(outcome) => outcome,
            Err(_) => Err(RanchwireError::ConnectionClosed),
        },
    };

    match result {
        Ok(()) => tracing::debug!(client = %id, "disconnected"),
        Err(e) => tracing::warn!(client = %id, error = %e, "connection closed"),
    }
}

/// Accumulate socket bytes, extract frames, dispatch inline.
///
/// Dispatching inside this task is what guarantees that handlers for one
/// connection never run concurrently with each other.
async fn read_loop(
    id: ClientId,
    mut reader: OwnedReadHalf,
    config: &ServerConfig,
    router: &CommandRouter,
    sender: CommandSender,
) -> Result<()> {
    let mut decoder = FrameDecoder::new(
        RollingCipher::new(&config.cipher),
        FrameLimits::from(config),
    );
    let mut buf = vec![0u8; config.buffer_mode.buffer_size()];

    loop {
        let n = match config.read_timeout() {
            Some(limit) => match tokio::time::timeout(limit, reader.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => return Err(RanchwireError::ReadTimeout),
            },
            None => reader.read(&mut buf).await?,
        };
        if n == 0 {
            // Peer closed cleanly.
            return Ok(());
        }

        let frames = decoder.push(&buf[..n])?;
        for frame in frames {
            let ctx = CommandContext::new(id, sender.clone());
            router.dispatch(ctx, frame).await;
        }
    }
}
