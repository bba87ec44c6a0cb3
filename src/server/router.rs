//! Command registry, dispatch, and the outbound command queue.
//!
//! Directors register one typed handler per command id at startup. The
//! read loop hands each decoded frame to [`CommandRouter::dispatch`],
//! which deserializes the payload into the registered message type and
//! invokes the handler with a [`CommandContext`]. Dispatch runs inline in
//! the connection's read task, so two handlers never run concurrently for
//! the same connection.
//!
//! Failures at the dispatch boundary are contained: an unknown command id
//! or a failing handler is logged and the connection keeps going. Only
//! the framing layer can fail a connection.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;

use crate::error::{RanchwireError, Result};
use crate::protocol::{
    encode_magic, CommandId, InboundFrame, MessageHeader, StreamBuffer, WireDecode, WireEncode,
    MAGIC_SIZE, MAX_PAYLOAD,
};
use crate::server::connection::{ClientId, ConnectionRegistry, OutboundFrame};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait object interface over registered handlers.
pub trait CommandHandler: Send + Sync + 'static {
    /// Handle one inbound command with its raw (already decrypted)
    /// payload bytes.
    fn call(&self, ctx: CommandContext, payload: Bytes) -> BoxFuture<'static, Result<()>>;
}

/// Wrapper that decodes the payload into `T` before calling the handler.
struct TypedHandler<F, T, Fut>
where
    F: Fn(CommandContext, T) -> Fut + Send + Sync + 'static,
    T: WireDecode + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> CommandHandler for TypedHandler<F, T, Fut>
where
    F: Fn(CommandContext, T) -> Fut + Send + Sync + 'static,
    T: WireDecode + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, ctx: CommandContext, payload: Bytes) -> BoxFuture<'static, Result<()>> {
        let mut buf = StreamBuffer::from_slice(&payload);
        let message = match T::decode(&mut buf) {
            Ok(message) => message,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        Box::pin((self.handler)(ctx, message))
    }
}

/// Mapping from command id to handler, populated once at startup.
pub struct CommandRouter {
    handlers: HashMap<CommandId, Box<dyn CommandHandler>>,
}

impl CommandRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Bind a typed handler for an inbound command id.
    ///
    /// Registering the same id twice replaces the previous handler.
    pub fn register<T, F, Fut>(&mut self, command: CommandId, handler: F)
    where
        F: Fn(CommandContext, T) -> Fut + Send + Sync + 'static,
        T: WireDecode + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let typed = TypedHandler {
            handler,
            _phantom: PhantomData,
        };
        self.handlers.insert(command, Box::new(typed));
    }

    /// Whether a handler is bound for `command`.
    pub fn is_registered(&self, command: CommandId) -> bool {
        self.handlers.contains_key(&command)
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether any command is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch one decoded frame.
    ///
    /// Never fails the connection: an unregistered id is acknowledged by
    /// having consumed the payload and logged; a decode or handler error
    /// is logged and swallowed at this boundary. Handler panics are caught
    /// here too, so one misbehaving command cannot tear down the read loop
    /// it runs inside.
    pub async fn dispatch(&self, ctx: CommandContext, frame: InboundFrame) {
        let handler = match self.handlers.get(&frame.command) {
            Some(handler) => handler,
            None => {
                tracing::warn!(client = %ctx.client(), command = %frame.command, "unhandled command");
                return;
            }
        };

        let command = frame.command;
        let client = ctx.client();

        // The closure builds the future; the future runs the handler body.
        // Either stage may unwind.
        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            handler.call(ctx, frame.payload)
        })) {
            Ok(future) => future,
            Err(panic) => {
                let reason = panic_message(&panic);
                tracing::error!(client = %client, command = %command, %reason, "handler panicked");
                return;
            }
        };

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(client = %client, command = %command, error = %e, "handler failed");
            }
            Err(panic) => {
                let reason = panic_message(&panic);
                tracing::error!(client = %client, command = %command, %reason, "handler panicked");
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "opaque panic payload"
    }
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound command queue, addressable by connection id.
///
/// Cheaply cloneable; directors hold one to push unsolicited commands,
/// and every [`CommandContext`] carries one for replies.
#[derive(Clone)]
pub struct CommandSender {
    registry: Arc<ConnectionRegistry>,
    scratch_capacity: usize,
}

impl CommandSender {
    pub(crate) fn new(registry: Arc<ConnectionRegistry>, scratch_capacity: usize) -> Self {
        Self {
            registry,
            scratch_capacity,
        }
    }

    /// Frame and enqueue a typed outbound message.
    ///
    /// Fails with [`RanchwireError::UnknownClient`] if the connection
    /// disconnected concurrently; callers must tolerate that.
    pub async fn queue_command<M: WireEncode>(
        &self,
        client: ClientId,
        command: CommandId,
        message: &M,
    ) -> Result<()> {
        self.queue_command_with(client, command, |buf| message.encode(buf))
            .await
    }

    /// Frame and enqueue an outbound message serialized by a closure.
    ///
    /// Reserves the magic at offset 0, serializes the body, computes the
    /// payload length from the cursor delta, and back-patches the encoded
    /// header before handing the frame to the connection's write queue.
    /// Outbound payloads are not passed through the rolling cipher.
    pub async fn queue_command_with<F>(
        &self,
        client: ClientId,
        command: CommandId,
        write_payload: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut StreamBuffer) -> Result<()>,
    {
        let handle = self.registry.get(client)?;

        let mut buf = StreamBuffer::new(self.scratch_capacity);
        buf.seek(MAGIC_SIZE)?;
        write_payload(&mut buf)?;

        let payload_len = buf.filled().len() - MAGIC_SIZE;
        if payload_len > MAX_PAYLOAD as usize {
            return Err(RanchwireError::Protocol(format!(
                "outbound payload of {} bytes exceeds maximum {}",
                payload_len, MAX_PAYLOAD
            )));
        }

        let header = MessageHeader::new(command, payload_len as u16);
        buf.seek(0)?;
        buf.write_u32(encode_magic(&header))?;

        let frame = OutboundFrame::new(Bytes::copy_from_slice(buf.filled()));
        handle.send(frame).await
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }
}

/// Context handed to command handlers.
#[derive(Clone)]
pub struct CommandContext {
    client: ClientId,
    sender: CommandSender,
}

impl CommandContext {
    pub(crate) fn new(client: ClientId, sender: CommandSender) -> Self {
        Self { client, sender }
    }

    /// Id of the connection this command arrived on.
    #[inline]
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Queue to any connection (for cross-session notifications).
    pub fn sender(&self) -> &CommandSender {
        &self.sender
    }

    /// Queue a typed reply to the originating connection.
    pub async fn reply<M: WireEncode>(&self, command: CommandId, message: &M) -> Result<()> {
        self.sender
            .queue_command(self.client, command, message)
            .await
    }

    /// Queue a closure-serialized reply to the originating connection.
    pub async fn reply_with<F>(&self, command: CommandId, write_payload: F) -> Result<()>
    where
        F: FnOnce(&mut StreamBuffer) -> Result<()>,
    {
        self.sender
            .queue_command_with(self.client, command, write_payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriterSettings;
    use crate::protocol::{decode_magic, BUFFER_SIZE};
    use crate::server::connection::spawn_writer_task;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncReadExt};

    fn test_sender() -> (CommandSender, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        (
            CommandSender::new(registry.clone(), BUFFER_SIZE),
            registry,
        )
    }

    async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> (CommandId, Vec<u8>) {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).await.unwrap();
        let header = decode_magic(u32::from_le_bytes(magic));

        let mut payload = vec![0u8; header.length as usize];
        reader.read_exact(&mut payload).await.unwrap();
        (header.id, payload)
    }

    #[test]
    fn register_and_lookup() {
        let mut router = CommandRouter::new();
        assert!(router.is_empty());

        router.register(CommandId(3), |_ctx, _msg: u32| async { Ok(()) });
        assert!(router.is_registered(CommandId(3)));
        assert!(!router.is_registered(CommandId(4)));
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn re_registration_replaces() {
        let mut router = CommandRouter::new();
        router.register(CommandId(1), |_ctx, _msg: u8| async { Ok(()) });
        router.register(CommandId(1), |_ctx, _msg: u8| async { Ok(()) });
        assert_eq!(router.len(), 1);
    }

    #[tokio::test]
    async fn dispatch_decodes_and_invokes() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let mut router = CommandRouter::new();
        router.register(CommandId(21), |_ctx, msg: u32| async move {
            assert_eq!(msg, 0xCAFE_F00D);
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (sender, _registry) = test_sender();
        let ctx = CommandContext::new(ClientId(1), sender);
        let frame = InboundFrame {
            command: CommandId(21),
            payload: Bytes::copy_from_slice(&0xCAFE_F00Du32.to_le_bytes()),
        };

        router.dispatch(ctx, frame).await;
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_command_does_not_error() {
        let router = CommandRouter::new();
        let (sender, _registry) = test_sender();
        let ctx = CommandContext::new(ClientId(1), sender);

        let frame = InboundFrame {
            command: CommandId(999),
            payload: Bytes::from_static(b"ignored"),
        };

        // Must not panic or fail; the payload is simply consumed.
        router.dispatch(ctx, frame).await;
    }

    #[tokio::test]
    async fn handler_error_is_contained() {
        let mut router = CommandRouter::new();
        router.register(CommandId(5), |_ctx, _msg: ()| async {
            Err(RanchwireError::Protocol("handler blew up".into()))
        });

        let (sender, _registry) = test_sender();
        let ctx = CommandContext::new(ClientId(1), sender);
        let frame = InboundFrame {
            command: CommandId(5),
            payload: Bytes::new(),
        };

        router.dispatch(ctx, frame).await;
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        async fn blow_up(_ctx: CommandContext, _msg: ()) -> Result<()> {
            panic!("handler blew the stack")
        }

        let mut router = CommandRouter::new();
        router.register(CommandId(8), blow_up);

        let (sender, _registry) = test_sender();
        let ctx = CommandContext::new(ClientId(1), sender);
        let frame = InboundFrame {
            command: CommandId(8),
            payload: Bytes::new(),
        };

        // Must return normally; the unwind stops at the dispatch boundary.
        router.dispatch(ctx, frame).await;
    }

    #[tokio::test]
    async fn payload_decode_failure_is_contained() {
        let mut router = CommandRouter::new();
        router.register(CommandId(6), |_ctx, _msg: u32| async { Ok(()) });

        let (sender, _registry) = test_sender();
        let ctx = CommandContext::new(ClientId(1), sender);
        let frame = InboundFrame {
            command: CommandId(6),
            // Two bytes where the type wants four.
            payload: Bytes::from_static(&[1, 2]),
        };

        router.dispatch(ctx, frame).await;
    }

    #[tokio::test]
    async fn queue_command_frames_and_back_patches() {
        let (sender, registry) = test_sender();
        let (client_io, mut server_io) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client_io, WriterSettings::default());
        registry.insert(ClientId(9), handle);

        sender
            .queue_command_with(ClientId(9), CommandId(0x2A), |buf| {
                buf.write_u16(0xBEEF)?;
                buf.write_str("mare")
            })
            .await
            .unwrap();

        let (id, payload) = read_frame(&mut server_io).await;
        assert_eq!(id, CommandId(0x2A));
        assert_eq!(payload, [0xEF, 0xBE, b'm', b'a', b'r', b'e', 0]);
    }

    #[tokio::test]
    async fn queue_command_typed_message() {
        let (sender, registry) = test_sender();
        let (client_io, mut server_io) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client_io, WriterSettings::default());
        registry.insert(ClientId(2), handle);

        sender
            .queue_command(ClientId(2), CommandId(7), &0x0102_0304u32)
            .await
            .unwrap();

        let (id, payload) = read_frame(&mut server_io).await;
        assert_eq!(id, CommandId(7));
        assert_eq!(payload, [0x04, 0x03, 0x02, 0x01]);
    }

    #[tokio::test]
    async fn queue_command_to_departed_connection_fails_softly() {
        let (sender, _registry) = test_sender();

        let result = sender.queue_command(ClientId(404), CommandId(1), &0u8).await;
        assert!(matches!(
            result,
            Err(RanchwireError::UnknownClient(ClientId(404)))
        ));
    }

    #[tokio::test]
    async fn zero_payload_command_is_a_bare_magic() {
        let (sender, registry) = test_sender();
        let (client_io, mut server_io) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client_io, WriterSettings::default());
        registry.insert(ClientId(3), handle);

        sender
            .queue_command(ClientId(3), CommandId(0x11), &())
            .await
            .unwrap();

        let (id, payload) = read_frame(&mut server_io).await;
        assert_eq!(id, CommandId(0x11));
        assert!(payload.is_empty());
    }
}
