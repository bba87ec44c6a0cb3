//! Per-connection identity, write queue, and the live-connection registry.
//!
//! The write path is a dedicated writer task fed by an mpsc channel of
//! fully framed byte buffers:
//!
//! ```text
//! Handler 1 ─┐
//! Handler 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► TcpStream
//! Handler N ─┘
//! ```
//!
//! Channel FIFO gives the submission-order guarantee for outbound frames;
//! batching multiple frames into one `write_vectored` call keeps syscall
//! counts down. The handle tracks a pending count so producers back off
//! when the socket falls behind.

use std::collections::HashMap;
use std::fmt;
use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::WriterSettings;
use crate::error::{RanchwireError, Result};

/// Maximum frames coalesced into a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Process-unique sequential connection identifier, assigned at accept
/// time and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A complete frame (magic + payload, header already back-patched) ready
/// for the wire.
#[derive(Debug, Clone)]
pub struct OutboundFrame(Bytes);

impl OutboundFrame {
    /// Wrap framed bytes.
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// Total frame size on the wire.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the frame carries any bytes at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The framed bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Handle for enqueueing frames on one connection's writer task.
///
/// Cheaply cloneable; shared by every handler that responds to the same
/// connection.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        settings: &WriterSettings,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending: settings.max_pending_frames,
            timeout: settings.backpressure_timeout(),
        }
    }

    /// Enqueue a frame, waiting for queue space up to the configured
    /// backpressure timeout.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            RanchwireError::ConnectionClosed
        })
    }

    /// Enqueue a frame without waiting; fails immediately at capacity.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(RanchwireError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => RanchwireError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => RanchwireError::ConnectionClosed,
            }
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                return Err(RanchwireError::BackpressureTimeout);
            }
            tokio::time::sleep(check_interval).await;
        }
    }

    /// Frames queued but not yet flushed to the socket.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether senders would currently wait.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending_count() >= self.max_pending
    }
}

/// Spawn the writer task for one connection's write half.
pub fn spawn_writer_task<W>(
    writer: W,
    settings: WriterSettings,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(settings.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(tx, pending.clone(), &settings);
    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

/// Receives frames and flushes them, batching whatever is ready.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(frame) => frame,
            // All handles dropped: clean shutdown.
            None => return Ok(()),
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        write_batch(&mut writer, &batch).await?;
        pending.fetch_sub(batch_size, Ordering::Release);
    }
}

/// Write a batch of frames with scatter/gather I/O, continuing through
/// partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(|f| f.len()).sum();
    let mut written = 0usize;

    while written < total {
        let slices = remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(RanchwireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlice view over the batch, skipping the bytes already written.
fn remaining_slices(batch: &[OutboundFrame], mut skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());

    for frame in batch {
        if skip >= frame.len() {
            skip -= frame.len();
            continue;
        }
        if !frame.is_empty() {
            slices.push(IoSlice::new(&frame.bytes()[skip..]));
        }
        skip = 0;
    }

    slices
}

/// Live connections by id.
///
/// Mutated only by the accept/teardown path; everyone else looks up a
/// writer handle by id and must tolerate the id being gone (the client
/// may have disconnected concurrently).
///
/// A poisoned lock is recovered rather than propagated: each guarded
/// section is a single map operation, so the map is never left in a
/// half-mutated state and the accept path must keep running.
pub struct ConnectionRegistry {
    map: RwLock<HashMap<ClientId, WriterHandle>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Register a freshly accepted connection's writer.
    pub fn insert(&self, client: ClientId, handle: WriterHandle) {
        self.map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client, handle);
    }

    /// Deregister a departed connection.
    pub fn remove(&self, client: ClientId) {
        self.map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&client);
    }

    /// Look up a connection's writer handle.
    pub fn get(&self, client: ClientId) -> Result<WriterHandle> {
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&client)
            .cloned()
            .ok_or(RanchwireError::UnknownClient(client))
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether any connection is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
