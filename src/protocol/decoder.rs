//! Inbound frame extraction from accumulated socket bytes.
//!
//! Uses `bytes::BytesMut` for the read accumulator. The magic is peeked
//! without being consumed; until a frame's payload is fully buffered
//! nothing is taken out of the accumulator, which makes arbitrary TCP
//! fragmentation transparent to the dispatch layer. Once a frame is
//! complete the payload is XOR-decrypted in place and the connection
//! cipher rolls to the key for the next frame.
//!
//! Validation failures (command id out of range, oversize length) are
//! returned as errors and are fatal to the connection.

use bytes::{Buf, Bytes, BytesMut};

use crate::config::ServerConfig;
use crate::error::{RanchwireError, Result};
use crate::protocol::cipher::RollingCipher;
use crate::protocol::magic::{decode_magic, CommandId, BUFFER_SIZE, MAGIC_SIZE, MAX_COMMAND_SIZE};

/// One complete inbound command: decoded id plus decrypted payload.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Decoded command id.
    pub command: CommandId,
    /// Decrypted payload bytes (zero-copy hand-off from the accumulator).
    pub payload: Bytes,
}

/// Bounds enforced on every decoded header.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    /// Maximum accepted payload length.
    pub max_command_size: u16,
    /// Command ids must decode strictly below this value.
    pub command_id_limit: u16,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_command_size: MAX_COMMAND_SIZE,
            command_id_limit: 0x4000,
        }
    }
}

impl From<&ServerConfig> for FrameLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_command_size: config.max_command_size,
            command_id_limit: config.command_id_limit,
        }
    }
}

/// Accumulates raw socket bytes and yields complete, decrypted frames.
pub struct FrameDecoder {
    buffer: BytesMut,
    cipher: RollingCipher,
    limits: FrameLimits,
}

impl FrameDecoder {
    /// Create a decoder with a connection-fresh cipher.
    pub fn new(cipher: RollingCipher, limits: FrameLimits) -> Self {
        Self {
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            cipher,
            limits,
        }
    }

    /// Append socket bytes and extract every complete frame.
    ///
    /// Returns the frames in arrival order. Partial trailing data stays
    /// buffered for the next push. A validation failure is a protocol
    /// violation: the caller must close the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<InboundFrame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Bytes currently buffered but not yet framed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn try_extract_one(&mut self) -> Result<Option<InboundFrame>> {
        if self.buffer.len() < MAGIC_SIZE {
            return Ok(None);
        }

        // Peek the magic without consuming it.
        let magic = u32::from_le_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]);
        let header = decode_magic(magic);

        if header.id.0 >= self.limits.command_id_limit {
            return Err(RanchwireError::Protocol(format!(
                "command id {} outside the registered range (< {:#06x})",
                header.id, self.limits.command_id_limit
            )));
        }
        if header.length > self.limits.max_command_size {
            return Err(RanchwireError::Protocol(format!(
                "payload length {} exceeds maximum {}",
                header.length, self.limits.max_command_size
            )));
        }

        let payload_len = header.length as usize;
        if self.buffer.len() < MAGIC_SIZE + payload_len {
            // Need more data; consume nothing.
            return Ok(None);
        }

        self.buffer.advance(MAGIC_SIZE);
        let mut payload = self.buffer.split_to(payload_len);
        self.cipher.apply(&mut payload);
        self.cipher.roll();

        Ok(Some(InboundFrame {
            command: header.id,
            payload: payload.freeze(),
        }))
    }
}
