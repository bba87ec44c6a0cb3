//! Process-wide transport configuration.
//!
//! Buffer sizes, the command ceiling, and the cipher constants are
//! injected at construction instead of living as compile-time globals, so
//! tests and alternate deployments can override them.

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::protocol::{BUFFER_SIZE, JUMBO_BUFFER_SIZE, MAX_COMMAND_SIZE};
use crate::protocol::cipher::{XOR_CONTROL, XOR_MULTIPLIER};

/// Read-chunk and scratch-buffer sizing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BufferMode {
    /// 4096-byte buffers.
    #[default]
    Standard,
    /// 16384-byte buffers.
    Jumbo,
}

impl BufferMode {
    /// Bytes requested per socket read, and the outbound scratch capacity.
    pub fn buffer_size(self) -> usize {
        match self {
            BufferMode::Standard => BUFFER_SIZE,
            BufferMode::Jumbo => JUMBO_BUFFER_SIZE,
        }
    }
}

/// Rolling cipher constants.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    /// LCG multiplier.
    pub multiplier: u32,
    /// LCG increment (`{0xCB, 0x91, 0x01, 0xA2}` little-endian).
    pub control: u32,
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            multiplier: XOR_MULTIPLIER,
            control: XOR_CONTROL,
        }
    }
}

/// Write-queue sizing and backpressure policy.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WriterSettings {
    /// Maximum queued frames before senders start waiting.
    pub max_pending_frames: usize,
    /// Channel capacity for the per-connection write queue.
    pub channel_capacity: usize,
    /// How long a sender waits for queue space, in milliseconds.
    pub backpressure_timeout_ms: u64,
}

impl WriterSettings {
    /// Backpressure wait as a `Duration`.
    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            max_pending_frames: 1024,
            channel_capacity: 1024,
            backpressure_timeout_ms: 5_000,
        }
    }
}

/// Transport-layer configuration injected into the server at construction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Read-chunk sizing mode.
    pub buffer_mode: BufferMode,
    /// Ceiling on a decoded payload length; larger frames are a fatal
    /// protocol violation for the connection.
    pub max_command_size: u16,
    /// Command ids must decode below this bound. Defaults to the full
    /// representable id space; directors narrow it to their protocol
    /// enum's count.
    pub command_id_limit: u16,
    /// Idle read timeout in milliseconds. `None` (the default) runs a
    /// connection until EOF, a socket error, or a protocol violation.
    pub read_timeout_ms: Option<u64>,
    /// Rolling cipher constants.
    pub cipher: CipherConfig,
    /// Write-queue policy.
    pub writer: WriterSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            buffer_mode: BufferMode::Standard,
            max_command_size: MAX_COMMAND_SIZE,
            command_id_limit: 0x4000,
            read_timeout_ms: None,
            cipher: CipherConfig::default(),
            writer: WriterSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Parse a configuration from a JSON document. Missing fields keep
    /// their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Idle read timeout as a `Duration`, if configured.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }
}
