//! Protocol module - magic codec, rolling cipher, stream buffers, framing.
//!
//! This module implements the binary wire layer:
//! - Obfuscated 32-bit header ("magic") encoding/decoding
//! - Per-connection rolling XOR cipher
//! - Bounded read/write cursor for payload serialization
//! - Frame decoder accumulating partial reads

pub mod cipher;
mod decoder;
mod magic;
mod stream;

pub use cipher::RollingCipher;
pub use decoder::{FrameDecoder, FrameLimits, InboundFrame};
pub use magic::{
    decode_magic, encode_magic, CommandId, MessageHeader, BUFFER_SIZE, JUMBO_BUFFER_SIZE,
    MAGIC_SIZE, MAX_COMMAND_SIZE, MAX_PAYLOAD,
};
pub use stream::{StreamBuffer, WireDecode, WireEncode};
