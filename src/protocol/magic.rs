//! Obfuscated message header ("magic") encoding and decoding.
//!
//! Every frame begins with a 4-byte little-endian value packing a 14-bit
//! command id and a 12-bit payload length through a fixed bit-rearrangement:
//!
//! ```text
//! ┌────────────────────┬────────────────────┐
//! │ scrambled id word  │ scrambled length   │
//! │ high 16 bits       │ low 16 bits        │
//! └────────────────────┴────────────────────┘
//! ```
//!
//! The high word is the low word XORed with `0x4000 | id`, so neither half
//! is meaningful on its own. The scheme is bit-exact and brittle; the known
//! vector `encode({7, 29}) == 0x8D06CD01` is pinned in the tests below.

use std::fmt;

/// Size of the encoded magic on the wire.
pub const MAGIC_SIZE: usize = 4;

/// Frame buffer size in standard mode; also baked into the length word
/// during encoding.
pub const BUFFER_SIZE: usize = 4096;

/// Maximum payload bytes a frame buffer can carry (buffer minus magic).
pub const MAX_PAYLOAD: u16 = 4092;

/// Frame buffer size in jumbo mode.
pub const JUMBO_BUFFER_SIZE: usize = 16384;

/// Server-enforced ceiling on a decoded payload length.
pub const MAX_COMMAND_SIZE: u16 = 2048;

/// A 16-bit value identifying a message type within the protocol.
///
/// The magic encoding can only carry 14 bits; ids above `0x3FFF` are not
/// representable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u16);

impl CommandId {
    /// Largest id the magic encoding can round-trip.
    pub const MAX: CommandId = CommandId(0x3FFF);
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl From<u16> for CommandId {
    fn from(raw: u16) -> Self {
        CommandId(raw)
    }
}

/// Logical, pre-obfuscation view of a frame header.
///
/// `length` counts the payload bytes that follow the magic, not the magic
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Command id, `0..=0x3FFF`.
    pub id: CommandId,
    /// Payload byte length, at most [`MAX_PAYLOAD`].
    pub length: u16,
}

impl MessageHeader {
    /// Create a new header.
    pub fn new(id: CommandId, length: u16) -> Self {
        Self { id, length }
    }
}

/// Encode a header into its 32-bit wire representation.
///
/// Inverse of [`decode_magic`] for all headers with `length < 0x1000`.
///
/// # Example
///
/// ```
/// use ranchwire::protocol::{encode_magic, CommandId, MessageHeader};
///
/// let magic = encode_magic(&MessageHeader::new(CommandId(7), 29));
/// assert_eq!(magic, 0x8D06_CD01);
/// ```
pub fn encode_magic(header: &MessageHeader) -> u32 {
    let id_part = 0x4000u32 | u32::from(header.id.0);
    let length_word = ((BUFFER_SIZE as u32) << 16) | u32::from(header.length);

    let mut e = length_word;
    e = ((e & 0x3FFF) | (e << 14)) & 0xFFFF;
    e = ((((e & 0xF) | 0xFF80) << 8) | ((length_word >> 4) & 0xFF) | (e & 0xF000)) & 0xFFFF;

    e | ((e ^ id_part) << 16)
}

/// Decode a 32-bit wire value back into a [`MessageHeader`].
///
/// When bit 15 of the low word is clear the length stays at zero; that
/// branch is a deliberate edge of the encoding, not a fallback.
pub fn decode_magic(value: u32) -> MessageHeader {
    let mut length = 0u16;
    if value & 0x8000 != 0 {
        let section = (value & 0x3FFF) as u16;
        length = (((value & 0xFF) as u16) << 4) | ((section >> 8) & 0xF) | (section & 0xF000);
    }

    let a = (value & 0xFFFF) as u16;
    let b = ((value >> 16) & 0xFFFF) as u16;
    let x = a ^ b;
    let id = x & !(x & 0xC000);

    MessageHeader {
        id: CommandId(id),
        length,
    }
}
