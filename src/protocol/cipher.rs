//! Rolling XOR cipher for inbound payload de-obfuscation.
//!
//! Each connection owns one cipher. The 4-byte key is the little-endian
//! image of a 32-bit linear congruential state; client and server must
//! start from the same seed and roll in lockstep or payloads become
//! unrecoverable garbage. The key advances once per frame, including
//! payload-less frames.

use crate::config::CipherConfig;

/// Default LCG multiplier. The wire format pins the increment but leaves
/// the multiplier to deployment; see DESIGN.md for the default chosen here.
pub const XOR_MULTIPLIER: u32 = 0x41C6_4E6D;

/// LCG increment, `{0xCB, 0x91, 0x01, 0xA2}` read as little-endian u32.
pub const XOR_CONTROL: u32 = 0xA201_91CB;

/// Per-connection keystream generator.
///
/// Only inbound payloads pass through the cipher; the outbound path writes
/// plaintext frames. The asymmetry is part of the wire protocol.
#[derive(Debug, Clone)]
pub struct RollingCipher {
    code: u32,
    multiplier: u32,
    control: u32,
}

impl RollingCipher {
    /// Create a cipher in the state a fresh connection uses: reset, then
    /// rolled once so the first frame already has a non-trivial key.
    pub fn new(config: &CipherConfig) -> Self {
        let mut cipher = Self {
            code: 0,
            multiplier: config.multiplier,
            control: config.control,
        };
        cipher.reset();
        cipher.roll();
        cipher
    }

    /// Return the state to the seed value.
    pub fn reset(&mut self) {
        self.code = 0;
    }

    /// Advance the keystream by one frame.
    pub fn roll(&mut self) {
        self.code = self.code.wrapping_mul(self.multiplier).wrapping_add(self.control);
    }

    /// XOR `buffer` in place with the current 4-byte key, repeated
    /// cyclically. Applying twice with the same (unrolled) key is the
    /// identity; an empty buffer is a no-op.
    pub fn apply(&self, buffer: &mut [u8]) {
        let key = self.code.to_le_bytes();
        for (i, byte) in buffer.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    /// Current key bytes, little-endian.
    #[cfg(test)]
    pub(crate) fn key(&self) -> [u8; 4] {
        self.code.to_le_bytes()
    }
}

impl Default for RollingCipher {
    fn default() -> Self {
        Self::new(&CipherConfig::default())
    }
}
