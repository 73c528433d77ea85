//! Position-keyed stream cipher and backup integrity checksum.
//!
//! This is the legacy format 1 scheme: each byte is XORed with a keystream
//! byte that depends only on the key and the byte's offset from the start
//! of its slot. It hides firmware from casual inspection and detects
//! accidental corruption. It does not authenticate.
use super::keys::{Key, KEY_SIZE};
use crc::{crc32, Hasher32};

/// Keystream byte for an absolute slot offset.
fn keystream(key: &Key, position: u32) -> u8 {
    key.0[position as usize % KEY_SIZE].wrapping_add(position as u8) ^ (position >> 8) as u8
}

/// Encrypts `buffer` in place, `offset` being its position from the slot start.
pub fn encrypt(key: &Key, offset: u32, buffer: &mut [u8]) {
    buffer
        .iter_mut()
        .enumerate()
        .for_each(|(i, byte)| *byte ^= keystream(key, offset.wrapping_add(i as u32)));
}

/// Decrypts `buffer` in place. Same transform as [`encrypt`].
pub fn decrypt(key: &Key, offset: u32, buffer: &mut [u8]) { encrypt(key, offset, buffer) }

/// Running integrity checksum over ciphertext, finalised with the key.
pub struct IntegrityDigest {
    digest: crc32::Digest,
}

impl IntegrityDigest {
    pub fn new() -> Self { Self { digest: crc32::Digest::new(crc32::IEEE) } }

    pub fn update(&mut self, ciphertext: &[u8]) { self.digest.write(ciphertext); }

    pub fn finish(&self, key: &Key) -> u32 { self.digest.sum32() ^ crc32::checksum_ieee(&key.0) }
}

impl Default for IntegrityDigest {
    fn default() -> Self { Self::new() }
}

/// Integrity checksum of a complete ciphertext.
pub fn integrity(key: &Key, ciphertext: &[u8]) -> u32 {
    let mut digest = IntegrityDigest::new();
    digest.update(ciphertext);
    digest.finish(key)
}
