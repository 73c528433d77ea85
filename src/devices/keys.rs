//! Per-device symmetric key derivation.
//!
//! Keys are never stored. Each device derives its key at runtime from a
//! secret baked into the build and its factory-programmed unique
//! identifier, so two devices never share a backup key and a wiped device
//! recovers its own key unchanged.

pub const KEY_SIZE: usize = 16;
pub const DEVICE_ID_SIZE: usize = 8;

/// Symmetric backup key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Key(pub [u8; KEY_SIZE]);

// Keys are not printed.
impl core::fmt::Debug for Key {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result { f.write_str("Key(..)") }
}

/// Source of the backup key.
pub trait KeyProvider {
    fn key(&self) -> Key;
}

impl KeyProvider for Key {
    fn key(&self) -> Key { *self }
}

/// Key derived from a build secret and a hardware identifier.
pub struct DeviceKey {
    pub secret: [u8; KEY_SIZE],
    pub device_id: [u8; DEVICE_ID_SIZE],
}

impl KeyProvider for DeviceKey {
    fn key(&self) -> Key { derive_key(&self.secret, &self.device_id) }
}

/// Mixes the secret with the device identifier into a 16 byte key.
///
/// Deterministic and stateless. Every output byte depends on every byte of
/// the identifier after the diffusion rounds.
pub fn derive_key(secret: &[u8; KEY_SIZE], device_id: &[u8; DEVICE_ID_SIZE]) -> Key {
    let mut key = [0u8; KEY_SIZE];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = secret[i] ^ device_id[i % DEVICE_ID_SIZE].rotate_left((i / DEVICE_ID_SIZE) as u32 * 4);
    }

    const ROUNDS: usize = 4;
    for round in 0..ROUNDS {
        let mut carry = key[KEY_SIZE - 1];
        for (i, byte) in key.iter_mut().enumerate() {
            let mixed = byte.wrapping_add(carry).rotate_left(3) ^ (i as u8).wrapping_mul(0x9D) ^ round as u8;
            carry = mixed;
            *byte = mixed;
        }
    }
    Key(key)
}
