//! Placeholder cipher for the in-memory log.
//!
//! [`StubCipher`] XORs values with a keystream derived from the database's
//! key material and prefixes a tag so foreign ciphertext is detected. It is
//! **not cryptographically secure**. It only guarantees that sealed bytes
//! differ from the plaintext and that the wrong key fails to open them.

use super::{AtRestCipher, CryptoError};

/// Method name of the placeholder cipher.
pub const STUB_METHOD: &str = "stub-xor";

const TAG_LEN: usize = 4;

/// Repeating-key XOR cipher keyed per database.
#[derive(Debug, Clone)]
pub struct StubCipher {
    key: [u8; 32],
}

impl StubCipher {
    /// Derives a key from `key_material`.
    #[must_use]
    pub fn new(key_material: &str) -> Self {
        let mut key = [0x5Au8; 32];
        for (i, byte) in key_material.bytes().enumerate() {
            let slot = i % key.len();
            key[slot] = key[slot].rotate_left(3) ^ byte;
        }
        // Keep every key byte non-zero so sealing always changes the input.
        for byte in &mut key {
            if *byte == 0 {
                *byte = 0xA5;
            }
        }
        Self { key }
    }

    fn tag(&self) -> [u8; TAG_LEN] {
        [self.key[0], self.key[7], self.key[15], self.key[31]]
    }

    fn xor(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, byte)| byte ^ self.key[i % self.key.len()])
            .collect()
    }
}

impl AtRestCipher for StubCipher {
    fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(TAG_LEN + plaintext.len());
        out.extend_from_slice(&self.tag());
        out.extend(self.xor(plaintext));
        out
    }

    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let Some((tag, body)) = ciphertext.split_first_chunk::<TAG_LEN>() else {
            return Err(CryptoError::DecryptionFailed("ciphertext too short".to_string()));
        };
        if *tag != self.tag() {
            return Err(CryptoError::DecryptionFailed("key tag mismatch".to_string()));
        }
        Ok(self.xor(body))
    }
}
