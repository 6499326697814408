//! At-rest encryption for list databases.
//!
//! A database opened with encryption enabled passes every value through an
//! [`AtRestCipher`] before it reaches storage. The cipher is the only place
//! that sees plaintext bytes on the write path; everything below it stores
//! ciphertext.

pub mod stub;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The configured method is not supported.
    #[error("unsupported encryption method: {0}")]
    UnsupportedMethod(String),

    /// Decryption failed (corrupted ciphertext, wrong key, or tampered data).
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Seals and opens stored values.
pub trait AtRestCipher: Send + Sync {
    /// Encrypts `plaintext`. The output must differ from the input for any
    /// non-empty input.
    fn seal(&self, plaintext: &[u8]) -> Vec<u8>;

    /// Recovers the plaintext.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if `ciphertext` was not
    /// produced by this cipher.
    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Builds the cipher for `method`.
///
/// # Errors
///
/// Returns [`CryptoError::UnsupportedMethod`] for methods this build does
/// not know. Only the keyed stand-in is available, so a record naming a real
/// algorithm such as `aes-gcm` is refused rather than silently downgraded.
pub fn cipher_for(method: Option<&str>, key_material: &str) -> Result<stub::StubCipher, CryptoError> {
    match method.unwrap_or(stub::STUB_METHOD) {
        stub::STUB_METHOD => Ok(stub::StubCipher::new(key_material)),
        other => Err(CryptoError::UnsupportedMethod(other.to_string())),
    }
}
