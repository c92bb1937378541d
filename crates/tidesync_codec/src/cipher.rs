//! Field-encryption seam.
//!
//! The codec encrypts and decrypts individual field values through this
//! trait; the concrete AES-GCM implementation lives in `tidesync_crypto` so
//! this crate stays free of cryptography dependencies.

use thiserror::Error;

/// Result type for field cipher operations.
pub type CipherResult<T> = Result<T, CipherError>;

/// Errors surfaced by a field cipher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Key material is not currently available (device locked, key not yet
    /// provisioned). Recoverable: the caller defers the field rather than
    /// aborting the record.
    #[error("key material unavailable")]
    KeyUnavailable,

    /// The ciphertext failed authentication or is malformed. Fatal for the
    /// field only; the record still syncs with the field surfaced as empty.
    #[error("corrupt ciphertext")]
    CorruptCiphertext,

    /// Any other cipher failure.
    #[error("cipher failure: {0}")]
    Failed(String),
}

/// Symmetric encryption of individual field values.
///
/// Implementations derive their key from account-scoped material; the key
/// itself never appears in a transport record.
pub trait FieldCipher: Send + Sync {
    /// Encrypts a plaintext field value.
    fn encrypt(&self, plaintext: &[u8]) -> CipherResult<Vec<u8>>;

    /// Decrypts a ciphertext produced by [`encrypt`](Self::encrypt).
    fn decrypt(&self, ciphertext: &[u8]) -> CipherResult<Vec<u8>>;
}

/// A cipher for devices holding no key material at all.
///
/// Every operation reports [`CipherError::KeyUnavailable`], which makes
/// encrypted fields defer while plaintext fields keep syncing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCipher;

impl FieldCipher for NullCipher {
    fn encrypt(&self, _plaintext: &[u8]) -> CipherResult<Vec<u8>> {
        Err(CipherError::KeyUnavailable)
    }

    fn decrypt(&self, _ciphertext: &[u8]) -> CipherResult<Vec<u8>> {
        Err(CipherError::KeyUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_cipher_always_defers() {
        assert_eq!(
            NullCipher.encrypt(b"notes").unwrap_err(),
            CipherError::KeyUnavailable
        );
        assert_eq!(
            NullCipher.decrypt(b"junk").unwrap_err(),
            CipherError::KeyUnavailable
        );
    }
}
