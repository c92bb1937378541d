//! Account-scoped key material.

use tidesync_codec::{CipherError, CipherResult};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// HKDF info string binding derived keys to this use.
const FIELD_KEY_INFO: &[u8] = b"tidesync-field-key-v1";

/// Symmetric key scoped to one account.
///
/// Derived deterministically from account key material; zeroized on drop.
/// The key is never transmitted and never stored in a transport record.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AccountKey {
    bytes: [u8; KEY_SIZE],
}

impl AccountKey {
    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> CipherResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CipherError::Failed(format!(
                "key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    /// Derives the field-encryption key for an account.
    ///
    /// Derivation is HKDF-SHA256 with the account id as salt, so the same
    /// secret yields the same key on every device of the account and a
    /// different key for every account.
    pub fn derive(account_secret: &[u8], account_id: &str) -> CipherResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(account_id.as_bytes()), account_secret);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(FIELD_KEY_INFO, &mut bytes)
            .map_err(|_| CipherError::Failed("HKDF expand failed".into()))?;
        Ok(Self { bytes })
    }

    /// Returns the key bytes. Do not log or serialize the result.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = AccountKey::derive(b"secret material", "acct-1").unwrap();
        let b = AccountKey::derive(b"secret material", "acct-1").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn derivation_is_account_scoped() {
        let a = AccountKey::derive(b"secret material", "acct-1").unwrap();
        let b = AccountKey::derive(b"secret material", "acct-2").unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());

        let c = AccountKey::derive(b"other material", "acct-1").unwrap();
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn wrong_size_rejected() {
        assert!(AccountKey::from_bytes(&[0u8; 16]).is_err());
        assert!(AccountKey::from_bytes(&[0u8; 64]).is_err());
        assert!(AccountKey::from_bytes(&[7u8; 32]).is_ok());
    }

    #[test]
    fn debug_redacts_key() {
        let key = AccountKey::derive(b"secret", "acct").unwrap();
        let printed = format!("{key:?}");
        assert!(printed.contains("REDACTED"));
    }
}
