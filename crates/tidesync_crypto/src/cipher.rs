//! AES-256-GCM field cipher.

use crate::key::AccountKey;
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use parking_lot::Mutex;
use rand::RngCore;
use std::sync::Arc;
use tidesync_codec::{CipherError, CipherResult, FieldCipher};

/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Field cipher bound to one account key.
///
/// Ciphertext layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
pub struct AccountCipher {
    cipher: Aes256Gcm,
}

impl AccountCipher {
    /// Creates a cipher from an account key.
    pub fn new(key: &AccountKey) -> Self {
        let key_array = GenericArray::from_slice(key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(key_array),
        }
    }
}

impl FieldCipher for AccountCipher {
    fn encrypt(&self, plaintext: &[u8]) -> CipherResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CipherError::Failed("AES-GCM encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend(ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> CipherResult<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CipherError::CorruptCiphertext);
        }

        let nonce = Nonce::from_slice(&ciphertext[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &ciphertext[NONCE_SIZE..])
            .map_err(|_| CipherError::CorruptCiphertext)
    }
}

impl std::fmt::Debug for AccountCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountCipher")
            .field("cipher", &"Aes256Gcm")
            .finish()
    }
}

/// Source of the current account key.
///
/// Implemented by the account/session collaborator. `current_key` returns
/// `None` while the device is locked or the key has not been provisioned;
/// the cipher maps that to a recoverable deferral, never an abort.
pub trait KeyProvider: Send + Sync {
    /// Returns the account key, if currently available.
    fn current_key(&self) -> Option<AccountKey>;
}

/// A field cipher that resolves its key through a [`KeyProvider`] on every
/// operation, so lock/unlock transitions take effect immediately.
pub struct ProviderCipher<P: KeyProvider> {
    provider: P,
}

impl<P: KeyProvider> ProviderCipher<P> {
    /// Creates a cipher over the given provider.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

impl<P: KeyProvider> FieldCipher for ProviderCipher<P> {
    fn encrypt(&self, plaintext: &[u8]) -> CipherResult<Vec<u8>> {
        let key = self.provider.current_key().ok_or(CipherError::KeyUnavailable)?;
        AccountCipher::new(&key).encrypt(plaintext)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> CipherResult<Vec<u8>> {
        let key = self.provider.current_key().ok_or(CipherError::KeyUnavailable)?;
        AccountCipher::new(&key).decrypt(ciphertext)
    }
}

/// A key provider holding an explicitly settable key.
///
/// Useful in tests and in hosts that manage key lifecycle themselves.
#[derive(Default, Clone)]
pub struct StaticKeyProvider {
    key: Arc<Mutex<Option<AccountKey>>>,
}

impl StaticKeyProvider {
    /// Creates a provider with no key.
    pub fn locked() -> Self {
        Self::default()
    }

    /// Creates a provider holding the given key.
    pub fn with_key(key: AccountKey) -> Self {
        Self {
            key: Arc::new(Mutex::new(Some(key))),
        }
    }

    /// Installs a key, as when the device unlocks.
    pub fn set_key(&self, key: AccountKey) {
        *self.key.lock() = Some(key);
    }

    /// Removes the key, as when the device locks.
    pub fn clear_key(&self) {
        *self.key.lock() = None;
    }
}

impl KeyProvider for StaticKeyProvider {
    fn current_key(&self) -> Option<AccountKey> {
        self.key.lock().clone()
    }
}
