//! # TideSync Crypto
//!
//! Account-scoped field encryption for TideSync.
//!
//! This crate implements the `FieldCipher` seam declared in
//! `tidesync_codec`:
//! - AES-256-GCM authenticated encryption per field value
//! - HKDF-SHA256 key derivation from account-scoped material
//! - A `KeyProvider` seam for the account/session collaborator, so key
//!   availability (device lock state) is observed per operation
//!
//! Keys are zeroized on drop and never leave the device.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cipher;
mod key;

pub use cipher::{
    AccountCipher, KeyProvider, ProviderCipher, StaticKeyProvider, NONCE_SIZE, TAG_SIZE,
};
pub use key::{AccountKey, KEY_SIZE};
