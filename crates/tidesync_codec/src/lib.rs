//! # TideSync Codec
//!
//! Transport record model and canonical CBOR codec for TideSync.
//!
//! This crate provides:
//! - `TransportRecord`, a fixed per-type transport representation
//! - Canonical CBOR encoding (deterministic bytes, no floats)
//! - Per-type schemas naming sensitive fields and merge behavior
//! - The `FieldCipher` seam and the sealing/unsealing `RecordCodec`
//! - Content-addressed asset references for binary attachments
//!
//! This is a pure data crate with no I/O and no cryptography; the concrete
//! cipher lives in `tidesync_crypto`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod cipher;
mod codec;
mod error;
mod record;
mod schema;
mod value;

pub use cbor::{from_cbor, to_canonical_cbor};
pub use cipher::{CipherError, CipherResult, FieldCipher, NullCipher};
pub use codec::{DecodedRecord, RecordCodec, SealedRecord};
pub use error::{CodecError, CodecResult};
pub use record::{RecordKey, TransportRecord, VersionToken, Zone};
pub use schema::{MergeStrategy, RecordSchema, SchemaRegistry};
pub use value::{AssetRef, FieldValue};
