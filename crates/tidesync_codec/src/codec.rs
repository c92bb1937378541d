//! The record codec: seals and unseals sensitive fields.
//!
//! Sealing moves each non-empty sensitive field value under a distinct
//! `<name>Encrypted` transport key (ciphertext bytes), omitting the
//! plaintext key entirely. Empty values are never encrypted, uniformly, so
//! ciphertext presence never leaks whether an empty value was set.
//!
//! Unsealing tolerates records written without a cipher (plaintext key only)
//! and records read without usable key material: in the latter case the
//! field surfaces as absent and is reported, never thrown.

use crate::cbor::{from_cbor, to_canonical_cbor};
use crate::cipher::{CipherError, FieldCipher};
use crate::error::{CodecError, CodecResult};
use crate::record::TransportRecord;
use crate::schema::SchemaRegistry;
use crate::value::FieldValue;

/// Transport-key suffix for sealed fields.
const ENCRYPTED_SUFFIX: &str = "Encrypted";

/// Result of sealing a record for transport.
#[derive(Debug, Clone)]
pub struct SealedRecord {
    /// The transport form; sensitive fields are ciphertext.
    pub record: TransportRecord,
    /// Sensitive fields that could not be sealed because key material is
    /// unavailable. Their values are omitted from `record` entirely.
    pub deferred: Vec<String>,
}

impl SealedRecord {
    /// Returns true if every sensitive field was sealed.
    pub fn is_complete(&self) -> bool {
        self.deferred.is_empty()
    }
}

/// Result of unsealing a fetched record.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    /// The plaintext form; unreadable sensitive fields are absent.
    pub record: TransportRecord,
    /// Fields skipped because key material is unavailable (recoverable).
    pub deferred: Vec<String>,
    /// Fields dropped because their ciphertext failed authentication.
    pub corrupt: Vec<String>,
}

impl DecodedRecord {
    /// Wraps a record that needed no unsealing.
    pub fn clean(record: TransportRecord) -> Self {
        Self {
            record,
            deferred: Vec::new(),
            corrupt: Vec::new(),
        }
    }

    /// Returns true if every field decoded successfully.
    pub fn is_clean(&self) -> bool {
        self.deferred.is_empty() && self.corrupt.is_empty()
    }
}

/// Converts records between their plaintext and transport forms.
pub struct RecordCodec {
    registry: SchemaRegistry,
}

impl RecordCodec {
    /// Creates a codec over the given schema registry.
    pub fn new(registry: SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Returns the schema registry.
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Seals a plaintext record for transport.
    pub fn encode(
        &self,
        record: &TransportRecord,
        cipher: &dyn FieldCipher,
    ) -> CodecResult<SealedRecord> {
        let Some(schema) = self.registry.get(record.record_type()) else {
            return Ok(SealedRecord {
                record: record.clone(),
                deferred: Vec::new(),
            });
        };

        let mut sealed = record.clone();
        let mut deferred = Vec::new();

        for name in schema.encrypted_fields() {
            let Some(value) = sealed.field(name) else {
                continue;
            };
            if value.is_empty() {
                // Empty values stay plaintext by policy.
                continue;
            }

            let plaintext = to_canonical_cbor(value)?;
            match cipher.encrypt(&plaintext) {
                Ok(ciphertext) => {
                    sealed.remove_field(name);
                    sealed.set_field(
                        format!("{name}{ENCRYPTED_SUFFIX}"),
                        FieldValue::Bytes(ciphertext),
                    )?;
                }
                Err(CipherError::KeyUnavailable) => {
                    // Plaintext must not travel; the field is dropped from
                    // the transport form and reported for a later retry.
                    sealed.remove_field(name);
                    deferred.push(name.to_string());
                }
                Err(e) => {
                    return Err(CodecError::encoding_failed(format!(
                        "sealing field {name}: {e}"
                    )));
                }
            }
        }

        Ok(SealedRecord {
            record: sealed,
            deferred,
        })
    }

    /// Unseals a fetched transport record.
    ///
    /// Field-level cipher failures degrade to absence and are reported in
    /// the outcome; they never fail the record.
    pub fn decode(
        &self,
        record: &TransportRecord,
        cipher: &dyn FieldCipher,
    ) -> CodecResult<DecodedRecord> {
        let Some(schema) = self.registry.get(record.record_type()) else {
            return Ok(DecodedRecord::clean(record.clone()));
        };

        let mut plain = record.clone();
        let mut deferred = Vec::new();
        let mut corrupt = Vec::new();

        for name in schema.encrypted_fields() {
            let transport_key = format!("{name}{ENCRYPTED_SUFFIX}");
            let Some(sealed_value) = plain.remove_field(&transport_key) else {
                // Written without a cipher: the plaintext key, if present,
                // is already in usable form.
                continue;
            };

            let Some(ciphertext) = sealed_value.as_bytes() else {
                corrupt.push(name.to_string());
                continue;
            };

            match cipher.decrypt(ciphertext) {
                Ok(plaintext) => match from_cbor(&plaintext) {
                    Ok(value) => {
                        plain.set_field(name, value)?;
                    }
                    Err(_) => corrupt.push(name.to_string()),
                },
                Err(CipherError::KeyUnavailable) => deferred.push(name.to_string()),
                Err(CipherError::CorruptCiphertext) | Err(CipherError::Failed(_)) => {
                    corrupt.push(name.to_string());
                }
            }
        }

        Ok(DecodedRecord {
            record: plain,
            deferred,
            corrupt,
        })
    }
}
