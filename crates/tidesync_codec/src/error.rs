//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding transport records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to encode a value to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// Float values are forbidden in canonical CBOR.
    #[error("float values are forbidden in canonical CBOR")]
    FloatForbidden,

    /// Integer does not fit the supported range.
    #[error("integer overflow")]
    IntegerOverflow,

    /// The bytes decoded to a structurally invalid record.
    #[error("invalid record structure: {message}")]
    InvalidStructure {
        /// Description of the structural error.
        message: String,
    },

    /// A field name is not usable as a transport key.
    #[error("invalid field name {name:?}: {message}")]
    InvalidFieldName {
        /// The offending name.
        name: String,
        /// Why it was rejected.
        message: String,
    },

    /// Unsupported CBOR construct (tags, indefinite lengths).
    #[error("unsupported CBOR construct: {construct}")]
    Unsupported {
        /// Name of the unsupported construct.
        construct: String,
    },
}

impl CodecError {
    /// Creates an encoding-failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Creates a decoding-failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid-structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    /// Creates an invalid-field-name error.
    pub fn invalid_field_name(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidFieldName {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates an unsupported-construct error.
    pub fn unsupported(construct: impl Into<String>) -> Self {
        Self::Unsupported {
            construct: construct.into(),
        }
    }
}
