//! Transport field values.

use sha2::{Digest, Sha256};
use std::cmp::Ordering;

/// A reference to a binary attachment stored outside the primary record.
///
/// Attachments (images, scans) are never inlined into a transport record.
/// The record carries the on-device relative path plus the SHA-256 content
/// address; the bytes travel as a separate content-addressed asset upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRef {
    /// Path of the attachment relative to the app's asset root.
    pub relative_path: String,
    /// Lowercase hex SHA-256 of the attachment bytes.
    pub sha256_hex: String,
    /// Size of the attachment in bytes.
    pub byte_len: u64,
}

impl AssetRef {
    /// Builds a reference by content-addressing the given bytes.
    pub fn from_bytes(relative_path: impl Into<String>, bytes: &[u8]) -> Self {
        use std::fmt::Write as _;

        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for b in digest {
            let _ = write!(hex, "{b:02x}");
        }
        Self {
            relative_path: relative_path.into(),
            sha256_hex: hex,
            byte_len: bytes.len() as u64,
        }
    }
}

/// A single transport field value.
///
/// Floats are intentionally unsupported: the canonical CBOR profile used on
/// the wire forbids them, and fractional domain quantities travel as
/// fixed-point integers chosen by the schema owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (full i64 range).
    Integer(i64),
    /// UTF-8 text.
    Text(String),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Array of values.
    Array(Vec<FieldValue>),
    /// String-keyed map, kept in canonical key order.
    Map(Vec<(String, FieldValue)>),
    /// Reference to an external content-addressed attachment.
    Asset(AssetRef),
}

impl FieldValue {
    /// Creates a map value with keys sorted into canonical CBOR order
    /// (length-first, then bytewise).
    pub fn map(mut pairs: Vec<(String, FieldValue)>) -> Self {
        pairs.sort_by(|a, b| cmp_canonical_key(&a.0, &b.0));
        FieldValue::Map(pairs)
    }

    /// Returns true for values the encryption policy treats as empty.
    ///
    /// Empty values are stored in plaintext form and never encrypted, so a
    /// reader cannot distinguish "empty" from "encrypted empty".
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.is_empty(),
            FieldValue::Bytes(b) => b.is_empty(),
            FieldValue::Array(a) => a.is_empty(),
            FieldValue::Map(m) => m.is_empty(),
            _ => false,
        }
    }

    /// Gets this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Gets this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Gets this value as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Gets this value as bytes, if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Gets this value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Gets this value as a map, if it is one.
    pub fn as_map(&self) -> Option<&[(String, FieldValue)]> {
        match self {
            FieldValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Gets this value as an asset reference, if it is one.
    pub fn as_asset(&self) -> Option<&AssetRef> {
        match self {
            FieldValue::Asset(a) => Some(a),
            _ => None,
        }
    }

    /// Collects every asset reference nested inside this value.
    pub fn collect_assets<'a>(&'a self, out: &mut Vec<&'a AssetRef>) {
        match self {
            FieldValue::Asset(a) => out.push(a),
            FieldValue::Array(items) => {
                for item in items {
                    item.collect_assets(out);
                }
            }
            FieldValue::Map(pairs) => {
                for (_, v) in pairs {
                    v.collect_assets(out);
                }
            }
            _ => {}
        }
    }
}

/// Canonical CBOR key ordering for string keys: shorter keys first, then
/// bytewise comparison of the UTF-8 bytes.
pub(crate) fn cmp_canonical_key(a: &str, b: &str) -> Ordering {
    match a.len().cmp(&b.len()) {
        Ordering::Equal => a.as_bytes().cmp(b.as_bytes()),
        ord => ord,
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Integer(n)
    }
}

impl From<i32> for FieldValue {
    fn from(n: i32) -> Self {
        FieldValue::Integer(i64::from(n))
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(b: Vec<u8>) -> Self {
        FieldValue::Bytes(b)
    }
}

impl From<AssetRef> for FieldValue {
    fn from(a: AssetRef) -> Self {
        FieldValue::Asset(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_keys_sorted_length_first() {
        let map = FieldValue::map(vec![
            ("notes".into(), FieldValue::Integer(1)),
            ("id".into(), FieldValue::Integer(2)),
            ("ab".into(), FieldValue::Integer(3)),
        ]);

        let pairs = map.as_map().unwrap();
        assert_eq!(pairs[0].0, "ab");
        assert_eq!(pairs[1].0, "id");
        assert_eq!(pairs[2].0, "notes");
    }

    #[test]
    fn emptiness_policy() {
        assert!(FieldValue::Null.is_empty());
        assert!(FieldValue::Text(String::new()).is_empty());
        assert!(FieldValue::Bytes(vec![]).is_empty());
        assert!(FieldValue::Array(vec![]).is_empty());
        assert!(!FieldValue::Bool(false).is_empty());
        assert!(!FieldValue::Integer(0).is_empty());
        assert!(!FieldValue::Text("x".into()).is_empty());
    }

    #[test]
    fn asset_ref_content_address() {
        let a = AssetRef::from_bytes("photos/dive-1.jpg", b"hello");
        let b = AssetRef::from_bytes("photos/dive-2.jpg", b"hello");
        assert_eq!(a.sha256_hex, b.sha256_hex);
        assert_eq!(a.byte_len, 5);
        assert_eq!(a.sha256_hex.len(), 64);

        let c = AssetRef::from_bytes("photos/dive-1.jpg", b"other");
        assert_ne!(a.sha256_hex, c.sha256_hex);
    }

    #[test]
    fn collect_assets_nested() {
        let asset = AssetRef::from_bytes("scans/card.png", b"png");
        let value = FieldValue::map(vec![
            (
                "attachments".into(),
                FieldValue::Array(vec![FieldValue::Asset(asset.clone())]),
            ),
            ("count".into(), FieldValue::Integer(1)),
        ]);

        let mut found = Vec::new();
        value.collect_assets(&mut found);
        assert_eq!(found, vec![&asset]);
    }

    #[test]
    fn accessors() {
        assert_eq!(FieldValue::Bool(true).as_bool(), Some(true));
        assert_eq!(FieldValue::Integer(7).as_integer(), Some(7));
        assert_eq!(FieldValue::from("hi").as_text(), Some("hi"));
        assert_eq!(
            FieldValue::Bytes(vec![1, 2]).as_bytes(),
            Some(&[1u8, 2][..])
        );
        assert_eq!(FieldValue::Integer(7).as_text(), None);
    }
}
