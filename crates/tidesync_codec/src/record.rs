//! Transport records and sync identity types.

use crate::cbor::{from_cbor, to_canonical_cbor};
use crate::error::{CodecError, CodecResult};
use crate::value::{AssetRef, FieldValue};
use std::collections::BTreeMap;
use std::fmt;

/// Reserved transport keys. Everything else in the top-level map is a field.
const KEY_TYPE: &str = "_type";
const KEY_ID: &str = "_id";
const KEY_MODIFIED: &str = "_modified";
const KEY_VERSION: &str = "_version";

/// A logical partition of synchronized data, one per account.
///
/// Zones scope records, the pending-operation log, and watermarks; no sync
/// state is ever shared across zones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Zone(String);

impl Zone {
    /// Creates a zone from its stable name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the zone name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a record target: type discriminator plus stable local id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    /// Stable type discriminator, used as the remote collection key.
    pub record_type: String,
    /// Stable primary key, identical locally and remotely.
    pub local_id: String,
}

impl RecordKey {
    /// Creates a record key.
    pub fn new(record_type: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            local_id: local_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.record_type, self.local_id)
    }
}

/// Opaque version token assigned by the remote store on every successful
/// write. Compared for equality only, never interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionToken(Vec<u8>);

impl VersionToken {
    /// Wraps raw token bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A fixed transport representation of one domain record.
///
/// Built from an explicit field table rather than a free-form dictionary:
/// metadata lives under reserved `_`-prefixed keys, everything else is a
/// named [`FieldValue`]. Encoding is canonical CBOR, so identical records
/// always produce identical bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRecord {
    record_type: String,
    local_id: String,
    updated_at: i64,
    version: Option<VersionToken>,
    fields: BTreeMap<String, FieldValue>,
}

impl TransportRecord {
    /// Creates an empty record.
    ///
    /// `updated_at` is the local-mutation time in unix milliseconds; it is
    /// set by the mutator and never touched by the codec.
    pub fn new(
        record_type: impl Into<String>,
        local_id: impl Into<String>,
        updated_at: i64,
    ) -> Self {
        Self {
            record_type: record_type.into(),
            local_id: local_id.into(),
            updated_at,
            version: None,
            fields: BTreeMap::new(),
        }
    }

    /// Returns the record type.
    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    /// Returns the local id.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Returns the target identity of this record.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.record_type.clone(), self.local_id.clone())
    }

    /// Returns the last local-mutation time in unix milliseconds.
    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    /// Sets the last local-mutation time.
    pub fn set_updated_at(&mut self, updated_at: i64) {
        self.updated_at = updated_at;
    }

    /// Returns the remote version token, if this record has been synced.
    pub fn version(&self) -> Option<&VersionToken> {
        self.version.as_ref()
    }

    /// Attaches a remote version token.
    pub fn set_version(&mut self, version: Option<VersionToken>) {
        self.version = version;
    }

    /// Sets a field value.
    ///
    /// Names starting with `_` are reserved for record metadata.
    pub fn set_field(
        &mut self,
        name: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> CodecResult<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(CodecError::invalid_field_name(name, "empty name"));
        }
        if name.starts_with('_') {
            return Err(CodecError::invalid_field_name(name, "reserved prefix"));
        }
        self.fields.insert(name, value.into());
        Ok(())
    }

    /// Returns a field value by name.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Removes a field, returning its previous value.
    pub fn remove_field(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    /// Returns true if the record carries the named field.
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Iterates over fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the number of fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Collects every asset reference carried by this record.
    pub fn asset_refs(&self) -> Vec<&AssetRef> {
        let mut out = Vec::new();
        for value in self.fields.values() {
            value.collect_assets(&mut out);
        }
        out
    }

    /// Encodes the record to canonical CBOR bytes.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let mut pairs: Vec<(String, FieldValue)> = vec![
            (KEY_TYPE.into(), FieldValue::from(self.record_type.clone())),
            (KEY_ID.into(), FieldValue::from(self.local_id.clone())),
            (KEY_MODIFIED.into(), FieldValue::Integer(self.updated_at)),
        ];
        if let Some(version) = &self.version {
            pairs.push((KEY_VERSION.into(), FieldValue::Bytes(version.0.clone())));
        }
        for (name, value) in &self.fields {
            pairs.push((name.clone(), value.clone()));
        }
        to_canonical_cbor(&FieldValue::map(pairs))
    }

    /// Decodes a record from canonical CBOR bytes.
    ///
    /// Unknown `_`-prefixed keys are ignored so newer writers stay readable.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let value = from_cbor(bytes)?;
        let Some(pairs) = value.as_map() else {
            return Err(CodecError::invalid_structure("record must be a map"));
        };

        let get = |name: &str| pairs.iter().find(|(k, _)| k == name).map(|(_, v)| v);

        let record_type = get(KEY_TYPE)
            .and_then(FieldValue::as_text)
            .ok_or_else(|| CodecError::invalid_structure("missing _type"))?
            .to_string();
        let local_id = get(KEY_ID)
            .and_then(FieldValue::as_text)
            .ok_or_else(|| CodecError::invalid_structure("missing _id"))?
            .to_string();
        let updated_at = get(KEY_MODIFIED)
            .and_then(FieldValue::as_integer)
            .ok_or_else(|| CodecError::invalid_structure("missing _modified"))?;
        let version = get(KEY_VERSION)
            .and_then(FieldValue::as_bytes)
            .map(|b| VersionToken::from_bytes(b.to_vec()));

        let mut fields = BTreeMap::new();
        for (name, value) in pairs {
            if !name.starts_with('_') {
                fields.insert(name.clone(), value.clone());
            }
        }

        Ok(Self {
            record_type,
            local_id,
            updated_at,
            version,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dive_log(id: &str, updated_at: i64) -> TransportRecord {
        let mut record = TransportRecord::new("DiveLog", id, updated_at);
        record.set_field("site", "Blue Hole").unwrap();
        record.set_field("depth_cm", 1830i64).unwrap();
        record
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut record = dive_log("d1", 1000);
        record.set_version(Some(VersionToken::from_bytes(vec![0, 0, 0, 7])));

        let bytes = record.encode().unwrap();
        let decoded = TransportRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn roundtrip_without_version() {
        let record = dive_log("d2", 5);
        let decoded = TransportRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded.version(), None);
        assert_eq!(decoded.field("site").and_then(FieldValue::as_text), Some("Blue Hole"));
    }

    #[test]
    fn reserved_field_names_rejected() {
        let mut record = dive_log("d3", 1);
        assert!(record.set_field("_secret", 1i64).is_err());
        assert!(record.set_field("", 1i64).is_err());
    }

    #[test]
    fn unknown_metadata_ignored_on_decode() {
        let mut pairs = vec![
            ("_type".to_string(), FieldValue::from("DiveLog")),
            ("_id".to_string(), FieldValue::from("d4")),
            ("_modified".to_string(), FieldValue::Integer(9)),
            ("_future".to_string(), FieldValue::Integer(1)),
            ("site".to_string(), FieldValue::from("Molokini")),
        ];
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        let bytes = crate::cbor::to_canonical_cbor(&FieldValue::map(pairs)).unwrap();

        let decoded = TransportRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.field_count(), 1);
        assert!(decoded.has_field("site"));
    }

    #[test]
    fn missing_metadata_rejected() {
        let bytes =
            crate::cbor::to_canonical_cbor(&FieldValue::map(vec![(
                "_id".to_string(),
                FieldValue::from("d5"),
            )]))
            .unwrap();
        assert!(TransportRecord::decode(&bytes).is_err());
    }

    #[test]
    fn identical_records_encode_identically() {
        let a = dive_log("d6", 77).encode().unwrap();
        let b = dive_log("d6", 77).encode().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn asset_refs_found_across_fields() {
        let mut record = dive_log("d7", 1);
        let photo = AssetRef::from_bytes("photos/eel.jpg", b"jpeg");
        record
            .set_field("photos", FieldValue::Array(vec![photo.clone().into()]))
            .unwrap();
        assert_eq!(record.asset_refs(), vec![&photo]);
    }

    #[test]
    fn record_key_display() {
        let key = RecordKey::new("DiveLog", "d8");
        assert_eq!(key.to_string(), "DiveLog/d8");
    }
}
