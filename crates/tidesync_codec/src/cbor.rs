//! Canonical CBOR encoding for transport values.
//!
//! Encoding is deterministic: map keys are sorted (length-first, then
//! bytewise), integers take their shortest form, and all lengths are
//! definite. Identical values always produce identical bytes, which is what
//! makes queue persistence bit-for-bit stable and record hashing meaningful.
//!
//! Floats and CBOR tags are rejected in both directions.

use crate::error::{CodecError, CodecResult};
use crate::value::{cmp_canonical_key, AssetRef, FieldValue};
use ciborium::value::Value as Cbor;

/// Marker key identifying an asset-reference map on the wire.
const ASSET_KIND_KEY: &str = "_kind";
const ASSET_KIND: &str = "asset";

/// Encodes a value to canonical CBOR bytes.
pub fn to_canonical_cbor(value: &FieldValue) -> CodecResult<Vec<u8>> {
    let cbor = to_cbor_value(value)?;
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&cbor, &mut buf)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buf)
}

/// Decodes a value from CBOR bytes.
pub fn from_cbor(bytes: &[u8]) -> CodecResult<FieldValue> {
    let cbor: Cbor = ciborium::de::from_reader(bytes)
        .map_err(|e| CodecError::decoding_failed(e.to_string()))?;
    from_cbor_value(cbor)
}

fn to_cbor_value(value: &FieldValue) -> CodecResult<Cbor> {
    Ok(match value {
        FieldValue::Null => Cbor::Null,
        FieldValue::Bool(b) => Cbor::Bool(*b),
        FieldValue::Integer(n) => Cbor::Integer((*n).into()),
        FieldValue::Text(s) => Cbor::Text(s.clone()),
        FieldValue::Bytes(b) => Cbor::Bytes(b.clone()),
        FieldValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(to_cbor_value(item)?);
            }
            Cbor::Array(out)
        }
        FieldValue::Map(pairs) => encode_map(pairs)?,
        FieldValue::Asset(asset) => {
            let len = i64::try_from(asset.byte_len).map_err(|_| CodecError::IntegerOverflow)?;
            encode_map(&[
                (ASSET_KIND_KEY.to_string(), FieldValue::from(ASSET_KIND)),
                ("path".to_string(), FieldValue::from(asset.relative_path.clone())),
                ("sha256".to_string(), FieldValue::from(asset.sha256_hex.clone())),
                ("size".to_string(), FieldValue::Integer(len)),
            ])?
        }
    })
}

fn encode_map(pairs: &[(String, FieldValue)]) -> CodecResult<Cbor> {
    let mut sorted: Vec<&(String, FieldValue)> = pairs.iter().collect();
    sorted.sort_by(|a, b| cmp_canonical_key(&a.0, &b.0));

    let mut out = Vec::with_capacity(sorted.len());
    for (key, value) in sorted {
        out.push((Cbor::Text(key.clone()), to_cbor_value(value)?));
    }
    Ok(Cbor::Map(out))
}

fn from_cbor_value(cbor: Cbor) -> CodecResult<FieldValue> {
    Ok(match cbor {
        Cbor::Null => FieldValue::Null,
        Cbor::Bool(b) => FieldValue::Bool(b),
        Cbor::Integer(n) => {
            FieldValue::Integer(i64::try_from(n).map_err(|_| CodecError::IntegerOverflow)?)
        }
        Cbor::Text(s) => FieldValue::Text(s),
        Cbor::Bytes(b) => FieldValue::Bytes(b),
        Cbor::Float(_) => return Err(CodecError::FloatForbidden),
        Cbor::Tag(tag, _) => return Err(CodecError::unsupported(format!("tag {tag}"))),
        Cbor::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_cbor_value(item)?);
            }
            FieldValue::Array(out)
        }
        Cbor::Map(pairs) => {
            let mut out = Vec::with_capacity(pairs.len());
            for (key, value) in pairs {
                let Cbor::Text(key) = key else {
                    return Err(CodecError::invalid_structure("map keys must be text"));
                };
                out.push((key, from_cbor_value(value)?));
            }
            if let Some(asset) = decode_asset(&out)? {
                FieldValue::Asset(asset)
            } else {
                FieldValue::map(out)
            }
        }
        // `ciborium::value::Value` is non-exhaustive.
        other => {
            return Err(CodecError::unsupported(format!(
                "unsupported CBOR value {other:?}"
            )))
        }
    })
}

/// Recognizes the asset-reference wire shape among decoded maps.
fn decode_asset(pairs: &[(String, FieldValue)]) -> CodecResult<Option<AssetRef>> {
    let kind = pairs
        .iter()
        .find(|(k, _)| k == ASSET_KIND_KEY)
        .and_then(|(_, v)| v.as_text());
    if kind != Some(ASSET_KIND) {
        return Ok(None);
    }

    let get = |name: &str| pairs.iter().find(|(k, _)| k == name).map(|(_, v)| v);

    let path = get("path")
        .and_then(FieldValue::as_text)
        .ok_or_else(|| CodecError::invalid_structure("asset missing path"))?;
    let sha256 = get("sha256")
        .and_then(FieldValue::as_text)
        .ok_or_else(|| CodecError::invalid_structure("asset missing sha256"))?;
    let size = get("size")
        .and_then(FieldValue::as_integer)
        .ok_or_else(|| CodecError::invalid_structure("asset missing size"))?;

    Ok(Some(AssetRef {
        relative_path: path.to_string(),
        sha256_hex: sha256.to_string(),
        byte_len: u64::try_from(size).map_err(|_| CodecError::IntegerOverflow)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_scalars() {
        for value in [
            FieldValue::Null,
            FieldValue::Bool(true),
            FieldValue::Bool(false),
            FieldValue::Integer(0),
            FieldValue::Integer(-42),
            FieldValue::Integer(i64::MAX),
            FieldValue::Text("saw turtles".into()),
            FieldValue::Bytes(vec![0xCA, 0xFE]),
        ] {
            let bytes = to_canonical_cbor(&value).unwrap();
            assert_eq!(from_cbor(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn roundtrip_nested() {
        let value = FieldValue::map(vec![
            (
                "buddies".into(),
                FieldValue::Array(vec![FieldValue::from("ana"), FieldValue::from("kim")]),
            ),
            ("depth_cm".into(), FieldValue::Integer(1830)),
        ]);
        let bytes = to_canonical_cbor(&value).unwrap();
        assert_eq!(from_cbor(&bytes).unwrap(), value);
    }

    #[test]
    fn roundtrip_asset() {
        let value = FieldValue::Asset(AssetRef::from_bytes("photos/reef.jpg", b"jpeg"));
        let bytes = to_canonical_cbor(&value).unwrap();
        assert_eq!(from_cbor(&bytes).unwrap(), value);
    }

    #[test]
    fn deterministic_map_encoding() {
        let a = FieldValue::map(vec![
            ("zz".into(), FieldValue::Integer(1)),
            ("a".into(), FieldValue::Integer(2)),
        ]);
        let b = FieldValue::map(vec![
            ("a".into(), FieldValue::Integer(2)),
            ("zz".into(), FieldValue::Integer(1)),
        ]);
        assert_eq!(
            to_canonical_cbor(&a).unwrap(),
            to_canonical_cbor(&b).unwrap()
        );
    }

    #[test]
    fn float_rejected_on_decode() {
        // 0xf9 0x3c 0x00 is the half-precision float 1.0
        let err = from_cbor(&[0xf9, 0x3c, 0x00]).unwrap_err();
        assert_eq!(err, CodecError::FloatForbidden);
    }

    #[test]
    fn non_text_map_key_rejected() {
        // {1: 2}
        let err = from_cbor(&[0xa1, 0x01, 0x02]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidStructure { .. }));
    }

    #[test]
    fn truncated_input_rejected() {
        let bytes = to_canonical_cbor(&FieldValue::Text("abcdef".into())).unwrap();
        assert!(from_cbor(&bytes[..bytes.len() - 2]).is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn scalar() -> impl Strategy<Value = FieldValue> {
            prop_oneof![
                Just(FieldValue::Null),
                any::<bool>().prop_map(FieldValue::Bool),
                any::<i64>().prop_map(FieldValue::Integer),
                ".*".prop_map(FieldValue::Text),
                proptest::collection::vec(any::<u8>(), 0..64).prop_map(FieldValue::Bytes),
            ]
        }

        proptest! {
            #[test]
            fn scalar_roundtrip(value in scalar()) {
                let bytes = to_canonical_cbor(&value).unwrap();
                prop_assert_eq!(from_cbor(&bytes).unwrap(), value);
            }

            #[test]
            fn encoding_is_deterministic(value in scalar()) {
                let a = to_canonical_cbor(&value).unwrap();
                let b = to_canonical_cbor(&value).unwrap();
                prop_assert_eq!(a, b);
            }
        }
    }
}
