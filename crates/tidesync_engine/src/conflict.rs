//! Automatic conflict resolution.
//!
//! Invoked only when a push reports that the remote version token advanced
//! past the one the local mutation was based on. Resolution is silent:
//! conflicts never surface as user-facing errors.

use crate::error::SyncResult;
use std::collections::BTreeSet;
use std::sync::Arc;
use tidesync_codec::{
    to_canonical_cbor, CodecResult, DecodedRecord, FieldCipher, MergeStrategy, RecordCodec,
    TransportRecord,
};

/// Outcome of resolving one conflict.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The local mutation wins. The winner carries the remote's newest
    /// version token and must be re-pushed as a forced overwrite.
    LocalWins(TransportRecord),
    /// The remote copy wins. The local store is overwritten with it and the
    /// pending operation is dropped.
    RemoteWins(DecodedRecord),
    /// A field-level merge of both sides. Applied like a remote win.
    Merged(DecodedRecord),
}

impl Resolution {
    /// Returns the winning record.
    pub fn winner(&self) -> &TransportRecord {
        match self {
            Resolution::LocalWins(record) => record,
            Resolution::RemoteWins(decoded) | Resolution::Merged(decoded) => &decoded.record,
        }
    }
}

/// Resolves version conflicts between a local mutation and the current
/// authoritative record.
pub struct ConflictResolver {
    codec: Arc<RecordCodec>,
}

impl ConflictResolver {
    /// Creates a resolver over the shared codec.
    pub fn new(codec: Arc<RecordCodec>) -> Self {
        Self { codec }
    }

    /// Resolves a conflict.
    ///
    /// `local` is the plaintext snapshot from the pending operation;
    /// `remote` is the authoritative transport record reported by the
    /// conflict, unsealed here with `cipher`.
    ///
    /// Default policy is last-write-wins on `updated_at`: the strictly
    /// later local mutation wins, ties prefer the remote copy so two
    /// devices cannot oscillate. Types that declare field-level merge get
    /// a commutative, idempotent per-field merge instead; if the remote's
    /// sensitive fields cannot be read (no key material), the merge
    /// degrades to last-write-wins rather than merging blindly.
    ///
    /// In every outcome the winner's `updated_at` is at least
    /// `max(local, remote)`.
    pub fn resolve(
        &self,
        local: &TransportRecord,
        remote: &TransportRecord,
        cipher: &dyn FieldCipher,
    ) -> SyncResult<Resolution> {
        let decoded = self.codec.decode(remote, cipher)?;

        if self.codec.registry().merge_strategy(local.record_type()) == MergeStrategy::FieldMerge
            && decoded.is_clean()
        {
            let merged = merge_fields(local, &decoded.record)?;
            tracing::debug!(record = %local.key(), "conflict merged field-wise");
            return Ok(Resolution::Merged(DecodedRecord::clean(merged)));
        }

        if local.updated_at() > remote.updated_at() {
            let mut winner = local.clone();
            winner.set_version(remote.version().cloned());
            tracing::debug!(record = %local.key(), "conflict resolved: local wins");
            Ok(Resolution::LocalWins(winner))
        } else {
            tracing::debug!(record = %local.key(), "conflict resolved: remote wins");
            Ok(Resolution::RemoteWins(decoded))
        }
    }
}

/// Merges two plaintext versions of the same record field by field.
///
/// Each field present on both sides takes the value from the side with the
/// later `updated_at`; fields present on one side are kept. Timestamp ties
/// pick the value with the greater canonical encoding, which makes the
/// merge independent of argument order. The merged record carries
/// `max(updated_at)` and the remote's version token.
pub(crate) fn merge_fields(
    local: &TransportRecord,
    remote: &TransportRecord,
) -> CodecResult<TransportRecord> {
    let mut merged = TransportRecord::new(
        local.record_type(),
        local.local_id(),
        local.updated_at().max(remote.updated_at()),
    );
    merged.set_version(remote.version().cloned());

    let names: BTreeSet<&str> = local
        .fields()
        .map(|(name, _)| name)
        .chain(remote.fields().map(|(name, _)| name))
        .collect();

    for name in names {
        let value = match (local.field(name), remote.field(name)) {
            (Some(l), Some(r)) if l != r => {
                if local.updated_at() > remote.updated_at() {
                    l
                } else if remote.updated_at() > local.updated_at() {
                    r
                } else {
                    // Equal timestamps, differing values: break the tie by
                    // canonical encoding so merge(a, b) == merge(b, a).
                    if to_canonical_cbor(l)? >= to_canonical_cbor(r)? {
                        l
                    } else {
                        r
                    }
                }
            }
            (Some(l), _) => l,
            (None, Some(r)) => r,
            (None, None) => continue,
        };
        merged.set_field(name, value.clone())?;
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_codec::{FieldValue, NullCipher, RecordSchema, SchemaRegistry};

    fn lww_resolver() -> ConflictResolver {
        ConflictResolver::new(Arc::new(RecordCodec::new(
            SchemaRegistry::new().with(RecordSchema::new("DiveLog")),
        )))
    }

    fn merge_resolver() -> ConflictResolver {
        ConflictResolver::new(Arc::new(RecordCodec::new(
            SchemaRegistry::new()
                .with(RecordSchema::new("DiveLog").with_merge(MergeStrategy::FieldMerge)),
        )))
    }

    fn log(notes: &str, updated_at: i64) -> TransportRecord {
        let mut record = TransportRecord::new("DiveLog", "d1", updated_at);
        record.set_field("notes", notes).unwrap();
        record
    }

    #[test]
    fn strictly_later_local_wins() {
        let local = log("great dive", 200);
        let remote = log("saw turtles", 100);

        let resolution = lww_resolver().resolve(&local, &remote, &NullCipher).unwrap();
        match resolution {
            Resolution::LocalWins(winner) => {
                assert_eq!(winner.field("notes").and_then(FieldValue::as_text), Some("great dive"));
                assert_eq!(winner.updated_at(), 200);
            }
            other => panic!("expected local win, got {other:?}"),
        }
    }

    #[test]
    fn later_remote_wins() {
        let local = log("great dive", 100);
        let remote = log("saw turtles", 110);

        let resolution = lww_resolver().resolve(&local, &remote, &NullCipher).unwrap();
        assert!(matches!(resolution, Resolution::RemoteWins(_)));
        assert_eq!(
            resolution.winner().field("notes").and_then(FieldValue::as_text),
            Some("saw turtles")
        );
    }

    #[test]
    fn tie_prefers_remote() {
        let local = log("mine", 100);
        let remote = log("theirs", 100);

        let resolution = lww_resolver().resolve(&local, &remote, &NullCipher).unwrap();
        assert!(matches!(resolution, Resolution::RemoteWins(_)));
    }

    #[test]
    fn winner_timestamp_never_regresses() {
        for (lt, rt) in [(1, 2), (2, 1), (5, 5)] {
            let resolution = lww_resolver()
                .resolve(&log("l", lt), &log("r", rt), &NullCipher)
                .unwrap();
            assert!(resolution.winner().updated_at() >= lt.max(rt));
        }
    }

    #[test]
    fn local_winner_takes_remote_version_token() {
        let local = log("mine", 200);
        let mut remote = log("theirs", 100);
        remote.set_version(Some(tidesync_codec::VersionToken::from_bytes(vec![9])));

        let resolution = lww_resolver().resolve(&local, &remote, &NullCipher).unwrap();
        match resolution {
            Resolution::LocalWins(winner) => {
                assert_eq!(winner.version().unwrap().as_bytes(), &[9]);
            }
            other => panic!("expected local win, got {other:?}"),
        }
    }

    #[test]
    fn losing_values_not_merged_without_field_merge() {
        let mut local = log("mine", 200);
        local.set_field("wishlist", true).unwrap();
        let remote = log("theirs", 100);

        let resolution = lww_resolver().resolve(&local, &remote, &NullCipher).unwrap();
        // The losing remote's notes never leak into the winner.
        assert_eq!(
            resolution.winner().field("notes").and_then(FieldValue::as_text),
            Some("mine")
        );
    }

    #[test]
    fn field_merge_combines_independent_edits() {
        // Device A edited notes at t=200; device B toggled the wishlist
        // flag at t=150.
        let mut local = log("rewritten notes", 200);
        local.set_field("wishlist", false).unwrap();

        let mut remote = log("old notes", 150);
        remote.set_field("wishlist", true).unwrap();
        remote.set_field("rating", 5i64).unwrap();

        let resolution = merge_resolver().resolve(&local, &remote, &NullCipher).unwrap();
        let Resolution::Merged(decoded) = resolution else {
            panic!("expected merge");
        };
        let merged = decoded.record;

        // Both-present fields take the later side; remote-only fields survive.
        assert_eq!(
            merged.field("notes").and_then(FieldValue::as_text),
            Some("rewritten notes")
        );
        assert_eq!(merged.field("wishlist").and_then(FieldValue::as_bool), Some(false));
        assert_eq!(merged.field("rating").and_then(FieldValue::as_integer), Some(5));
        assert_eq!(merged.updated_at(), 200);
    }

    #[test]
    fn field_merge_is_commutative() {
        let mut a = log("notes a", 200);
        a.set_field("wishlist", true).unwrap();
        let mut b = log("notes b", 150);
        b.set_field("rating", 4i64).unwrap();

        assert_eq!(
            merge_fields(&a, &b).unwrap().fields().collect::<Vec<_>>(),
            merge_fields(&b, &a).unwrap().fields().collect::<Vec<_>>()
        );
    }

    #[test]
    fn field_merge_is_idempotent() {
        let a = log("notes a", 200);
        let b = log("notes b", 150);

        let once = merge_fields(&a, &b).unwrap();
        let twice = merge_fields(&once, &b).unwrap();
        assert_eq!(once.fields().collect::<Vec<_>>(), twice.fields().collect::<Vec<_>>());
        assert_eq!(once.updated_at(), twice.updated_at());
    }

    #[test]
    fn tied_merge_is_order_independent() {
        let mut a = log("aaa", 100);
        a.set_field("rating", 1i64).unwrap();
        let mut b = log("zzz", 100);
        b.set_field("rating", 9i64).unwrap();

        let ab = merge_fields(&a, &b).unwrap();
        let ba = merge_fields(&b, &a).unwrap();
        assert_eq!(ab.fields().collect::<Vec<_>>(), ba.fields().collect::<Vec<_>>());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn record(notes: String, rating: i64, ts: i64) -> TransportRecord {
            let mut r = TransportRecord::new("DiveLog", "d1", ts);
            r.set_field("notes", notes).unwrap();
            r.set_field("rating", rating).unwrap();
            r
        }

        proptest! {
            #[test]
            fn merge_commutative_and_idempotent(
                an in ".{0,8}", ar in 0i64..10, at in 0i64..1000,
                bn in ".{0,8}", br in 0i64..10, bt in 0i64..1000,
            ) {
                let a = record(an, ar, at);
                let b = record(bn, br, bt);

                let ab = merge_fields(&a, &b).unwrap();
                let ba = merge_fields(&b, &a).unwrap();
                prop_assert_eq!(
                    ab.fields().collect::<Vec<_>>(),
                    ba.fields().collect::<Vec<_>>()
                );
                prop_assert_eq!(ab.updated_at(), ba.updated_at());

                let again = merge_fields(&ab, &b).unwrap();
                prop_assert_eq!(
                    ab.fields().collect::<Vec<_>>(),
                    again.fields().collect::<Vec<_>>()
                );
            }
        }
    }
}
