//! Per-type record schemas.
//!
//! Each syncable record type declares, statically, which fields must never
//! leave the device in plaintext and how concurrent edits merge. The
//! registry is built explicitly at startup and injected wherever it is
//! needed; there is no ambient global table.

use std::collections::{BTreeSet, HashMap};

/// How concurrent edits of the same record reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// The record with the strictly later mutation time wins outright;
    /// ties prefer the remote copy.
    #[default]
    LastWriteWins,
    /// Independently mutable fields merge per field; each field takes the
    /// value from the side with the later mutation time.
    FieldMerge,
}

/// Static schema for one record type.
#[derive(Debug, Clone)]
pub struct RecordSchema {
    record_type: String,
    encrypted_fields: BTreeSet<String>,
    merge: MergeStrategy,
}

impl RecordSchema {
    /// Creates a schema with no encrypted fields and last-write-wins merge.
    pub fn new(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            encrypted_fields: BTreeSet::new(),
            merge: MergeStrategy::LastWriteWins,
        }
    }

    /// Marks a field as sensitive: its value is encrypted in transport.
    #[must_use]
    pub fn with_encrypted_field(mut self, name: impl Into<String>) -> Self {
        self.encrypted_fields.insert(name.into());
        self
    }

    /// Sets the merge strategy for this type.
    #[must_use]
    pub fn with_merge(mut self, merge: MergeStrategy) -> Self {
        self.merge = merge;
        self
    }

    /// Returns the record type this schema describes.
    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    /// Returns true if the named field is encrypted in transport.
    pub fn is_encrypted(&self, name: &str) -> bool {
        self.encrypted_fields.contains(name)
    }

    /// Iterates over the encrypted field names.
    pub fn encrypted_fields(&self) -> impl Iterator<Item = &str> {
        self.encrypted_fields.iter().map(String::as_str)
    }

    /// Returns the merge strategy.
    pub fn merge(&self) -> MergeStrategy {
        self.merge
    }
}

/// Registry of record schemas, one per syncable type.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, RecordSchema>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema, replacing any previous schema for the same type.
    #[must_use]
    pub fn with(mut self, schema: RecordSchema) -> Self {
        self.schemas.insert(schema.record_type.clone(), schema);
        self
    }

    /// Looks up the schema for a record type.
    ///
    /// Unregistered types are valid: they sync with no encrypted fields and
    /// last-write-wins semantics.
    pub fn get(&self, record_type: &str) -> Option<&RecordSchema> {
        self.schemas.get(record_type)
    }

    /// Returns the merge strategy for a record type.
    pub fn merge_strategy(&self, record_type: &str) -> MergeStrategy {
        self.get(record_type).map(RecordSchema::merge).unwrap_or_default()
    }

    /// Returns the registered record types.
    pub fn record_types(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }
}
