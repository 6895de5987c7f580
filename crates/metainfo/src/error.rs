//! Error types for the metadata engine
//!
//! Two disjoint families, kept apart so a caller's retry loop can never
//! confuse them:
//!
//! - [`StructuralError`]: the caller misused a mutable snapshot (added a
//!   duplicate, removed something absent). A bug, never retryable.
//! - [`MergeConflict`]: the snapshot merger found a genuine incompatibility
//!   between a transaction's delta and concurrently committed changes.
//!   Always retryable by re-forking from the latest committed snapshot.

use shred_core::PathKey;
use thiserror::Error;

/// The kind of schema entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// A database
    Database,
    /// A collection
    Collection,
    /// A doc part
    DocPart,
    /// A field
    Field,
    /// A scalar
    Scalar,
    /// A logical index
    Index,
    /// A physical doc part index
    DocPartIndex,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityKind::Database => "database",
            EntityKind::Collection => "collection",
            EntityKind::DocPart => "doc part",
            EntityKind::Field => "field",
            EntityKind::Scalar => "scalar",
            EntityKind::Index => "index",
            EntityKind::DocPartIndex => "doc part index",
        };
        write!(f, "{}", name)
    }
}

/// Misuse of a mutable snapshot. Fatal to the current transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    /// An entity with the same key already exists in the combined view.
    #[error("there is another {kind} keyed {key}")]
    AlreadyExists {
        /// Entity kind
        kind: EntityKind,
        /// The conflicting key (name, path, or type, as appropriate)
        key: String,
    },

    /// An identifier is already claimed by another entity of this kind.
    #[error("there is another {kind} whose identifier is {identifier}")]
    IdentifierInUse {
        /// Entity kind
        kind: EntityKind,
        /// The claimed identifier
        identifier: String,
    },

    /// A removal referenced an entity that is not present.
    #[error("no {kind} keyed {key} to remove")]
    NotFound {
        /// Entity kind
        kind: EntityKind,
        /// The missing key
        key: String,
    },
}

/// A conflict detected by the snapshot merger. Retryable: discard the
/// mutable snapshot, re-fork from the current committed snapshot, replay,
/// and commit again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeConflict {
    /// An added entity's name is already bound to a different identifier.
    #[error(
        "{kind} named {name} already exists with identifier {existing_identifier}, \
         but the new one claims {new_identifier}"
    )]
    NameBoundToOtherIdentifier {
        /// Entity kind
        kind: EntityKind,
        /// The contested name (or path, for doc parts)
        name: String,
        /// Identifier already committed under that name
        existing_identifier: String,
        /// Identifier the delta tried to bind
        new_identifier: String,
    },

    /// An added entity's identifier is already bound to a different name.
    #[error(
        "{kind} with identifier {identifier} already exists under key {existing_name}, \
         but the new one claims {new_name}"
    )]
    IdentifierBoundToOtherName {
        /// Entity kind
        kind: EntityKind,
        /// The contested identifier
        identifier: String,
        /// Key already committed under that identifier (name, path, or
        /// name+type description)
        existing_name: String,
        /// Key the delta tried to bind
        new_name: String,
    },

    /// A physical index column disagrees with the committed index about an
    /// identifier/position pairing.
    #[error(
        "doc part index {doc_part_index} on {database}.{collection}.{path} already binds column \
         {existing_identifier} at position {existing_position}, but the new one binds \
         {new_identifier} at position {new_position}"
    )]
    DocPartIndexColumnMismatch {
        /// Database name
        database: String,
        /// Collection name
        collection: String,
        /// Path key of the doc part
        path: PathKey,
        /// Identifier of the physical index
        doc_part_index: String,
        /// Column identifier already committed
        existing_identifier: String,
        /// Its committed position
        existing_position: u32,
        /// Column identifier the delta tried to bind
        new_identifier: String,
        /// The position the delta claimed
        new_position: u32,
    },

    /// An appended index field disagrees with the committed index about a
    /// path/name/position pairing.
    #[error(
        "index {index} on {database}.{collection} already binds field {existing_field} of \
         {existing_path} at position {existing_position}, but the new one binds {new_field} of \
         {new_path} at position {new_position}"
    )]
    IndexFieldMismatch {
        /// Database name
        database: String,
        /// Collection name
        collection: String,
        /// Name of the logical index
        index: String,
        /// Field name already committed
        existing_field: String,
        /// Its doc part path
        existing_path: PathKey,
        /// Its committed position
        existing_position: u32,
        /// Field name the delta tried to bind
        new_field: String,
        /// Its doc part path
        new_path: PathKey,
        /// The position the delta claimed
        new_position: u32,
    },

    /// Two logical indexes with different names cover the same fields with
    /// the same uniqueness, or an index was re-added while a same-shaped
    /// one still lives.
    #[error(
        "index {new_index} on {database}.{collection} conflicts with existing index {existing_index}"
    )]
    ConflictingIndex {
        /// Database name
        database: String,
        /// Collection name
        collection: String,
        /// The index being added
        new_index: String,
        /// The committed index it collides with
        existing_index: String,
    },

    /// A logical index was added but some doc part it touches has no
    /// physical index with exactly matching columns, and none is being
    /// added alongside it.
    #[error(
        "index {index} on {database}.{collection} needs a doc part index on {path} \
         that has not been created"
    )]
    MissingDocPartIndex {
        /// Database name
        database: String,
        /// Collection name
        collection: String,
        /// The logical index lacking backing
        index: String,
        /// Path key of the uncovered doc part
        path: PathKey,
    },

    /// A field was added while a committed logical index references it, and
    /// the required physical index was not created alongside.
    #[error(
        "index {index} on {database}.{collection} references new field {field} of doc part \
         {path} and the corresponding doc part index has not been created"
    )]
    MissingDocPartIndexForField {
        /// Database name
        database: String,
        /// Collection name
        collection: String,
        /// The committed index left without backing
        index: String,
        /// Path key of the doc part the field was added to
        path: PathKey,
        /// The new field's name
        field: String,
    },

    /// A logical index was removed while a physical index only it required
    /// was not removed alongside.
    #[error(
        "doc part index {doc_part_index} on {database}.{collection}.{path} is only required \
         by removed index {index} and has not been deleted"
    )]
    OrphanedDocPartIndex {
        /// Database name
        database: String,
        /// Collection name
        collection: String,
        /// Path key of the doc part carrying the stranded physical index
        path: PathKey,
        /// Identifier of the stranded physical index
        doc_part_index: String,
        /// Name of the removed logical index
        index: String,
    },

    /// A physical index was added that no live logical index requires.
    #[error(
        "doc part index {doc_part_index} on {database}.{collection}.{path} has no index associated"
    )]
    UnbackedDocPartIndex {
        /// Database name
        database: String,
        /// Collection name
        collection: String,
        /// Path key of the doc part
        path: PathKey,
        /// Identifier of the unrequired physical index
        doc_part_index: String,
    },

    /// A physical index was removed while some committed logical index
    /// still requires it.
    #[error(
        "index {index} on {database}.{collection} is still backed by removed doc part index \
         {doc_part_index} on {path}"
    )]
    RemovedDocPartIndexStillRequired {
        /// Database name
        database: String,
        /// Collection name
        collection: String,
        /// Path key of the doc part
        path: PathKey,
        /// Identifier of the removed physical index
        doc_part_index: String,
        /// Name of the index that still needs it
        index: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_error_display() {
        let err = StructuralError::AlreadyExists {
            kind: EntityKind::Collection,
            key: "users".into(),
        };
        assert_eq!(err.to_string(), "there is another collection keyed users");

        let err = StructuralError::NotFound {
            kind: EntityKind::Index,
            key: "idx1".into(),
        };
        assert_eq!(err.to_string(), "no index keyed idx1 to remove");
    }

    #[test]
    fn test_merge_conflict_names_the_rule() {
        let err = MergeConflict::MissingDocPartIndex {
            database: "db".into(),
            collection: "col".into(),
            index: "idx2".into(),
            path: PathKey::root(),
        };
        let msg = err.to_string();
        assert!(msg.contains("idx2"));
        assert!(msg.contains("has not been created"));

        let err = MergeConflict::NameBoundToOtherIdentifier {
            kind: EntityKind::Database,
            name: "db1".into(),
            existing_identifier: "id1".into(),
            new_identifier: "id2".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("db1"));
        assert!(msg.contains("id1"));
        assert!(msg.contains("id2"));
    }
}
