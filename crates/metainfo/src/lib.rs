//! MVCC schema metadata for shreddb
//!
//! This crate tracks how schemaless documents map onto normalized SQL
//! structure: which databases, collections, doc part tables, columns, and
//! indexes exist, under snapshot isolation.
//!
//! - immutable: the committed snapshot tree, `Arc`-shared and never
//!   mutated in place
//! - mutable: a transaction's private fork of a committed snapshot
//! - merge: the three-way merge grafting a fork's delta onto whatever is
//!   committed by commit time, with conflict detection
//! - repository: the shared owner of the committed snapshot, serializing
//!   commits
//! - apply: diffing two snapshots into backend DDL through the
//!   [`shred_core::StorageDialect`] port
//! - entity: the leaf values (fields, scalars, indexes) and their
//!   compatibility predicates
//! - error: structural misuse vs retryable merge conflicts

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod apply;
pub mod entity;
pub mod error;
pub mod immutable;
pub mod merge;
pub mod mutable;
pub mod repository;

pub use apply::SchemaDiffApplier;
pub use entity::{
    DocPartView, MetaDocPartIndex, MetaDocPartIndexColumn, MetaField, MetaIndex, MetaIndexField,
    MetaScalar,
};
pub use error::{EntityKind, MergeConflict, StructuralError};
pub use immutable::{MetaCollection, MetaDatabase, MetaDocPart, MetaSnapshot};
pub use merge::SnapshotMerger;
pub use mutable::{
    ElementState, MutableMetaCollection, MutableMetaDatabase, MutableMetaDocPart,
    MutableMetaIndex, MutableMetaSnapshot,
};
pub use repository::{MergeStage, MvccMetainfoRepository, SnapshotStage};
