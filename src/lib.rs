//! shreddb: an MVCC schema-metadata engine for document-to-SQL mapping
//!
//! shreddb tracks the evolving mapping from schemaless documents onto
//! normalized SQL tables. The committed schema lives in an immutable,
//! `Arc`-shared snapshot tree; transactions fork it, mutate their fork
//! privately, and commit through a conflict-detecting three-way merge.
//!
//! The usual flow:
//!
//! ```
//! use shreddb::{FieldType, MvccMetainfoRepository, PathKey};
//!
//! # fn main() -> Result<(), shreddb::Error> {
//! let repository = MvccMetainfoRepository::new();
//!
//! let mut fork = repository.fork();
//! fork.add_database("blog", "blog")?
//!     .add_collection("posts", "blog_posts")?
//!     .add_doc_part(PathKey::root(), "blog_posts")?
//!     .add_field("title", "blog_posts_title_s", FieldType::String)?;
//! repository.commit(&fork)?;
//!
//! let snapshot = repository.snapshot();
//! assert!(snapshot.database_by_name("blog").is_some());
//! # Ok(())
//! # }
//! ```
//!
//! On a retryable [`Error`], discard the fork, re-fork from the current
//! snapshot, replay the schema change, and commit again.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use shred_core::{
    BackendError, BackendResult, ColumnSpec, DefaultIdentifierFactory, FieldIndexOrdering,
    FieldType, IdentifierFactory, IndexColumnSpec, PathKey, RidGenerator, StorageDialect,
    UnknownDocPart,
};
pub use shred_metainfo::{
    ElementState, EntityKind, MergeConflict, MetaCollection, MetaDatabase, MetaDocPart,
    MetaDocPartIndex, MetaDocPartIndexColumn, MetaField, MetaIndex, MetaIndexField, MetaScalar,
    MetaSnapshot, MergeStage, MutableMetaCollection, MutableMetaDatabase, MutableMetaDocPart,
    MutableMetaIndex, MutableMetaSnapshot, MvccMetainfoRepository, SchemaDiffApplier,
    SnapshotMerger, SnapshotStage, StructuralError,
};

use thiserror::Error as ThisError;

/// Any error a schema transaction can surface, unified for embedders that
/// drive the whole flow through one result type.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A mutable snapshot was misused; a bug in the caller.
    #[error(transparent)]
    Structural(#[from] StructuralError),

    /// The commit lost a race; re-fork and retry.
    #[error(transparent)]
    Conflict(#[from] MergeConflict),

    /// The storage backend failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl Error {
    /// Whether re-forking from the latest committed snapshot and replaying
    /// the transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Structural(_) => false,
            Error::Conflict(_) => true,
            Error::Backend(err) => err.is_retryable(),
        }
    }
}
