//! Core types and ports for shreddb
//!
//! This crate defines the foundational types used throughout the system:
//! - PathKey: tree-structured address of a doc part within a collection
//! - FieldType / FieldIndexOrdering: the tagged unions for scalar kinds
//!   and index column orderings
//! - BackendError: classification of errors raised by the storage backend
//! - Ports: the narrow interfaces the metadata engine consumes
//!   (StorageDialect, IdentifierFactory, RidGenerator)
//! - DefaultIdentifierFactory: deterministic backend-safe identifiers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod identifier;
pub mod path;
pub mod traits;
pub mod types;

pub use error::{BackendError, BackendResult, UnknownDocPart};
pub use identifier::DefaultIdentifierFactory;
pub use path::PathKey;
pub use traits::{ColumnSpec, IdentifierFactory, IndexColumnSpec, RidGenerator, StorageDialect};
pub use types::{FieldIndexOrdering, FieldType};
