//! Ports consumed by the metadata engine
//!
//! The engine never talks to a concrete SQL backend. It depends on three
//! narrow traits, injected by the embedder:
//!
//! - [`StorageDialect`]: issues DDL against the backend. Called only after
//!   a merge has committed the corresponding schema change, never before,
//!   so physical structure can't drift ahead of the logical schema.
//! - [`IdentifierFactory`]: derives a stable backend-safe identifier for
//!   each new entity, called exactly once at the moment the entity is
//!   added to a mutable snapshot.
//! - [`RidGenerator`]: allocates batches of row ids for document inserts.

use crate::error::{BackendResult, UnknownDocPart};
use crate::path::PathKey;
use crate::types::{FieldIndexOrdering, FieldType};

/// A column to create on a doc part table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Backend column name
    pub name: String,
    /// Stored type
    pub field_type: FieldType,
}

/// One ordered column of a backend index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumnSpec {
    /// Backend column name
    pub name: String,
    /// Sort direction
    pub ordering: FieldIndexOrdering,
}

/// Dialect-agnostic DDL surface of the SQL backend.
///
/// Implementations translate each call into backend-specific statements
/// and execute them; the engine only sequences the calls.
pub trait StorageDialect {
    /// Create the schema backing a database.
    fn create_schema(&self, schema: &str) -> BackendResult<()>;

    /// Drop a database's schema and everything in it.
    fn drop_schema(&self, schema: &str) -> BackendResult<()>;

    /// Create the table backing one doc part, with its initial columns.
    fn create_doc_part_table(
        &self,
        schema: &str,
        table: &str,
        columns: &[ColumnSpec],
    ) -> BackendResult<()>;

    /// Drop a doc part table.
    fn drop_doc_part_table(&self, schema: &str, table: &str) -> BackendResult<()>;

    /// Add a column to an existing doc part table.
    fn add_column(
        &self,
        schema: &str,
        table: &str,
        column: &str,
        field_type: FieldType,
    ) -> BackendResult<()>;

    /// Create a backend index over the given ordered columns.
    fn create_index(
        &self,
        name: &str,
        schema: &str,
        table: &str,
        columns: &[IndexColumnSpec],
        unique: bool,
    ) -> BackendResult<()>;

    /// Drop a backend index.
    fn drop_index(&self, schema: &str, name: &str) -> BackendResult<()>;

    /// Rename a doc part table.
    fn rename_table(&self, schema: &str, from: &str, to: &str) -> BackendResult<()>;

    /// Rename a backend index.
    fn rename_index(&self, schema: &str, from: &str, to: &str) -> BackendResult<()>;
}

/// Derives backend-safe identifiers for new schema entities.
///
/// Identifiers are assigned once, at the moment the entity is added to a
/// mutable snapshot, and never change afterwards.
pub trait IdentifierFactory {
    /// Identifier for a new database (the backend schema name).
    fn database_identifier(&self, name: &str) -> String;

    /// Identifier for a new collection within a database.
    fn collection_identifier(&self, database_id: &str, name: &str) -> String;

    /// Identifier for a new doc part (the backend table name).
    fn doc_part_identifier(&self, collection_id: &str, path: &PathKey) -> String;

    /// Identifier for a new field column.
    fn field_identifier(&self, doc_part_id: &str, name: &str, field_type: FieldType) -> String;

    /// Identifier for a new scalar column.
    fn scalar_identifier(&self, doc_part_id: &str, field_type: FieldType) -> String;

    /// Identifier for a new physical doc part index.
    fn index_identifier(&self, doc_part_id: &str, column_identifiers: &[&str]) -> String;
}

/// Allocates row ids for document inserts, in batches.
pub trait RidGenerator {
    /// Reserve `count` consecutive row ids on the addressed doc part and
    /// return the first reserved id.
    fn consume_rids(
        &self,
        database: &str,
        collection: &str,
        path: &PathKey,
        count: u64,
    ) -> Result<u64, UnknownDocPart>;
}
