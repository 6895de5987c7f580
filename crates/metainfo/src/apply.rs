//! Turning a committed schema change into backend DDL
//!
//! After a merge commits, the backend's physical structure has to catch up
//! with the logical schema. [`SchemaDiffApplier`] diffs two committed
//! snapshots and drives a [`StorageDialect`] through the DDL that takes the
//! backend from one to the other.
//!
//! Ordering matters on both sides of the diff: tables are created parents
//! before children so a child table never references a missing parent, and
//! dropped children before parents. Because snapshots share untouched
//! subtrees by reference, the diff skips whole databases and collections
//! with a single pointer comparison.

use crate::entity::DocPartView;
use crate::immutable::{MetaCollection, MetaDatabase, MetaDocPart, MetaSnapshot};
use shred_core::{BackendResult, ColumnSpec, IndexColumnSpec, StorageDialect};
use std::sync::Arc;

/// Applies the difference between two snapshots to a storage backend.
#[derive(Debug)]
pub struct SchemaDiffApplier<'a, D: StorageDialect> {
    dialect: &'a D,
}

impl<'a, D: StorageDialect> SchemaDiffApplier<'a, D> {
    /// An applier issuing DDL through the given dialect.
    pub fn new(dialect: &'a D) -> Self {
        SchemaDiffApplier { dialect }
    }

    /// Issue the DDL taking the backend from `before` to `after`.
    pub fn apply(&self, before: &MetaSnapshot, after: &MetaSnapshot) -> BackendResult<()> {
        for database in after.databases() {
            match before.database_by_name(database.name()) {
                None => self.create_database(database)?,
                Some(old) if !Arc::ptr_eq(old, database) => {
                    self.apply_database(old, database)?;
                }
                Some(_) => {}
            }
        }
        for database in before.databases() {
            if after.database_by_name(database.name()).is_none() {
                tracing::info!(schema = database.identifier(), "dropping schema");
                self.dialect.drop_schema(database.identifier())?;
            }
        }
        Ok(())
    }

    fn create_database(&self, database: &MetaDatabase) -> BackendResult<()> {
        tracing::info!(schema = database.identifier(), "creating schema");
        self.dialect.create_schema(database.identifier())?;
        for collection in database.collections() {
            self.create_collection(database, collection)?;
        }
        Ok(())
    }

    fn apply_database(&self, before: &MetaDatabase, after: &MetaDatabase) -> BackendResult<()> {
        for collection in after.collections() {
            match before.collection_by_name(collection.name()) {
                None => self.create_collection(after, collection)?,
                Some(old) if !Arc::ptr_eq(old, collection) => {
                    self.apply_collection(after, old, collection)?;
                }
                Some(_) => {}
            }
        }
        for collection in before.collections() {
            if after.collection_by_name(collection.name()).is_none() {
                self.drop_collection(after, collection)?;
            }
        }
        Ok(())
    }

    fn create_collection(
        &self,
        database: &MetaDatabase,
        collection: &MetaCollection,
    ) -> BackendResult<()> {
        // doc_parts() yields parents before children.
        for doc_part in collection.doc_parts() {
            self.create_doc_part(database, doc_part)?;
        }
        Ok(())
    }

    fn drop_collection(
        &self,
        database: &MetaDatabase,
        collection: &MetaCollection,
    ) -> BackendResult<()> {
        let doc_parts: Vec<_> = collection.doc_parts().collect();
        for doc_part in doc_parts.into_iter().rev() {
            tracing::info!(
                schema = database.identifier(),
                table = doc_part.identifier(),
                "dropping doc part table"
            );
            self.dialect
                .drop_doc_part_table(database.identifier(), doc_part.identifier())?;
        }
        Ok(())
    }

    fn apply_collection(
        &self,
        database: &MetaDatabase,
        before: &MetaCollection,
        after: &MetaCollection,
    ) -> BackendResult<()> {
        for doc_part in after.doc_parts() {
            match before.doc_part_by_path(doc_part.path_key()) {
                None => self.create_doc_part(database, doc_part)?,
                Some(old) if !Arc::ptr_eq(old, doc_part) => {
                    self.apply_doc_part(database, old, doc_part)?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn create_doc_part(
        &self,
        database: &MetaDatabase,
        doc_part: &MetaDocPart,
    ) -> BackendResult<()> {
        let mut columns: Vec<ColumnSpec> = doc_part
            .scalars()
            .map(|scalar| ColumnSpec {
                name: scalar.identifier.clone(),
                field_type: scalar.field_type,
            })
            .chain(doc_part.fields().map(|field| ColumnSpec {
                name: field.identifier.clone(),
                field_type: field.field_type,
            }))
            .collect();
        columns.sort_by(|a, b| a.name.cmp(&b.name));

        tracing::info!(
            schema = database.identifier(),
            table = doc_part.identifier(),
            columns = columns.len(),
            "creating doc part table"
        );
        self.dialect
            .create_doc_part_table(database.identifier(), doc_part.identifier(), &columns)?;
        for index in doc_part.indexes() {
            self.create_doc_part_index(database, doc_part, index)?;
        }
        Ok(())
    }

    fn apply_doc_part(
        &self,
        database: &MetaDatabase,
        before: &MetaDocPart,
        after: &MetaDocPart,
    ) -> BackendResult<()> {
        for scalar in after.scalars() {
            if before.scalar(scalar.field_type).is_none() {
                self.dialect.add_column(
                    database.identifier(),
                    after.identifier(),
                    &scalar.identifier,
                    scalar.field_type,
                )?;
            }
        }
        for field in after.fields() {
            if before.field(&field.identifier).is_none() {
                self.dialect.add_column(
                    database.identifier(),
                    after.identifier(),
                    &field.identifier,
                    field.field_type,
                )?;
            }
        }
        for index in after.indexes() {
            if before.index(&index.identifier).is_none() {
                self.create_doc_part_index(database, after, index)?;
            }
        }
        for index in before.indexes() {
            if after.index(&index.identifier).is_none() {
                tracing::info!(
                    schema = database.identifier(),
                    index = index.identifier.as_str(),
                    "dropping index"
                );
                self.dialect
                    .drop_index(database.identifier(), &index.identifier)?;
            }
        }
        Ok(())
    }

    fn create_doc_part_index(
        &self,
        database: &MetaDatabase,
        doc_part: &MetaDocPart,
        index: &crate::entity::MetaDocPartIndex,
    ) -> BackendResult<()> {
        let columns: Vec<IndexColumnSpec> = index
            .columns
            .iter()
            .map(|column| IndexColumnSpec {
                name: column.identifier.clone(),
                ordering: column.ordering,
            })
            .collect();
        tracing::info!(
            schema = database.identifier(),
            index = index.identifier.as_str(),
            unique = index.unique,
            "creating index"
        );
        self.dialect.create_index(
            &index.identifier,
            database.identifier(),
            doc_part.identifier(),
            &columns,
            index.unique,
        )
    }
}
