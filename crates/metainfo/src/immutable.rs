//! The immutable committed snapshot tree
//!
//! A committed snapshot is a tree of `Arc`-shared nodes: snapshot →
//! databases → collections → doc parts. Nodes are never mutated after
//! construction; evolving the schema means rebuilding the changed spine of
//! the tree through the per-level builders while every untouched subtree is
//! shared with the previous snapshot by reference. Readers holding a
//! snapshot therefore observe a frozen schema for as long as they keep it,
//! at zero cost to concurrent writers.
//!
//! The one escape hatch from pure immutability is the row id counter on
//! each doc part, which is an atomic: row id allocation is monotonic across
//! snapshots and does not go through the merge path.

use crate::entity::{
    missing_indexes_for_new_field, DocPartView, MetaDocPartIndex, MetaDocPartIndexRef, MetaField,
    MetaIndex, MetaIndexRef, MetaScalar,
};
use shred_core::{FieldType, PathKey};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One doc part: the metadata of a single backend table.
#[derive(Debug)]
pub struct MetaDocPart {
    path: PathKey,
    identifier: String,
    fields_by_identifier: HashMap<String, MetaField>,
    field_identifiers_by_name: HashMap<String, Vec<String>>,
    scalars: HashMap<FieldType, MetaScalar>,
    indexes: HashMap<String, MetaDocPartIndexRef>,
    next_rid: AtomicU64,
}

impl MetaDocPart {
    /// Backend table identifier, unique within the collection.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The field owning the given column identifier.
    pub fn field(&self, identifier: &str) -> Option<&MetaField> {
        self.fields_by_identifier.get(identifier)
    }

    /// The field with the given name and type, if present.
    pub fn field_by_name_and_type(&self, name: &str, field_type: FieldType) -> Option<&MetaField> {
        self.field_identifiers_by_name
            .get(name)?
            .iter()
            .filter_map(|id| self.fields_by_identifier.get(id))
            .find(|field| field.field_type == field_type)
    }

    /// All fields, in no particular order.
    pub fn fields(&self) -> impl Iterator<Item = &MetaField> {
        self.fields_by_identifier.values()
    }

    /// The scalar column of the given type, if present.
    pub fn scalar(&self, field_type: FieldType) -> Option<&MetaScalar> {
        self.scalars.get(&field_type)
    }

    /// All scalar columns.
    pub fn scalars(&self) -> impl Iterator<Item = &MetaScalar> {
        self.scalars.values()
    }

    /// The physical index with the given identifier.
    pub fn index(&self, identifier: &str) -> Option<&MetaDocPartIndexRef> {
        self.indexes.get(identifier)
    }

    /// All physical indexes on this doc part.
    pub fn indexes(&self) -> impl Iterator<Item = &MetaDocPartIndexRef> {
        self.indexes.values()
    }

    /// A physical index covering the same columns as the given one,
    /// whatever its identifier.
    pub fn index_with_same_columns(
        &self,
        other: &MetaDocPartIndex,
    ) -> Option<&MetaDocPartIndexRef> {
        self.indexes
            .values()
            .find(|index| index.has_same_columns(other))
    }

    /// Reserve `count` consecutive row ids and return the first one.
    ///
    /// Allocation is atomic and never rolls back; ids reserved by an
    /// aborted transaction are simply never used.
    pub fn consume_rids(&self, count: u64) -> u64 {
        self.next_rid.fetch_add(count, Ordering::Relaxed)
    }

    /// The next row id that would be handed out.
    pub fn next_rid(&self) -> u64 {
        self.next_rid.load(Ordering::Relaxed)
    }
}

impl DocPartView for MetaDocPart {
    fn path_key(&self) -> &PathKey {
        &self.path
    }

    fn field_by_identifier(&self, identifier: &str) -> Option<&MetaField> {
        self.fields_by_identifier.get(identifier)
    }

    fn fields_named(&self, name: &str) -> Vec<&MetaField> {
        match self.field_identifiers_by_name.get(name) {
            Some(identifiers) => identifiers
                .iter()
                .filter_map(|id| self.fields_by_identifier.get(id))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Builds a [`MetaDocPart`], either from scratch or seeded from an
/// existing one.
#[derive(Debug)]
pub struct MetaDocPartBuilder {
    path: PathKey,
    identifier: String,
    fields_by_identifier: HashMap<String, MetaField>,
    scalars: HashMap<FieldType, MetaScalar>,
    indexes: HashMap<String, MetaDocPartIndexRef>,
    next_rid: u64,
}

impl MetaDocPartBuilder {
    /// An empty doc part at the given path.
    pub fn new(path: PathKey, identifier: &str) -> Self {
        MetaDocPartBuilder {
            path,
            identifier: identifier.to_string(),
            fields_by_identifier: HashMap::new(),
            scalars: HashMap::new(),
            indexes: HashMap::new(),
            next_rid: 0,
        }
    }

    /// Seeded from an existing doc part, carrying its row id counter.
    pub fn from(other: &MetaDocPart) -> Self {
        MetaDocPartBuilder {
            path: other.path.clone(),
            identifier: other.identifier.clone(),
            fields_by_identifier: other.fields_by_identifier.clone(),
            scalars: other.scalars.clone(),
            indexes: other.indexes.clone(),
            next_rid: other.next_rid(),
        }
    }

    /// Add a field, replacing any previous one with the same identifier.
    pub fn put_field(&mut self, field: MetaField) -> &mut Self {
        self.fields_by_identifier
            .insert(field.identifier.clone(), field);
        self
    }

    /// Add a scalar, replacing any previous one of the same type.
    pub fn put_scalar(&mut self, scalar: MetaScalar) -> &mut Self {
        self.scalars.insert(scalar.field_type, scalar);
        self
    }

    /// Add a physical index, replacing any previous one with the same
    /// identifier.
    pub fn put_index(&mut self, index: MetaDocPartIndexRef) -> &mut Self {
        self.indexes.insert(index.identifier.clone(), index);
        self
    }

    /// Drop the physical index with the given identifier, if present.
    pub fn remove_index(&mut self, identifier: &str) -> &mut Self {
        self.indexes.remove(identifier);
        self
    }

    /// Freeze into an immutable doc part.
    pub fn build(self) -> MetaDocPart {
        let mut by_name: HashMap<String, Vec<String>> = HashMap::new();
        for field in self.fields_by_identifier.values() {
            by_name
                .entry(field.name.clone())
                .or_default()
                .push(field.identifier.clone());
        }
        // Deterministic multimap order keeps identifier combinations stable
        // across rebuilds of the same doc part.
        for identifiers in by_name.values_mut() {
            identifiers.sort();
        }
        MetaDocPart {
            path: self.path,
            identifier: self.identifier,
            fields_by_identifier: self.fields_by_identifier,
            field_identifiers_by_name: by_name,
            scalars: self.scalars,
            indexes: self.indexes,
            next_rid: AtomicU64::new(self.next_rid),
        }
    }
}

/// One collection: doc parts keyed by path plus the declared logical
/// indexes.
#[derive(Debug)]
pub struct MetaCollection {
    name: String,
    identifier: String,
    doc_parts_by_path: BTreeMap<PathKey, Arc<MetaDocPart>>,
    doc_parts_by_identifier: HashMap<String, Arc<MetaDocPart>>,
    indexes: HashMap<String, MetaIndexRef>,
}

impl MetaCollection {
    /// User-visible collection name, unique within the database.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backend identifier, unique within the database.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The doc part at the given path.
    pub fn doc_part_by_path(&self, path: &PathKey) -> Option<&Arc<MetaDocPart>> {
        self.doc_parts_by_path.get(path)
    }

    /// The doc part with the given table identifier.
    pub fn doc_part_by_identifier(&self, identifier: &str) -> Option<&Arc<MetaDocPart>> {
        self.doc_parts_by_identifier.get(identifier)
    }

    /// All doc parts, parents before children.
    pub fn doc_parts(&self) -> impl Iterator<Item = &Arc<MetaDocPart>> {
        self.doc_parts_by_path.values()
    }

    /// The logical index with the given name.
    pub fn index_by_name(&self, name: &str) -> Option<&MetaIndexRef> {
        self.indexes.get(name)
    }

    /// All logical indexes.
    pub fn indexes(&self) -> impl Iterator<Item = &MetaIndexRef> {
        self.indexes.values()
    }

    /// The identifier combinations that need a new physical index on the
    /// doc part after the given field lands, per
    /// [`missing_indexes_for_new_field`].
    pub fn missing_indexes_for_new_field<D: DocPartView + ?Sized>(
        &self,
        doc_part: &D,
        new_field: &MetaField,
    ) -> Vec<(&MetaIndex, Vec<String>)> {
        missing_indexes_for_new_field(
            self.indexes.values().map(Arc::as_ref),
            doc_part,
            new_field,
        )
    }
}

/// Builds a [`MetaCollection`].
#[derive(Debug)]
pub struct MetaCollectionBuilder {
    name: String,
    identifier: String,
    doc_parts_by_path: BTreeMap<PathKey, Arc<MetaDocPart>>,
    indexes: HashMap<String, MetaIndexRef>,
}

impl MetaCollectionBuilder {
    /// An empty collection.
    pub fn new(name: &str, identifier: &str) -> Self {
        MetaCollectionBuilder {
            name: name.to_string(),
            identifier: identifier.to_string(),
            doc_parts_by_path: BTreeMap::new(),
            indexes: HashMap::new(),
        }
    }

    /// Seeded from an existing collection, sharing its subtrees.
    pub fn from(other: &MetaCollection) -> Self {
        MetaCollectionBuilder {
            name: other.name.clone(),
            identifier: other.identifier.clone(),
            doc_parts_by_path: other.doc_parts_by_path.clone(),
            indexes: other.indexes.clone(),
        }
    }

    /// Add a doc part, replacing any previous one at the same path.
    pub fn put_doc_part(&mut self, doc_part: Arc<MetaDocPart>) -> &mut Self {
        self.doc_parts_by_path
            .insert(doc_part.path_key().clone(), doc_part);
        self
    }

    /// Add a logical index, replacing any previous one with the same name.
    pub fn put_index(&mut self, index: MetaIndexRef) -> &mut Self {
        self.indexes.insert(index.name.clone(), index);
        self
    }

    /// Drop the logical index with the given name, if present.
    pub fn remove_index(&mut self, name: &str) -> &mut Self {
        self.indexes.remove(name);
        self
    }

    /// Freeze into an immutable collection.
    pub fn build(self) -> MetaCollection {
        let doc_parts_by_identifier = self
            .doc_parts_by_path
            .values()
            .map(|doc_part| (doc_part.identifier().to_string(), Arc::clone(doc_part)))
            .collect();
        MetaCollection {
            name: self.name,
            identifier: self.identifier,
            doc_parts_by_path: self.doc_parts_by_path,
            doc_parts_by_identifier,
            indexes: self.indexes,
        }
    }
}

/// One database: collections keyed by name and by identifier.
#[derive(Debug)]
pub struct MetaDatabase {
    name: String,
    identifier: String,
    collections_by_name: HashMap<String, Arc<MetaCollection>>,
    collections_by_identifier: HashMap<String, Arc<MetaCollection>>,
}

impl MetaDatabase {
    /// User-visible database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backend schema identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The collection with the given name.
    pub fn collection_by_name(&self, name: &str) -> Option<&Arc<MetaCollection>> {
        self.collections_by_name.get(name)
    }

    /// The collection with the given identifier.
    pub fn collection_by_identifier(&self, identifier: &str) -> Option<&Arc<MetaCollection>> {
        self.collections_by_identifier.get(identifier)
    }

    /// All collections.
    pub fn collections(&self) -> impl Iterator<Item = &Arc<MetaCollection>> {
        self.collections_by_name.values()
    }
}

/// Builds a [`MetaDatabase`].
#[derive(Debug)]
pub struct MetaDatabaseBuilder {
    name: String,
    identifier: String,
    collections_by_name: HashMap<String, Arc<MetaCollection>>,
}

impl MetaDatabaseBuilder {
    /// An empty database.
    pub fn new(name: &str, identifier: &str) -> Self {
        MetaDatabaseBuilder {
            name: name.to_string(),
            identifier: identifier.to_string(),
            collections_by_name: HashMap::new(),
        }
    }

    /// Seeded from an existing database, sharing its subtrees.
    pub fn from(other: &MetaDatabase) -> Self {
        MetaDatabaseBuilder {
            name: other.name.clone(),
            identifier: other.identifier.clone(),
            collections_by_name: other.collections_by_name.clone(),
        }
    }

    /// Add a collection, replacing any previous one with the same name.
    pub fn put_collection(&mut self, collection: Arc<MetaCollection>) -> &mut Self {
        self.collections_by_name
            .insert(collection.name().to_string(), collection);
        self
    }

    /// Drop the collection with the given name, if present.
    pub fn remove_collection(&mut self, name: &str) -> &mut Self {
        self.collections_by_name.remove(name);
        self
    }

    /// Freeze into an immutable database.
    pub fn build(self) -> MetaDatabase {
        let collections_by_identifier = self
            .collections_by_name
            .values()
            .map(|collection| (collection.identifier().to_string(), Arc::clone(collection)))
            .collect();
        MetaDatabase {
            name: self.name,
            identifier: self.identifier,
            collections_by_name: self.collections_by_name,
            collections_by_identifier,
        }
    }
}

/// The root of a committed snapshot: all databases.
#[derive(Debug, Default)]
pub struct MetaSnapshot {
    databases_by_name: HashMap<String, Arc<MetaDatabase>>,
    databases_by_identifier: HashMap<String, Arc<MetaDatabase>>,
}

impl MetaSnapshot {
    /// A snapshot with no databases.
    pub fn empty() -> Self {
        MetaSnapshot::default()
    }

    /// The database with the given name.
    pub fn database_by_name(&self, name: &str) -> Option<&Arc<MetaDatabase>> {
        self.databases_by_name.get(name)
    }

    /// The database with the given schema identifier.
    pub fn database_by_identifier(&self, identifier: &str) -> Option<&Arc<MetaDatabase>> {
        self.databases_by_identifier.get(identifier)
    }

    /// All databases.
    pub fn databases(&self) -> impl Iterator<Item = &Arc<MetaDatabase>> {
        self.databases_by_name.values()
    }

    /// Number of databases.
    pub fn len(&self) -> usize {
        self.databases_by_name.len()
    }

    /// Whether the snapshot holds no databases.
    pub fn is_empty(&self) -> bool {
        self.databases_by_name.is_empty()
    }
}

/// Builds a [`MetaSnapshot`].
#[derive(Debug, Default)]
pub struct MetaSnapshotBuilder {
    databases_by_name: HashMap<String, Arc<MetaDatabase>>,
}

impl MetaSnapshotBuilder {
    /// An empty snapshot.
    pub fn new() -> Self {
        MetaSnapshotBuilder::default()
    }

    /// Seeded from an existing snapshot, sharing its subtrees.
    pub fn from(other: &MetaSnapshot) -> Self {
        MetaSnapshotBuilder {
            databases_by_name: other.databases_by_name.clone(),
        }
    }

    /// Add a database, replacing any previous one with the same name.
    pub fn put_database(&mut self, database: Arc<MetaDatabase>) -> &mut Self {
        self.databases_by_name
            .insert(database.name().to_string(), database);
        self
    }

    /// Drop the database with the given name, if present.
    pub fn remove_database(&mut self, name: &str) -> &mut Self {
        self.databases_by_name.remove(name);
        self
    }

    /// Freeze into an immutable snapshot.
    pub fn build(self) -> MetaSnapshot {
        let databases_by_identifier = self
            .databases_by_name
            .values()
            .map(|database| (database.identifier().to_string(), Arc::clone(database)))
            .collect();
        MetaSnapshot {
            databases_by_name: self.databases_by_name,
            databases_by_identifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::MetaDocPartIndexColumn;
    use shred_core::FieldIndexOrdering;
    use static_assertions::assert_impl_all;

    assert_impl_all!(MetaSnapshot: Send, Sync);
    assert_impl_all!(MetaDocPart: Send, Sync);

    fn small_doc_part() -> MetaDocPart {
        let mut builder = MetaDocPartBuilder::new(PathKey::root(), "db_col");
        builder.put_field(MetaField {
            name: "age".into(),
            identifier: "db_col_age_i".into(),
            field_type: FieldType::Integer,
        });
        builder.put_field(MetaField {
            name: "age".into(),
            identifier: "db_col_age_s".into(),
            field_type: FieldType::String,
        });
        builder.put_scalar(MetaScalar {
            identifier: "db_col_v_i".into(),
            field_type: FieldType::Integer,
        });
        builder.build()
    }

    fn snapshot_with_one_collection() -> MetaSnapshot {
        let mut collection = MetaCollectionBuilder::new("users", "db_users");
        collection.put_doc_part(Arc::new(small_doc_part()));
        let mut database = MetaDatabaseBuilder::new("db", "db");
        database.put_collection(Arc::new(collection.build()));
        let mut snapshot = MetaSnapshotBuilder::new();
        snapshot.put_database(Arc::new(database.build()));
        snapshot.build()
    }

    // === Doc part lookups ===

    #[test]
    fn test_fields_named_returns_every_typed_variant() {
        let doc_part = small_doc_part();
        let named = doc_part.fields_named("age");
        assert_eq!(named.len(), 2);
        assert!(doc_part.fields_named("missing").is_empty());
    }

    #[test]
    fn test_field_by_name_and_type() {
        let doc_part = small_doc_part();
        let field = doc_part
            .field_by_name_and_type("age", FieldType::Integer)
            .unwrap();
        assert_eq!(field.identifier, "db_col_age_i");
        assert!(doc_part
            .field_by_name_and_type("age", FieldType::Double)
            .is_none());
    }

    #[test]
    fn test_index_with_same_columns_ignores_identifier() {
        let column = MetaDocPartIndexColumn {
            position: 0,
            identifier: "db_col_age_i".into(),
            ordering: FieldIndexOrdering::Asc,
        };
        let stored = MetaDocPartIndex {
            identifier: "db_col_idx_1".into(),
            unique: false,
            columns: vec![column.clone()],
        };
        let mut builder = MetaDocPartBuilder::from(&small_doc_part());
        builder.put_index(Arc::new(stored));
        let doc_part = builder.build();

        let probe = MetaDocPartIndex {
            identifier: "something_else".into(),
            unique: false,
            columns: vec![column],
        };
        assert!(doc_part.index_with_same_columns(&probe).is_some());
    }

    // === Row id allocation ===

    #[test]
    fn test_consume_rids_is_monotonic_and_batched() {
        let doc_part = small_doc_part();
        assert_eq!(doc_part.consume_rids(10), 0);
        assert_eq!(doc_part.consume_rids(5), 10);
        assert_eq!(doc_part.next_rid(), 15);
    }

    #[test]
    fn test_builder_carries_rid_counter_forward() {
        let doc_part = small_doc_part();
        doc_part.consume_rids(42);
        let rebuilt = MetaDocPartBuilder::from(&doc_part).build();
        assert_eq!(rebuilt.next_rid(), 42);
    }

    // === Structural sharing ===

    #[test]
    fn test_rebuilding_a_snapshot_shares_untouched_subtrees() {
        let snapshot = snapshot_with_one_collection();
        let original_db = Arc::clone(snapshot.database_by_name("db").unwrap());

        let rebuilt = MetaSnapshotBuilder::from(&snapshot).build();
        assert!(Arc::ptr_eq(
            &original_db,
            rebuilt.database_by_name("db").unwrap()
        ));
    }

    #[test]
    fn test_identifier_lookups_track_name_lookups() {
        let snapshot = snapshot_with_one_collection();
        let by_name = snapshot.database_by_name("db").unwrap();
        let by_id = snapshot.database_by_identifier("db").unwrap();
        assert!(Arc::ptr_eq(by_name, by_id));

        let collection = by_name.collection_by_name("users").unwrap();
        assert!(Arc::ptr_eq(
            collection,
            by_name.collection_by_identifier("db_users").unwrap()
        ));
        assert!(Arc::ptr_eq(
            collection.doc_part_by_path(&PathKey::root()).unwrap(),
            collection.doc_part_by_identifier("db_col").unwrap()
        ));
    }

    #[test]
    fn test_doc_parts_iterate_parents_before_children() {
        let mut collection = MetaCollectionBuilder::new("c", "c");
        let child = PathKey::root().child("a").child("b");
        let parent = PathKey::root().child("a");
        collection.put_doc_part(Arc::new(MetaDocPartBuilder::new(child, "c_a_b").build()));
        collection.put_doc_part(Arc::new(MetaDocPartBuilder::new(parent, "c_a").build()));
        collection.put_doc_part(Arc::new(
            MetaDocPartBuilder::new(PathKey::root(), "c").build(),
        ));
        let built = collection.build();
        let identifiers: Vec<&str> = built.doc_parts().map(|dp| dp.identifier()).collect();
        assert_eq!(identifiers, vec!["c", "c_a", "c_a_b"]);
    }

    // === Missing index combinations for a new field ===

    #[test]
    fn test_missing_indexes_for_new_field() {
        let index = MetaIndex {
            name: "idx_age".into(),
            unique: false,
            fields: vec![crate::entity::MetaIndexField {
                position: 0,
                path: PathKey::root(),
                field_name: "age".into(),
                ordering: FieldIndexOrdering::Asc,
            }],
        };
        let mut collection = MetaCollectionBuilder::new("users", "db_users");
        let doc_part = Arc::new(small_doc_part());
        collection.put_doc_part(Arc::clone(&doc_part));
        collection.put_index(Arc::new(index));
        let collection = collection.build();

        let new_field = doc_part
            .field_by_name_and_type("age", FieldType::String)
            .unwrap();
        let missing = collection.missing_indexes_for_new_field(doc_part.as_ref(), new_field);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].0.name, "idx_age");
        assert_eq!(missing[0].1, vec!["db_col_age_s".to_string()]);

        let unrelated = MetaField {
            name: "height".into(),
            identifier: "db_col_height_d".into(),
            field_type: FieldType::Double,
        };
        assert!(collection
            .missing_indexes_for_new_field(doc_part.as_ref(), &unrelated)
            .is_empty());
    }
}
