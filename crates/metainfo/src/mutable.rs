//! The mutable snapshot: a private overlay on a committed baseline
//!
//! Forking a committed snapshot yields a [`MutableMetaSnapshot`]: a tree of
//! wrappers, one per baseline node, each pairing the shared immutable node
//! with the additions and removals made by this transaction. Reads combine
//! both layers, so a transaction always sees its own writes; the baseline
//! itself is never touched.
//!
//! Each tracked child carries an [`ElementState`]. States are only stored
//! for explicit additions and removals; modification is derived from the
//! overlays on the way out, so a wrapper that was only read never marks its
//! parent dirty.

use crate::entity::{
    missing_indexes_for_new_field, DocPartView, MetaDocPartIndex, MetaDocPartIndexRef, MetaField,
    MetaIndex, MetaIndexField, MetaIndexRef, MetaScalar,
};
use crate::error::{EntityKind, StructuralError};
use crate::immutable::{
    MetaCollection, MetaCollectionBuilder, MetaDatabase, MetaDatabaseBuilder, MetaDocPart,
    MetaDocPartBuilder, MetaSnapshot, MetaSnapshotBuilder,
};
use shred_core::{FieldIndexOrdering, FieldType, PathKey};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

// Insert (overwriting any tombstone under the same key) and hand back the
// stored value without a second lookup.
fn insert_and_get<K: Eq + Hash, V>(map: &mut HashMap<K, V>, key: K, value: V) -> &mut V {
    match map.entry(key) {
        Entry::Occupied(mut occupied) => {
            occupied.insert(value);
            occupied.into_mut()
        }
        Entry::Vacant(vacant) => vacant.insert(value),
    }
}

/// How a tracked element differs from the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    /// Present in the baseline and untouched so far
    NotChanged,
    /// Created by this transaction
    Added,
    /// Present in the baseline and changed by this transaction
    Modified,
    /// Present in the baseline and removed by this transaction
    Removed,
}

impl ElementState {
    /// Whether the element is visible to reads on this snapshot.
    pub fn is_alive(self) -> bool {
        !matches!(self, ElementState::Removed)
    }

    /// Whether the element carries a delta the merge must process.
    pub fn has_changed(self) -> bool {
        !matches!(self, ElementState::NotChanged)
    }
}

/// Result alias for mutable snapshot operations.
pub type Result<T> = std::result::Result<T, StructuralError>;

// ---------------------------------------------------------------------------
// Doc part
// ---------------------------------------------------------------------------

/// Mutable view of one doc part: the wrapped immutable doc part plus the
/// fields, scalars, and physical indexes this transaction added or removed.
#[derive(Debug)]
pub struct MutableMetaDocPart {
    wrapped: Arc<MetaDocPart>,
    added: bool,
    // Combined view: baseline fields plus added ones.
    fields_by_identifier: HashMap<String, MetaField>,
    field_identifiers_by_name: HashMap<String, Vec<String>>,
    added_field_identifiers: Vec<String>,
    added_scalars: HashMap<FieldType, MetaScalar>,
    indexes: HashMap<String, (MetaDocPartIndexRef, ElementState)>,
}

impl MutableMetaDocPart {
    fn wrapping(wrapped: Arc<MetaDocPart>, added: bool) -> Self {
        let mut fields_by_identifier = HashMap::new();
        let mut field_identifiers_by_name: HashMap<String, Vec<String>> = HashMap::new();
        for field in wrapped.fields() {
            fields_by_identifier.insert(field.identifier.clone(), field.clone());
            field_identifiers_by_name
                .entry(field.name.clone())
                .or_default()
                .push(field.identifier.clone());
        }
        let indexes = wrapped
            .indexes()
            .map(|index| {
                (
                    index.identifier.clone(),
                    (Arc::clone(index), ElementState::NotChanged),
                )
            })
            .collect();
        MutableMetaDocPart {
            wrapped,
            added,
            fields_by_identifier,
            field_identifiers_by_name,
            added_field_identifiers: Vec::new(),
            added_scalars: HashMap::new(),
            indexes,
        }
    }

    /// Backend table identifier.
    pub fn identifier(&self) -> &str {
        self.wrapped.identifier()
    }

    /// Add a typed field. Fails if the `(name, type)` pair or the
    /// identifier is already taken in the combined view.
    pub fn add_field(
        &mut self,
        name: &str,
        identifier: &str,
        field_type: FieldType,
    ) -> Result<&MetaField> {
        if self.field_by_name_and_type(name, field_type).is_some() {
            return Err(StructuralError::AlreadyExists {
                kind: EntityKind::Field,
                key: format!("{} of type {}", name, field_type),
            });
        }
        if self.fields_by_identifier.contains_key(identifier) {
            return Err(StructuralError::IdentifierInUse {
                kind: EntityKind::Field,
                identifier: identifier.to_string(),
            });
        }
        let field = MetaField {
            name: name.to_string(),
            identifier: identifier.to_string(),
            field_type,
        };
        self.field_identifiers_by_name
            .entry(name.to_string())
            .or_default()
            .push(identifier.to_string());
        self.added_field_identifiers.push(identifier.to_string());
        Ok(insert_and_get(
            &mut self.fields_by_identifier,
            identifier.to_string(),
            field,
        ))
    }

    /// Add a scalar column. Fails if a scalar of that type already exists.
    pub fn add_scalar(&mut self, identifier: &str, field_type: FieldType) -> Result<&MetaScalar> {
        if self.scalar(field_type).is_some() {
            return Err(StructuralError::AlreadyExists {
                kind: EntityKind::Scalar,
                key: field_type.to_string(),
            });
        }
        let scalar = MetaScalar {
            identifier: identifier.to_string(),
            field_type,
        };
        Ok(insert_and_get(&mut self.added_scalars, field_type, scalar))
    }

    /// Add a complete physical index. Fails if its identifier is alive.
    pub fn add_index(&mut self, index: MetaDocPartIndex) -> Result<&MetaDocPartIndexRef> {
        if self.index_by_identifier(&index.identifier).is_some() {
            return Err(StructuralError::IdentifierInUse {
                kind: EntityKind::DocPartIndex,
                identifier: index.identifier.clone(),
            });
        }
        let identifier = index.identifier.clone();
        let entry = insert_and_get(
            &mut self.indexes,
            identifier,
            (Arc::new(index), ElementState::Added),
        );
        Ok(&entry.0)
    }

    /// Remove the physical index with the given identifier.
    pub fn remove_index(&mut self, identifier: &str) -> Result<()> {
        match self.indexes.get_mut(identifier) {
            Some(entry) if entry.1.is_alive() => {
                entry.1 = ElementState::Removed;
                Ok(())
            }
            _ => Err(StructuralError::NotFound {
                kind: EntityKind::DocPartIndex,
                key: identifier.to_string(),
            }),
        }
    }

    /// The field with the given name and type in the combined view.
    pub fn field_by_name_and_type(&self, name: &str, field_type: FieldType) -> Option<&MetaField> {
        self.field_identifiers_by_name
            .get(name)?
            .iter()
            .filter_map(|id| self.fields_by_identifier.get(id))
            .find(|field| field.field_type == field_type)
    }

    /// All fields in the combined view.
    pub fn fields(&self) -> impl Iterator<Item = &MetaField> {
        self.fields_by_identifier.values()
    }

    /// The scalar of the given type in the combined view.
    pub fn scalar(&self, field_type: FieldType) -> Option<&MetaScalar> {
        self.added_scalars
            .get(&field_type)
            .or_else(|| self.wrapped.scalar(field_type))
    }

    /// The alive physical index with the given identifier.
    pub fn index_by_identifier(&self, identifier: &str) -> Option<&MetaDocPartIndexRef> {
        self.indexes
            .get(identifier)
            .filter(|(_, state)| state.is_alive())
            .map(|(index, _)| index)
    }

    /// All alive physical indexes.
    pub fn indexes(&self) -> impl Iterator<Item = &MetaDocPartIndexRef> {
        self.indexes
            .values()
            .filter(|(_, state)| state.is_alive())
            .map(|(index, _)| index)
    }

    /// Fields added by this transaction, in addition order.
    pub fn added_fields(&self) -> impl Iterator<Item = &MetaField> {
        self.added_field_identifiers
            .iter()
            .filter_map(|id| self.fields_by_identifier.get(id))
    }

    /// Scalars added by this transaction.
    pub fn added_scalars(&self) -> impl Iterator<Item = &MetaScalar> {
        self.added_scalars.values()
    }

    /// Physical indexes added or removed by this transaction.
    pub fn changed_indexes(&self) -> impl Iterator<Item = (&MetaDocPartIndexRef, ElementState)> {
        self.indexes
            .values()
            .filter(|(_, state)| state.has_changed())
            .map(|(index, state)| (index, *state))
    }

    /// Whether this doc part is new or carries any overlay.
    pub fn has_changes(&self) -> bool {
        self.added
            || !self.added_field_identifiers.is_empty()
            || !self.added_scalars.is_empty()
            || self.indexes.values().any(|(_, state)| state.has_changed())
    }

    /// Freeze the combined view. Shares the wrapped doc part when nothing
    /// changed.
    pub fn immutable_copy(&self) -> Arc<MetaDocPart> {
        if !self.has_changes() {
            return Arc::clone(&self.wrapped);
        }
        let mut builder = MetaDocPartBuilder::from(&self.wrapped);
        for field in self.added_fields() {
            builder.put_field(field.clone());
        }
        for scalar in self.added_scalars.values() {
            builder.put_scalar(scalar.clone());
        }
        for (index, state) in self.indexes.values() {
            match state {
                ElementState::Added | ElementState::Modified => {
                    builder.put_index(Arc::clone(index));
                }
                ElementState::Removed => {
                    builder.remove_index(&index.identifier);
                }
                ElementState::NotChanged => {}
            }
        }
        Arc::new(builder.build())
    }
}

impl DocPartView for MutableMetaDocPart {
    fn path_key(&self) -> &PathKey {
        self.wrapped.path_key()
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

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Mutable view of one logical index. Fields are appended in position
/// order while the index is being declared.
#[derive(Debug)]
pub struct MutableMetaIndex {
    inner: MetaIndex,
    dirty: bool,
}

impl MutableMetaIndex {
    fn new(name: &str, unique: bool) -> Self {
        MutableMetaIndex {
            inner: MetaIndex {
                name: name.to_string(),
                unique,
                fields: Vec::new(),
            },
            dirty: false,
        }
    }

    fn wrapping(index: &MetaIndex) -> Self {
        MutableMetaIndex {
            inner: index.clone(),
            dirty: false,
        }
    }

    /// Append a field at the next position.
    pub fn add_field(
        &mut self,
        path: PathKey,
        field_name: &str,
        ordering: FieldIndexOrdering,
    ) -> &MetaIndexField {
        let position = self.inner.fields.len() as u32;
        self.inner.fields.push(MetaIndexField {
            position,
            path,
            field_name: field_name.to_string(),
            ordering,
        });
        self.dirty = true;
        &self.inner.fields[position as usize]
    }

    /// The combined value of this index.
    pub fn as_index(&self) -> &MetaIndex {
        &self.inner
    }

    /// Freeze the combined value.
    pub fn immutable_copy(&self) -> MetaIndexRef {
        Arc::new(self.inner.clone())
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// Mutable view of one collection: every baseline doc part eagerly
/// wrapped, plus the logical indexes with their change states.
#[derive(Debug)]
pub struct MutableMetaCollection {
    wrapped: Arc<MetaCollection>,
    doc_parts: HashMap<PathKey, MutableMetaDocPart>,
    indexes: HashMap<String, (MutableMetaIndex, ElementState)>,
}

impl MutableMetaCollection {
    fn wrapping(wrapped: Arc<MetaCollection>) -> Self {
        let doc_parts = wrapped
            .doc_parts()
            .map(|doc_part| {
                (
                    doc_part.path_key().clone(),
                    MutableMetaDocPart::wrapping(Arc::clone(doc_part), false),
                )
            })
            .collect();
        let indexes = wrapped
            .indexes()
            .map(|index| {
                (
                    index.name.clone(),
                    (
                        MutableMetaIndex::wrapping(index),
                        ElementState::NotChanged,
                    ),
                )
            })
            .collect();
        MutableMetaCollection {
            wrapped,
            doc_parts,
            indexes,
        }
    }

    fn created(name: &str, identifier: &str) -> Self {
        MutableMetaCollection::wrapping(Arc::new(
            MetaCollectionBuilder::new(name, identifier).build(),
        ))
    }

    /// User-visible collection name.
    pub fn name(&self) -> &str {
        self.wrapped.name()
    }

    /// Backend identifier.
    pub fn identifier(&self) -> &str {
        self.wrapped.identifier()
    }

    /// Add an empty doc part at the given path. Fails if the path or the
    /// table identifier is already taken.
    pub fn add_doc_part(
        &mut self,
        path: PathKey,
        identifier: &str,
    ) -> Result<&mut MutableMetaDocPart> {
        if self.doc_parts.contains_key(&path) {
            return Err(StructuralError::AlreadyExists {
                kind: EntityKind::DocPart,
                key: path.to_string(),
            });
        }
        if self
            .doc_parts
            .values()
            .any(|doc_part| doc_part.identifier() == identifier)
        {
            return Err(StructuralError::IdentifierInUse {
                kind: EntityKind::DocPart,
                identifier: identifier.to_string(),
            });
        }
        let empty = Arc::new(MetaDocPartBuilder::new(path.clone(), identifier).build());
        Ok(insert_and_get(
            &mut self.doc_parts,
            path,
            MutableMetaDocPart::wrapping(empty, true),
        ))
    }

    /// The doc part at the given path.
    pub fn doc_part_by_path(&self, path: &PathKey) -> Option<&MutableMetaDocPart> {
        self.doc_parts.get(path)
    }

    /// Mutable access to the doc part at the given path.
    pub fn doc_part_by_path_mut(&mut self, path: &PathKey) -> Option<&mut MutableMetaDocPart> {
        self.doc_parts.get_mut(path)
    }

    /// All doc parts in the combined view.
    pub fn doc_parts(&self) -> impl Iterator<Item = &MutableMetaDocPart> {
        self.doc_parts.values()
    }

    /// Declare a new empty logical index. Fails if the name is alive.
    pub fn add_index(&mut self, name: &str, unique: bool) -> Result<&mut MutableMetaIndex> {
        if self.index_by_name(name).is_some() {
            return Err(StructuralError::AlreadyExists {
                kind: EntityKind::Index,
                key: name.to_string(),
            });
        }
        let entry = insert_and_get(
            &mut self.indexes,
            name.to_string(),
            (MutableMetaIndex::new(name, unique), ElementState::Added),
        );
        Ok(&mut entry.0)
    }

    /// Remove the logical index with the given name.
    pub fn remove_index(&mut self, name: &str) -> Result<()> {
        match self.indexes.get_mut(name) {
            Some(entry) if entry.1.is_alive() => {
                entry.1 = ElementState::Removed;
                Ok(())
            }
            _ => Err(StructuralError::NotFound {
                kind: EntityKind::Index,
                key: name.to_string(),
            }),
        }
    }

    /// The alive logical index with the given name.
    pub fn index_by_name(&self, name: &str) -> Option<&MutableMetaIndex> {
        self.indexes
            .get(name)
            .filter(|(_, state)| state.is_alive())
            .map(|(index, _)| index)
    }

    /// All alive logical indexes.
    pub fn indexes(&self) -> impl Iterator<Item = &MutableMetaIndex> {
        self.indexes
            .values()
            .filter(|(_, state)| state.is_alive())
            .map(|(index, _)| index)
    }

    /// Logical indexes whose effective state differs from the baseline.
    pub fn changed_indexes(&self) -> impl Iterator<Item = (&MutableMetaIndex, ElementState)> {
        self.indexes
            .values()
            .map(|(index, state)| (index, effective_index_state(index, *state)))
            .filter(|(_, state)| state.has_changed())
    }

    /// Doc parts that are new or carry overlays.
    pub fn changed_doc_parts(&self) -> impl Iterator<Item = &MutableMetaDocPart> {
        self.doc_parts
            .values()
            .filter(|doc_part| doc_part.has_changes())
    }

    /// Whether this collection carries any delta.
    pub fn has_changes(&self) -> bool {
        self.changed_doc_parts().next().is_some() || self.changed_indexes().next().is_some()
    }

    /// Freeze the combined view. Shares the wrapped collection when
    /// nothing changed.
    pub fn immutable_copy(&self) -> Arc<MetaCollection> {
        if !self.has_changes() {
            return Arc::clone(&self.wrapped);
        }
        let mut builder = MetaCollectionBuilder::from(&self.wrapped);
        for doc_part in self.changed_doc_parts() {
            builder.put_doc_part(doc_part.immutable_copy());
        }
        for (index, state) in self.indexes.values() {
            match effective_index_state(index, *state) {
                ElementState::Added | ElementState::Modified => {
                    builder.put_index(index.immutable_copy());
                }
                ElementState::Removed => {
                    builder.remove_index(&index.as_index().name);
                }
                ElementState::NotChanged => {}
            }
        }
        Arc::new(builder.build())
    }

    /// The identifier combinations needing a new physical index on the doc
    /// part once the given field lands, judged against this transaction's
    /// alive indexes.
    pub fn missing_indexes_for_new_field(
        &self,
        path: &PathKey,
        new_field: &MetaField,
    ) -> Vec<(&MetaIndex, Vec<String>)> {
        match self.doc_parts.get(path) {
            Some(doc_part) => missing_indexes_for_new_field(
                self.indexes().map(MutableMetaIndex::as_index),
                doc_part,
                new_field,
            ),
            None => Vec::new(),
        }
    }

    // --- Merge support -----------------------------------------------------
    //
    // The queries below are evaluated by the snapshot merger with
    // `committed` being the collection in the snapshot being merged onto,
    // while `self` carries this transaction's delta.

    /// A committed index that references the new field's name on the doc
    /// part and is left without a matching physical index by this delta.
    pub fn any_missed_index_for_new_field(
        &self,
        committed: &MetaCollection,
        old_doc_part: &MetaDocPart,
        new_field: &MetaField,
    ) -> Option<String> {
        let new_doc_part = self.doc_parts.get(old_doc_part.path_key())?;
        committed
            .indexes()
            .find(|old_index| {
                let references_name = old_index
                    .fields_for(old_doc_part.path_key())
                    .any(|field| field.field_name == new_field.name);
                references_name
                    && (self.index_by_name(&old_index.name).is_none()
                        || old_index
                            .doc_part_index_identifiers(new_doc_part)
                            .into_iter()
                            .filter(|identifiers| identifiers.contains(&new_field.identifier))
                            .any(|identifiers| {
                                !new_doc_part.indexes().any(|doc_part_index| {
                                    old_index.is_match(new_doc_part, &identifiers, doc_part_index)
                                })
                            }))
            })
            .map(|index| index.name.clone())
    }

    /// A committed index that still needs the physical index this delta
    /// removed.
    pub fn any_missed_index_for_removed_doc_part_index(
        &self,
        committed: &MetaCollection,
        removed: &MetaDocPartIndex,
    ) -> Option<String> {
        for old_index in committed.indexes() {
            for path in old_index.paths() {
                let old_doc_part = match committed.doc_part_by_path(path) {
                    Some(doc_part) => doc_part,
                    None => continue,
                };
                let index_also_removed = self.changed_indexes().any(|(index, state)| {
                    state == ElementState::Removed && index.as_index().name == old_index.name
                });
                if old_index.is_compatible(old_doc_part.as_ref(), removed) && !index_also_removed {
                    return Some(old_index.name.clone());
                }
            }
        }
        None
    }

    /// Any index, from this delta or committed, that the given new
    /// physical index can serve.
    pub fn any_related_index(
        &self,
        committed: &MetaCollection,
        new_doc_part: &MutableMetaDocPart,
        new_doc_part_index: &MetaDocPartIndex,
    ) -> Option<String> {
        self.changed_indexes()
            .map(|(index, _)| index.as_index())
            .find(|index| index.is_compatible(new_doc_part, new_doc_part_index))
            .map(|index| index.name.clone())
            .or_else(|| {
                committed
                    .indexes()
                    .find(|index| index.is_compatible(new_doc_part, new_doc_part_index))
                    .map(|index| index.name.clone())
            })
    }

    /// A committed index interchangeable with the one this delta adds,
    /// unless the delta also removes it.
    pub fn any_conflicting_index(
        &self,
        committed: &MetaCollection,
        new_index: &MetaIndex,
    ) -> Option<String> {
        committed
            .indexes()
            .find(|index| {
                index.matches_index(new_index)
                    && !self.changed_indexes().any(|(removed, state)| {
                        state == ElementState::Removed && removed.as_index().name == index.name
                    })
            })
            .map(|index| index.name.clone())
    }

    /// A committed doc part on which the index this delta adds lacks a
    /// matching physical index, counting the ones the delta adds.
    pub fn any_doc_part_with_missing_doc_part_index(
        &self,
        committed: &MetaCollection,
        new_index: &MetaIndex,
    ) -> Option<PathKey> {
        for path in new_index.paths() {
            let old_doc_part = match committed.doc_part_by_path(path) {
                Some(doc_part) => doc_part,
                None => continue,
            };
            if !new_index.is_compatible_with_doc_part(old_doc_part.as_ref()) {
                continue;
            }
            let new_doc_part = self.doc_parts.get(path);
            let uncovered = new_index
                .doc_part_index_identifiers(old_doc_part.as_ref())
                .into_iter()
                .filter(|identifiers| {
                    !old_doc_part.indexes().any(|doc_part_index| {
                        new_index.is_match(old_doc_part.as_ref(), identifiers, doc_part_index)
                    })
                })
                .any(|identifiers| match new_doc_part {
                    Some(new_doc_part) => !new_doc_part
                        .changed_indexes()
                        .filter(|(_, state)| *state != ElementState::Removed)
                        .any(|(doc_part_index, _)| {
                            new_index.is_match(new_doc_part, &identifiers, doc_part_index)
                        }),
                    None => true,
                });
            if uncovered {
                return Some(path.clone());
            }
        }
        None
    }

    /// A committed physical index that only the index this delta removes
    /// required, and that the delta did not remove alongside.
    pub fn any_orphan_doc_part_index(
        &self,
        committed: &MetaCollection,
        removed_index: &MetaIndex,
    ) -> Option<(PathKey, String)> {
        for path in removed_index.paths() {
            let old_doc_part = match committed.doc_part_by_path(path) {
                Some(doc_part) => doc_part,
                None => continue,
            };
            if !removed_index.is_compatible_with_doc_part(old_doc_part.as_ref()) {
                continue;
            }
            for old_doc_part_index in old_doc_part.indexes() {
                if !removed_index.is_compatible(old_doc_part.as_ref(), old_doc_part_index) {
                    continue;
                }
                let also_removed_here = self.doc_parts.get(path).is_some_and(|new_doc_part| {
                    new_doc_part.changed_indexes().any(|(index, state)| {
                        state == ElementState::Removed
                            && index.identifier == old_doc_part_index.identifier
                    })
                });
                if also_removed_here {
                    continue;
                }
                let still_required = committed.indexes().any(|old_index| {
                    old_index.is_compatible(old_doc_part.as_ref(), old_doc_part_index)
                        && !self.changed_indexes().any(|(index, state)| {
                            state == ElementState::Removed
                                && index.as_index().name == old_index.name
                        })
                });
                if !still_required {
                    return Some((path.clone(), old_doc_part_index.identifier.clone()));
                }
            }
        }
        None
    }
}

fn effective_index_state(index: &MutableMetaIndex, stored: ElementState) -> ElementState {
    if stored == ElementState::NotChanged && index.dirty {
        ElementState::Modified
    } else {
        stored
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Mutable view of one database.
#[derive(Debug)]
pub struct MutableMetaDatabase {
    wrapped: Arc<MetaDatabase>,
    collections: HashMap<String, (MutableMetaCollection, ElementState)>,
}

impl MutableMetaDatabase {
    fn wrapping(wrapped: Arc<MetaDatabase>) -> Self {
        let collections = wrapped
            .collections()
            .map(|collection| {
                (
                    collection.name().to_string(),
                    (
                        MutableMetaCollection::wrapping(Arc::clone(collection)),
                        ElementState::NotChanged,
                    ),
                )
            })
            .collect();
        MutableMetaDatabase {
            wrapped,
            collections,
        }
    }

    fn created(name: &str, identifier: &str) -> Self {
        MutableMetaDatabase::wrapping(Arc::new(MetaDatabaseBuilder::new(name, identifier).build()))
    }

    /// User-visible database name.
    pub fn name(&self) -> &str {
        self.wrapped.name()
    }

    /// Backend schema identifier.
    pub fn identifier(&self) -> &str {
        self.wrapped.identifier()
    }

    /// Add an empty collection. Fails if the name or identifier is alive.
    pub fn add_collection(
        &mut self,
        name: &str,
        identifier: &str,
    ) -> Result<&mut MutableMetaCollection> {
        if self.collection_by_name(name).is_some() {
            return Err(StructuralError::AlreadyExists {
                kind: EntityKind::Collection,
                key: name.to_string(),
            });
        }
        if self
            .collections()
            .any(|collection| collection.identifier() == identifier)
        {
            return Err(StructuralError::IdentifierInUse {
                kind: EntityKind::Collection,
                identifier: identifier.to_string(),
            });
        }
        let entry = insert_and_get(
            &mut self.collections,
            name.to_string(),
            (
                MutableMetaCollection::created(name, identifier),
                ElementState::Added,
            ),
        );
        Ok(&mut entry.0)
    }

    /// Remove the collection with the given name.
    pub fn remove_collection(&mut self, name: &str) -> Result<()> {
        match self.collections.get_mut(name) {
            Some(entry) if entry.1.is_alive() => {
                entry.1 = ElementState::Removed;
                Ok(())
            }
            _ => Err(StructuralError::NotFound {
                kind: EntityKind::Collection,
                key: name.to_string(),
            }),
        }
    }

    /// The alive collection with the given name.
    pub fn collection_by_name(&self, name: &str) -> Option<&MutableMetaCollection> {
        self.collections
            .get(name)
            .filter(|(_, state)| state.is_alive())
            .map(|(collection, _)| collection)
    }

    /// Mutable access to the alive collection with the given name.
    pub fn collection_by_name_mut(&mut self, name: &str) -> Option<&mut MutableMetaCollection> {
        self.collections
            .get_mut(name)
            .filter(|(_, state)| state.is_alive())
            .map(|(collection, _)| collection)
    }

    /// All alive collections.
    pub fn collections(&self) -> impl Iterator<Item = &MutableMetaCollection> {
        self.collections
            .values()
            .filter(|(_, state)| state.is_alive())
            .map(|(collection, _)| collection)
    }

    /// Collections whose effective state differs from the baseline.
    pub fn changed_collections(
        &self,
    ) -> impl Iterator<Item = (&MutableMetaCollection, ElementState)> {
        self.collections
            .values()
            .map(|(collection, state)| {
                let effective = if *state == ElementState::NotChanged && collection.has_changes() {
                    ElementState::Modified
                } else {
                    *state
                };
                (collection, effective)
            })
            .filter(|(_, state)| state.has_changed())
    }

    /// Whether this database carries any delta.
    pub fn has_changes(&self) -> bool {
        self.changed_collections().next().is_some()
    }

    /// Freeze the combined view. Shares the wrapped database when nothing
    /// changed.
    pub fn immutable_copy(&self) -> Arc<MetaDatabase> {
        if !self.has_changes() {
            return Arc::clone(&self.wrapped);
        }
        let mut builder = MetaDatabaseBuilder::from(&self.wrapped);
        for (collection, state) in self.changed_collections() {
            match state {
                ElementState::Added | ElementState::Modified => {
                    builder.put_collection(collection.immutable_copy());
                }
                ElementState::Removed => {
                    builder.remove_collection(collection.name());
                }
                ElementState::NotChanged => {}
            }
        }
        Arc::new(builder.build())
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Mutable view of a whole snapshot, forked from a committed baseline.
#[derive(Debug)]
pub struct MutableMetaSnapshot {
    baseline: Arc<MetaSnapshot>,
    databases: HashMap<String, (MutableMetaDatabase, ElementState)>,
}

impl MutableMetaSnapshot {
    /// Fork the given committed snapshot.
    pub fn new(baseline: Arc<MetaSnapshot>) -> Self {
        let databases = baseline
            .databases()
            .map(|database| {
                (
                    database.name().to_string(),
                    (
                        MutableMetaDatabase::wrapping(Arc::clone(database)),
                        ElementState::NotChanged,
                    ),
                )
            })
            .collect();
        MutableMetaSnapshot {
            baseline,
            databases,
        }
    }

    /// The committed snapshot this fork started from.
    pub fn baseline(&self) -> &Arc<MetaSnapshot> {
        &self.baseline
    }

    /// Add an empty database. Fails if the name or identifier is alive.
    pub fn add_database(
        &mut self,
        name: &str,
        identifier: &str,
    ) -> Result<&mut MutableMetaDatabase> {
        if self.database_by_name(name).is_some() {
            return Err(StructuralError::AlreadyExists {
                kind: EntityKind::Database,
                key: name.to_string(),
            });
        }
        if self
            .databases()
            .any(|database| database.identifier() == identifier)
        {
            return Err(StructuralError::IdentifierInUse {
                kind: EntityKind::Database,
                identifier: identifier.to_string(),
            });
        }
        let entry = insert_and_get(
            &mut self.databases,
            name.to_string(),
            (
                MutableMetaDatabase::created(name, identifier),
                ElementState::Added,
            ),
        );
        Ok(&mut entry.0)
    }

    /// Remove the database with the given name.
    pub fn remove_database(&mut self, name: &str) -> Result<()> {
        match self.databases.get_mut(name) {
            Some(entry) if entry.1.is_alive() => {
                entry.1 = ElementState::Removed;
                Ok(())
            }
            _ => Err(StructuralError::NotFound {
                kind: EntityKind::Database,
                key: name.to_string(),
            }),
        }
    }

    /// The alive database with the given name.
    pub fn database_by_name(&self, name: &str) -> Option<&MutableMetaDatabase> {
        self.databases
            .get(name)
            .filter(|(_, state)| state.is_alive())
            .map(|(database, _)| database)
    }

    /// Mutable access to the alive database with the given name.
    pub fn database_by_name_mut(&mut self, name: &str) -> Option<&mut MutableMetaDatabase> {
        self.databases
            .get_mut(name)
            .filter(|(_, state)| state.is_alive())
            .map(|(database, _)| database)
    }

    /// All alive databases.
    pub fn databases(&self) -> impl Iterator<Item = &MutableMetaDatabase> {
        self.databases
            .values()
            .filter(|(_, state)| state.is_alive())
            .map(|(database, _)| database)
    }

    /// Databases whose effective state differs from the baseline.
    pub fn changed_databases(&self) -> impl Iterator<Item = (&MutableMetaDatabase, ElementState)> {
        self.databases
            .values()
            .map(|(database, state)| {
                let effective = if *state == ElementState::NotChanged && database.has_changes() {
                    ElementState::Modified
                } else {
                    *state
                };
                (database, effective)
            })
            .filter(|(_, state)| state.has_changed())
    }

    /// Whether this fork carries any delta.
    pub fn has_changes(&self) -> bool {
        self.changed_databases().next().is_some()
    }

    /// Freeze the combined view onto the baseline. Shares the baseline
    /// when nothing changed.
    pub fn immutable_copy(&self) -> Arc<MetaSnapshot> {
        if !self.has_changes() {
            return Arc::clone(&self.baseline);
        }
        let mut builder = MetaSnapshotBuilder::from(&self.baseline);
        for (database, state) in self.changed_databases() {
            match state {
                ElementState::Added | ElementState::Modified => {
                    builder.put_database(database.immutable_copy());
                }
                ElementState::Removed => {
                    builder.remove_database(database.name());
                }
                ElementState::NotChanged => {}
            }
        }
        Arc::new(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::MetaDocPartIndexColumn;

    fn committed_snapshot() -> Arc<MetaSnapshot> {
        let mut snapshot = MutableMetaSnapshot::new(Arc::new(MetaSnapshot::empty()));
        let database = snapshot.add_database("db", "db").unwrap();
        let collection = database.add_collection("users", "db_users").unwrap();
        let root = collection
            .add_doc_part(PathKey::root(), "db_users")
            .unwrap();
        root.add_field("name", "db_users_name_s", FieldType::String)
            .unwrap();
        snapshot.immutable_copy()
    }

    // === Read-your-own-writes ===

    #[test]
    fn test_fork_sees_its_own_additions() {
        let mut fork = MutableMetaSnapshot::new(committed_snapshot());
        let database = fork.database_by_name_mut("db").unwrap();
        let collection = database.collection_by_name_mut("users").unwrap();
        let doc_part = collection.doc_part_by_path_mut(&PathKey::root()).unwrap();
        doc_part
            .add_field("age", "db_users_age_i", FieldType::Integer)
            .unwrap();

        let read_back = fork
            .database_by_name("db")
            .unwrap()
            .collection_by_name("users")
            .unwrap()
            .doc_part_by_path(&PathKey::root())
            .unwrap();
        assert!(read_back
            .field_by_name_and_type("age", FieldType::Integer)
            .is_some());
        assert!(read_back
            .field_by_name_and_type("name", FieldType::String)
            .is_some());
    }

    #[test]
    fn test_fork_does_not_touch_the_baseline() {
        let baseline = committed_snapshot();
        let mut fork = MutableMetaSnapshot::new(Arc::clone(&baseline));
        fork.database_by_name_mut("db")
            .unwrap()
            .collection_by_name_mut("users")
            .unwrap()
            .doc_part_by_path_mut(&PathKey::root())
            .unwrap()
            .add_field("age", "db_users_age_i", FieldType::Integer)
            .unwrap();

        let committed_doc_part = baseline
            .database_by_name("db")
            .unwrap()
            .collection_by_name("users")
            .unwrap()
            .doc_part_by_path(&PathKey::root())
            .unwrap();
        assert!(committed_doc_part
            .field_by_name_and_type("age", FieldType::Integer)
            .is_none());
    }

    // === Structural errors ===

    #[test]
    fn test_duplicate_additions_are_rejected() {
        let mut fork = MutableMetaSnapshot::new(committed_snapshot());
        assert!(matches!(
            fork.add_database("db", "other_id"),
            Err(StructuralError::AlreadyExists { .. })
        ));

        let doc_part = fork
            .database_by_name_mut("db")
            .unwrap()
            .collection_by_name_mut("users")
            .unwrap()
            .doc_part_by_path_mut(&PathKey::root())
            .unwrap();
        assert!(matches!(
            doc_part.add_field("name", "db_users_name_x", FieldType::String),
            Err(StructuralError::AlreadyExists { .. })
        ));
        assert!(matches!(
            doc_part.add_field("other", "db_users_name_s", FieldType::String),
            Err(StructuralError::IdentifierInUse { .. })
        ));
    }

    #[test]
    fn test_removing_an_absent_entity_is_an_error() {
        let mut fork = MutableMetaSnapshot::new(committed_snapshot());
        assert!(matches!(
            fork.remove_database("missing"),
            Err(StructuralError::NotFound { .. })
        ));
        fork.remove_database("db").unwrap();
        // Already removed, so no longer alive.
        assert!(matches!(
            fork.remove_database("db"),
            Err(StructuralError::NotFound { .. })
        ));
    }

    #[test]
    fn test_removed_entities_become_invisible() {
        let mut fork = MutableMetaSnapshot::new(committed_snapshot());
        fork.database_by_name_mut("db")
            .unwrap()
            .remove_collection("users")
            .unwrap();
        assert!(fork
            .database_by_name("db")
            .unwrap()
            .collection_by_name("users")
            .is_none());
    }

    // === Change tracking and freezing ===

    #[test]
    fn test_untouched_fork_freezes_to_the_same_tree() {
        let baseline = committed_snapshot();
        let fork = MutableMetaSnapshot::new(Arc::clone(&baseline));
        assert!(!fork.has_changes());
        assert!(Arc::ptr_eq(&fork.immutable_copy(), &baseline));
    }

    #[test]
    fn test_only_touched_spine_is_rebuilt() {
        let baseline = {
            let mut snapshot = MutableMetaSnapshot::new(Arc::new(MetaSnapshot::empty()));
            snapshot.add_database("a", "a").unwrap();
            snapshot.add_database("b", "b").unwrap();
            snapshot.immutable_copy()
        };
        let mut fork = MutableMetaSnapshot::new(Arc::clone(&baseline));
        fork.database_by_name_mut("a")
            .unwrap()
            .add_collection("c", "a_c")
            .unwrap();
        let frozen = fork.immutable_copy();
        assert!(Arc::ptr_eq(
            frozen.database_by_name("b").unwrap(),
            baseline.database_by_name("b").unwrap()
        ));
        assert!(!Arc::ptr_eq(
            frozen.database_by_name("a").unwrap(),
            baseline.database_by_name("a").unwrap()
        ));
    }

    #[test]
    fn test_effective_states_bubble_up() {
        let mut fork = MutableMetaSnapshot::new(committed_snapshot());
        assert_eq!(fork.changed_databases().count(), 0);

        fork.database_by_name_mut("db")
            .unwrap()
            .collection_by_name_mut("users")
            .unwrap()
            .doc_part_by_path_mut(&PathKey::root())
            .unwrap()
            .add_scalar("db_users_v_i", FieldType::Integer)
            .unwrap();

        let changed: Vec<ElementState> =
            fork.changed_databases().map(|(_, state)| state).collect();
        assert_eq!(changed, vec![ElementState::Modified]);
    }

    #[test]
    fn test_index_declaration_and_removal_round_trip() {
        let mut fork = MutableMetaSnapshot::new(committed_snapshot());
        let collection = fork
            .database_by_name_mut("db")
            .unwrap()
            .collection_by_name_mut("users")
            .unwrap();
        let index = collection.add_index("idx_name", false).unwrap();
        index.add_field(PathKey::root(), "name", FieldIndexOrdering::Asc);
        assert_eq!(collection.index_by_name("idx_name").unwrap().as_index().size(), 1);

        let frozen = fork.immutable_copy();
        let frozen_collection = frozen
            .database_by_name("db")
            .unwrap()
            .collection_by_name("users")
            .unwrap();
        assert!(frozen_collection.index_by_name("idx_name").is_some());

        let mut second = MutableMetaSnapshot::new(frozen);
        second
            .database_by_name_mut("db")
            .unwrap()
            .collection_by_name_mut("users")
            .unwrap()
            .remove_index("idx_name")
            .unwrap();
        let refrozen = second.immutable_copy();
        assert!(refrozen
            .database_by_name("db")
            .unwrap()
            .collection_by_name("users")
            .unwrap()
            .index_by_name("idx_name")
            .is_none());
    }

    #[test]
    fn test_doc_part_index_add_and_remove() {
        let mut fork = MutableMetaSnapshot::new(committed_snapshot());
        let doc_part = fork
            .database_by_name_mut("db")
            .unwrap()
            .collection_by_name_mut("users")
            .unwrap()
            .doc_part_by_path_mut(&PathKey::root())
            .unwrap();
        doc_part
            .add_index(MetaDocPartIndex {
                identifier: "db_users_idx_1".into(),
                unique: false,
                columns: vec![MetaDocPartIndexColumn {
                    position: 0,
                    identifier: "db_users_name_s".into(),
                    ordering: FieldIndexOrdering::Asc,
                }],
            })
            .unwrap();
        assert!(doc_part.index_by_identifier("db_users_idx_1").is_some());
        doc_part.remove_index("db_users_idx_1").unwrap();
        assert!(doc_part.index_by_identifier("db_users_idx_1").is_none());
        assert!(matches!(
            doc_part.remove_index("db_users_idx_1"),
            Err(StructuralError::NotFound { .. })
        ));
    }
}
