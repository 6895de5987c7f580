//! Leaf entities of the schema tree
//!
//! Fields, scalars, logical indexes, and physical doc part indexes are
//! plain value types shared verbatim between immutable and mutable
//! snapshots. The interesting logic lives on [`MetaIndex`]: the
//! compatibility and matching predicates that tie a declared logical index
//! to the physical indexes that back it on each doc part.

use serde::{Deserialize, Serialize};
use shred_core::{FieldIndexOrdering, FieldType, PathKey};
use std::sync::Arc;

/// Read access to a doc part's path and fields, implemented by both the
/// immutable and the mutable representation so index predicates can be
/// evaluated against either side of a merge.
pub trait DocPartView {
    /// The doc part's path key.
    fn path_key(&self) -> &PathKey;

    /// The field owning the given column identifier, if any.
    fn field_by_identifier(&self, identifier: &str) -> Option<&MetaField>;

    /// Every field carrying the given name, one per observed type.
    fn fields_named(&self, name: &str) -> Vec<&MetaField>;
}

/// A typed field of a doc part: one backend column.
///
/// The same field name may appear several times on a doc part, once per
/// observed type; `(name, field_type)` is the logical key and `identifier`
/// the physical one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaField {
    /// Document-level field name
    pub name: String,
    /// Backend column identifier, unique within the doc part
    pub identifier: String,
    /// Stored type
    pub field_type: FieldType,
}

/// A scalar column of a doc part, keyed by type alone.
///
/// Scalars carry the values of heterogeneous array elements, which have a
/// position instead of a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaScalar {
    /// Backend column identifier, unique within the doc part
    pub identifier: String,
    /// Stored type
    pub field_type: FieldType,
}

/// One position of a logical index: a document path, a field name on that
/// path, and a sort direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaIndexField {
    /// Zero-based position within the owning index
    pub position: u32,
    /// Path of the doc part this position indexes
    pub path: PathKey,
    /// Field name on that doc part
    pub field_name: String,
    /// Sort direction
    pub ordering: FieldIndexOrdering,
}

impl MetaIndexField {
    /// Whether this index position can be served by the given field.
    ///
    /// Child pointers are structural, not values, so they are never
    /// indexable.
    pub fn accepts_field(&self, field: &MetaField) -> bool {
        self.field_name == field.name && field.field_type != FieldType::Child
    }

    /// Whether the doc part carries at least one indexable field with this
    /// position's name.
    pub fn is_compatible_with<D: DocPartView + ?Sized>(&self, doc_part: &D) -> bool {
        self.path == *doc_part.path_key()
            && doc_part
                .fields_named(&self.field_name)
                .iter()
                .any(|field| self.accepts_field(field))
    }

    /// Whether a physical index column can serve this position: its column
    /// must resolve to an indexable field of the right name, with the same
    /// sort direction.
    pub fn is_compatible_column<D: DocPartView + ?Sized>(
        &self,
        doc_part: &D,
        column: &MetaDocPartIndexColumn,
    ) -> bool {
        matches!(
            doc_part.field_by_identifier(&column.identifier),
            Some(field) if self.accepts_field(field)
        ) && self.ordering == column.ordering
    }

    /// [`Self::is_compatible_column`] narrowed to one concrete column
    /// identifier.
    pub fn is_match_column<D: DocPartView + ?Sized>(
        &self,
        doc_part: &D,
        identifier: &str,
        column: &MetaDocPartIndexColumn,
    ) -> bool {
        self.is_compatible_column(doc_part, column) && column.identifier == identifier
    }

    /// Positional equality against a field of another index.
    pub fn matches_field(&self, other: &MetaIndexField) -> bool {
        self.position == other.position
            && self.path == other.path
            && self.field_name == other.field_name
            && self.ordering == other.ordering
    }
}

/// A declared logical index on a collection.
///
/// A logical index spans document paths; on the backend it is realized by
/// one physical [`MetaDocPartIndex`] per combination of typed columns its
/// field names resolve to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaIndex {
    /// User-visible index name, unique within the collection
    pub name: String,
    /// Whether the index enforces uniqueness
    pub unique: bool,
    /// Fields in position order
    pub fields: Vec<MetaIndexField>,
}

impl MetaIndex {
    /// Number of index positions.
    pub fn size(&self) -> usize {
        self.fields.len()
    }

    /// Fields of this index on the given doc part path, in position order.
    pub fn fields_for<'a>(
        &'a self,
        path: &'a PathKey,
    ) -> impl Iterator<Item = &'a MetaIndexField> {
        self.fields.iter().filter(move |field| field.path == *path)
    }

    /// The distinct doc part paths this index touches, in first-appearance
    /// order.
    pub fn paths(&self) -> Vec<&PathKey> {
        let mut seen: Vec<&PathKey> = Vec::new();
        for field in &self.fields {
            if !seen.contains(&&field.path) {
                seen.push(&field.path);
            }
        }
        seen
    }

    /// Whether the index touches the doc part and every one of its
    /// positions there resolves to at least one indexable field.
    pub fn is_compatible_with_doc_part<D: DocPartView + ?Sized>(&self, doc_part: &D) -> bool {
        let mut touched = false;
        for field in self.fields_for(doc_part.path_key()) {
            touched = true;
            if !field.is_compatible_with(doc_part) {
                return false;
            }
        }
        touched
    }

    /// Whether the physical index could serve this index on the doc part:
    /// same uniqueness and a column-for-position pairing where every pair
    /// is compatible.
    pub fn is_compatible<D: DocPartView + ?Sized>(
        &self,
        doc_part: &D,
        doc_part_index: &MetaDocPartIndex,
    ) -> bool {
        if self.unique != doc_part_index.unique {
            return false;
        }
        let mut index_fields = self.fields_for(doc_part.path_key()).peekable();
        if index_fields.peek().is_none() {
            return false;
        }
        let mut columns = doc_part_index.columns.iter();
        loop {
            match (index_fields.next(), columns.next()) {
                (Some(field), Some(column)) => {
                    if !field.is_compatible_column(doc_part, column) {
                        return false;
                    }
                }
                (None, None) => return true,
                _ => return false,
            }
        }
    }

    /// Whether the physical index realizes exactly the given column
    /// identifier combination of this index on the doc part.
    pub fn is_match<D: DocPartView + ?Sized>(
        &self,
        doc_part: &D,
        identifiers: &[String],
        doc_part_index: &MetaDocPartIndex,
    ) -> bool {
        if self.unique != doc_part_index.unique {
            return false;
        }
        let mut index_fields = self.fields_for(doc_part.path_key()).peekable();
        if index_fields.peek().is_none() {
            return false;
        }
        let mut columns = doc_part_index.columns.iter();
        let mut ids = identifiers.iter();
        loop {
            match (index_fields.next(), columns.next(), ids.next()) {
                (Some(field), Some(column), Some(identifier)) => {
                    if !field.is_match_column(doc_part, identifier, column) {
                        return false;
                    }
                }
                (None, None, None) => return true,
                _ => return false,
            }
        }
    }

    /// Whether the other index is interchangeable with this one: same name,
    /// or same uniqueness and the same fields position by position.
    pub fn matches_index(&self, other: &MetaIndex) -> bool {
        if self.name == other.name {
            return true;
        }
        self.unique == other.unique
            && self.size() == other.size()
            && self
                .fields
                .iter()
                .zip(other.fields.iter())
                .all(|(mine, theirs)| mine.matches_field(theirs))
    }

    /// Every column identifier combination this index requires a physical
    /// index for on the given doc part: the cartesian product, position by
    /// position, of the identifiers of the doc part's fields carrying each
    /// position's name.
    ///
    /// Positions whose name resolves to no field contribute nothing, so a
    /// field name absent from the doc part shrinks the requirement instead
    /// of blocking it.
    pub fn doc_part_index_identifiers<D: DocPartView + ?Sized>(
        &self,
        doc_part: &D,
    ) -> Vec<Vec<String>> {
        let mut combinations: Vec<Vec<String>> = Vec::new();
        for index_field in self.fields_for(doc_part.path_key()) {
            let identifiers: Vec<&str> = doc_part
                .fields_named(&index_field.field_name)
                .iter()
                .map(|field| field.identifier.as_str())
                .collect();
            if identifiers.is_empty() {
                continue;
            }
            if combinations.is_empty() {
                combinations = identifiers
                    .iter()
                    .map(|id| vec![(*id).to_string()])
                    .collect();
            } else {
                let mut extended = Vec::with_capacity(combinations.len() * identifiers.len());
                for combination in &combinations {
                    for id in &identifiers {
                        let mut next = combination.clone();
                        next.push((*id).to_string());
                        extended.push(next);
                    }
                }
                combinations = extended;
            }
        }
        combinations
    }
}

/// One ordered column of a physical doc part index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDocPartIndexColumn {
    /// Zero-based position within the owning index
    pub position: u32,
    /// Backend column identifier
    pub identifier: String,
    /// Sort direction
    pub ordering: FieldIndexOrdering,
}

/// A physical backend index on one doc part table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDocPartIndex {
    /// Backend index identifier, unique within the doc part
    pub identifier: String,
    /// Whether the backend index enforces uniqueness
    pub unique: bool,
    /// Columns in position order
    pub columns: Vec<MetaDocPartIndexColumn>,
}

impl MetaDocPartIndex {
    /// Column identifiers in position order.
    pub fn column_identifiers(&self) -> Vec<&str> {
        self.columns
            .iter()
            .map(|column| column.identifier.as_str())
            .collect()
    }

    /// Whether both indexes cover the same columns with the same sort
    /// directions and uniqueness, identifiers aside.
    pub fn has_same_columns(&self, other: &MetaDocPartIndex) -> bool {
        self.unique == other.unique
            && self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(other.columns.iter())
                .all(|(mine, theirs)| {
                    mine.identifier == theirs.identifier && mine.ordering == theirs.ordering
                })
    }
}

/// Shared handle to an immutable logical index.
pub type MetaIndexRef = Arc<MetaIndex>;

/// Shared handle to an immutable physical doc part index.
pub type MetaDocPartIndexRef = Arc<MetaDocPartIndex>;

/// For each given index referencing the new field's name on the doc part,
/// the column identifier combinations that now require a physical index
/// because they include the new field's column.
///
/// Combinations are deduplicated across indexes; the first index requiring
/// a combination is the one reported for it.
pub fn missing_indexes_for_new_field<'a, D, I>(
    indexes: I,
    doc_part: &D,
    new_field: &MetaField,
) -> Vec<(&'a MetaIndex, Vec<String>)>
where
    D: DocPartView + ?Sized,
    I: IntoIterator<Item = &'a MetaIndex>,
{
    let mut seen: Vec<Vec<String>> = Vec::new();
    let mut missing = Vec::new();
    for index in indexes {
        let references_name = index
            .fields_for(doc_part.path_key())
            .any(|field| field.field_name == new_field.name);
        if !references_name {
            continue;
        }
        for identifiers in index.doc_part_index_identifiers(doc_part) {
            if !identifiers.contains(&new_field.identifier) || seen.contains(&identifiers) {
                continue;
            }
            seen.push(identifiers.clone());
            missing.push((index, identifiers));
        }
    }
    missing
}
