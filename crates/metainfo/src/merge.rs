//! Three-way snapshot merge
//!
//! A transaction forks a baseline snapshot, mutates its fork, and asks for
//! the delta to be applied to whatever snapshot is committed by then. The
//! merger walks the fork's changed elements top-down, resolves each one
//! against the current committed tree, and either grafts the change onto a
//! rebuilt spine or reports the first [`MergeConflict`] it finds.
//!
//! Resolution at each level is an identity check: the changed element is
//! looked up in the committed tree both by its logical key and by its
//! physical identifier. Both lookups hitting the same element means a
//! concurrent transaction already applied an equivalent change and the
//! merge degrades to a no-op for that element; both missing means the
//! change applies cleanly; anything else is a conflict. Index changes
//! additionally check that logical indexes and the physical indexes backing
//! them stay consistent with each other.

use crate::entity::{MetaDocPartIndex, MetaField, MetaScalar};
use crate::error::{EntityKind, MergeConflict};
use crate::immutable::{
    MetaCollection, MetaCollectionBuilder, MetaDatabase, MetaDatabaseBuilder, MetaDocPart,
    MetaDocPartBuilder, MetaSnapshot, MetaSnapshotBuilder,
};
use crate::mutable::{
    ElementState, MutableMetaCollection, MutableMetaDatabase, MutableMetaDocPart,
    MutableMetaIndex, MutableMetaSnapshot,
};
use shred_core::PathKey;
use std::sync::Arc;

/// Result alias for merge operations.
pub type MergeResult<T> = std::result::Result<T, MergeConflict>;

/// Merges one transaction's delta onto the current committed snapshot.
#[derive(Debug)]
pub struct SnapshotMerger<'a> {
    current: &'a MetaSnapshot,
    changed: &'a MutableMetaSnapshot,
}

// Outcome of the two-sided lookup of a changed element in the committed
// tree.
enum Resolution<T> {
    // Both lookups missed: the change applies cleanly.
    Absent,
    // Both lookups hit the same element: already applied elsewhere.
    Present(T),
}

fn resolve_shared<'t, T>(
    by_key: Option<&'t Arc<T>>,
    by_id: Option<&'t Arc<T>>,
) -> Option<Resolution<&'t Arc<T>>> {
    match (by_key, by_id) {
        (Some(a), Some(b)) if Arc::ptr_eq(a, b) => Some(Resolution::Present(a)),
        (None, None) => Some(Resolution::Absent),
        _ => None,
    }
}

fn resolve_value<'t, T: PartialEq>(
    by_key: Option<&'t T>,
    by_id: Option<&'t T>,
) -> Option<Resolution<&'t T>> {
    match (by_key, by_id) {
        (Some(a), Some(b)) if a == b => Some(Resolution::Present(a)),
        (None, None) => Some(Resolution::Absent),
        _ => None,
    }
}

impl<'a> SnapshotMerger<'a> {
    /// A merger for the given committed snapshot and transaction fork.
    pub fn new(current: &'a MetaSnapshot, changed: &'a MutableMetaSnapshot) -> Self {
        SnapshotMerger { current, changed }
    }

    /// Apply the fork's delta onto the committed snapshot, returning the
    /// merged snapshot or the first conflict found.
    pub fn merge(&self) -> MergeResult<MetaSnapshot> {
        tracing::trace!(
            changed_databases = self.changed.changed_databases().count(),
            "merging snapshot delta"
        );
        let mut builder = MetaSnapshotBuilder::from(self.current);
        for (database, state) in self.changed.changed_databases() {
            self.merge_database(&mut builder, database, state)?;
        }
        Ok(builder.build())
    }

    fn merge_database(
        &self,
        parent: &mut MetaSnapshotBuilder,
        changed: &MutableMetaDatabase,
        state: ElementState,
    ) -> MergeResult<()> {
        let by_name = self.current.database_by_name(changed.name());
        let by_id = self.current.database_by_identifier(changed.identifier());

        let resolution = resolve_shared(by_name, by_id).ok_or_else(|| match by_name {
            Some(existing) => MergeConflict::NameBoundToOtherIdentifier {
                kind: EntityKind::Database,
                name: changed.name().to_string(),
                existing_identifier: existing.identifier().to_string(),
                new_identifier: changed.identifier().to_string(),
            },
            None => MergeConflict::IdentifierBoundToOtherName {
                kind: EntityKind::Database,
                identifier: changed.identifier().to_string(),
                existing_name: by_id.map(|db| db.name().to_string()).unwrap_or_default(),
                new_name: changed.name().to_string(),
            },
        })?;

        match (state, resolution) {
            (ElementState::Added | ElementState::Modified, Resolution::Absent) => {
                parent.put_database(changed.immutable_copy());
            }
            (ElementState::Added | ElementState::Modified, Resolution::Present(current_db)) => {
                let mut child = MetaDatabaseBuilder::from(current_db);
                for (collection, state) in changed.changed_collections() {
                    self.merge_collection(current_db, &mut child, collection, state)?;
                }
                parent.put_database(Arc::new(child.build()));
            }
            (ElementState::Removed, Resolution::Absent) => {
                // Already removed by a concurrent transaction.
            }
            (ElementState::Removed, Resolution::Present(_)) => {
                parent.remove_database(changed.name());
            }
            (ElementState::NotChanged, _) => {}
        }
        Ok(())
    }

    fn merge_collection(
        &self,
        current_db: &MetaDatabase,
        parent: &mut MetaDatabaseBuilder,
        changed: &MutableMetaCollection,
        state: ElementState,
    ) -> MergeResult<()> {
        let by_name = current_db.collection_by_name(changed.name());
        let by_id = current_db.collection_by_identifier(changed.identifier());

        let resolution = resolve_shared(by_name, by_id).ok_or_else(|| match by_name {
            Some(existing) => MergeConflict::NameBoundToOtherIdentifier {
                kind: EntityKind::Collection,
                name: changed.name().to_string(),
                existing_identifier: existing.identifier().to_string(),
                new_identifier: changed.identifier().to_string(),
            },
            None => MergeConflict::IdentifierBoundToOtherName {
                kind: EntityKind::Collection,
                identifier: changed.identifier().to_string(),
                existing_name: by_id.map(|col| col.name().to_string()).unwrap_or_default(),
                new_name: changed.name().to_string(),
            },
        })?;

        match (state, resolution) {
            (ElementState::Added | ElementState::Modified, Resolution::Absent) => {
                parent.put_collection(changed.immutable_copy());
            }
            (ElementState::Added | ElementState::Modified, Resolution::Present(current_col)) => {
                let mut child = MetaCollectionBuilder::from(current_col);
                for doc_part in changed.changed_doc_parts() {
                    self.merge_doc_part(current_db, current_col, changed, &mut child, doc_part)?;
                }
                for (index, state) in changed.changed_indexes() {
                    self.merge_index(current_db, current_col, changed, &mut child, index, state)?;
                }
                parent.put_collection(Arc::new(child.build()));
            }
            (ElementState::Removed, Resolution::Absent) => {}
            (ElementState::Removed, Resolution::Present(_)) => {
                parent.remove_collection(changed.name());
            }
            (ElementState::NotChanged, _) => {}
        }
        Ok(())
    }

    fn merge_doc_part(
        &self,
        current_db: &MetaDatabase,
        current_col: &MetaCollection,
        changed_col: &MutableMetaCollection,
        parent: &mut MetaCollectionBuilder,
        changed: &MutableMetaDocPart,
    ) -> MergeResult<()> {
        use crate::entity::DocPartView;

        let by_path = current_col.doc_part_by_path(changed.path_key());
        let by_id = current_col.doc_part_by_identifier(changed.identifier());

        let resolution = resolve_shared(by_path, by_id).ok_or_else(|| match by_path {
            Some(existing) => MergeConflict::NameBoundToOtherIdentifier {
                kind: EntityKind::DocPart,
                name: changed.path_key().to_string(),
                existing_identifier: existing.identifier().to_string(),
                new_identifier: changed.identifier().to_string(),
            },
            None => MergeConflict::IdentifierBoundToOtherName {
                kind: EntityKind::DocPart,
                identifier: changed.identifier().to_string(),
                existing_name: by_id
                    .map(|doc_part| doc_part.path_key().to_string())
                    .unwrap_or_default(),
                new_name: changed.path_key().to_string(),
            },
        })?;

        let current_dp = match resolution {
            Resolution::Absent => {
                parent.put_doc_part(changed.immutable_copy());
                return Ok(());
            }
            Resolution::Present(current_dp) => current_dp,
        };

        let mut child = MetaDocPartBuilder::from(current_dp);
        for field in changed.added_fields() {
            self.merge_field(
                current_db,
                current_col,
                changed_col,
                changed,
                current_dp,
                &mut child,
                field,
            )?;
        }
        for scalar in changed.added_scalars() {
            self.merge_scalar(current_dp, &mut child, scalar)?;
        }
        for (doc_part_index, state) in changed.changed_indexes() {
            self.merge_doc_part_index(
                current_db,
                current_col,
                changed_col,
                changed,
                current_dp,
                &mut child,
                doc_part_index,
                state,
            )?;
        }
        parent.put_doc_part(Arc::new(child.build()));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_field(
        &self,
        current_db: &MetaDatabase,
        current_col: &MetaCollection,
        changed_col: &MutableMetaCollection,
        changed_dp: &MutableMetaDocPart,
        current_dp: &MetaDocPart,
        parent: &mut MetaDocPartBuilder,
        changed: &MetaField,
    ) -> MergeResult<()> {
        use crate::entity::DocPartView;

        let by_name_and_type =
            current_dp.field_by_name_and_type(&changed.name, changed.field_type);
        let by_id = current_dp.field(&changed.identifier);

        let resolution =
            resolve_value(by_name_and_type, by_id).ok_or_else(|| match by_name_and_type {
                Some(existing) => MergeConflict::NameBoundToOtherIdentifier {
                    kind: EntityKind::Field,
                    name: format!("{} of type {}", changed.name, changed.field_type),
                    existing_identifier: existing.identifier.clone(),
                    new_identifier: changed.identifier.clone(),
                },
                None => MergeConflict::IdentifierBoundToOtherName {
                    kind: EntityKind::Field,
                    identifier: changed.identifier.clone(),
                    existing_name: by_id
                        .map(|field| format!("{} of type {}", field.name, field.field_type))
                        .unwrap_or_default(),
                    new_name: format!("{} of type {}", changed.name, changed.field_type),
                },
            })?;

        if let Resolution::Absent = resolution {
            if let Some(index) = changed_col.any_missed_index_for_new_field(
                current_col,
                current_dp,
                changed,
            ) {
                return Err(MergeConflict::MissingDocPartIndexForField {
                    database: current_db.name().to_string(),
                    collection: current_col.name().to_string(),
                    index,
                    path: changed_dp.path_key().clone(),
                    field: changed.name.clone(),
                });
            }
            parent.put_field(changed.clone());
        }
        Ok(())
    }

    fn merge_scalar(
        &self,
        current_dp: &MetaDocPart,
        parent: &mut MetaDocPartBuilder,
        changed: &MetaScalar,
    ) -> MergeResult<()> {
        let by_type = current_dp.scalar(changed.field_type);
        let by_id = current_dp
            .scalars()
            .find(|scalar| scalar.identifier == changed.identifier);

        let resolution = resolve_value(by_type, by_id).ok_or_else(|| match by_type {
            Some(existing) => MergeConflict::NameBoundToOtherIdentifier {
                kind: EntityKind::Scalar,
                name: changed.field_type.to_string(),
                existing_identifier: existing.identifier.clone(),
                new_identifier: changed.identifier.clone(),
            },
            None => MergeConflict::IdentifierBoundToOtherName {
                kind: EntityKind::Scalar,
                identifier: changed.identifier.clone(),
                existing_name: by_id
                    .map(|scalar| scalar.field_type.to_string())
                    .unwrap_or_default(),
                new_name: changed.field_type.to_string(),
            },
        })?;

        if let Resolution::Absent = resolution {
            parent.put_scalar(changed.clone());
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_doc_part_index(
        &self,
        current_db: &MetaDatabase,
        current_col: &MetaCollection,
        changed_col: &MutableMetaCollection,
        changed_dp: &MutableMetaDocPart,
        current_dp: &MetaDocPart,
        parent: &mut MetaDocPartBuilder,
        changed: &Arc<MetaDocPartIndex>,
        state: ElementState,
    ) -> MergeResult<()> {
        use crate::entity::DocPartView;

        let by_id = current_dp.index(&changed.identifier);
        let by_same_columns = current_dp.index_with_same_columns(changed);

        match state {
            ElementState::Added | ElementState::Modified => {
                if changed_col
                    .any_related_index(current_col, changed_dp, changed)
                    .is_none()
                {
                    return Err(MergeConflict::UnbackedDocPartIndex {
                        database: current_db.name().to_string(),
                        collection: current_col.name().to_string(),
                        path: changed_dp.path_key().clone(),
                        doc_part_index: changed.identifier.clone(),
                    });
                }

                let current_index = match by_id {
                    None => {
                        parent.put_index(Arc::clone(changed));
                        return Ok(());
                    }
                    Some(current_index) => current_index,
                };

                // Same identifier on both sides: merge column by column.
                let mut merged = (**current_index).clone();
                for column in &changed.columns {
                    let by_identifier = current_index
                        .columns
                        .iter()
                        .find(|other| other.identifier == column.identifier);
                    let by_position = current_index
                        .columns
                        .iter()
                        .find(|other| other.position == column.position);
                    match resolve_value(by_identifier, by_position) {
                        Some(Resolution::Present(_)) => {}
                        Some(Resolution::Absent) => merged.columns.push(column.clone()),
                        None => {
                            let existing = by_identifier.or(by_position);
                            return Err(MergeConflict::DocPartIndexColumnMismatch {
                                database: current_db.name().to_string(),
                                collection: current_col.name().to_string(),
                                path: changed_dp.path_key().clone(),
                                doc_part_index: changed.identifier.clone(),
                                existing_identifier: existing
                                    .map(|other| other.identifier.clone())
                                    .unwrap_or_default(),
                                existing_position: existing
                                    .map(|other| other.position)
                                    .unwrap_or_default(),
                                new_identifier: column.identifier.clone(),
                                new_position: column.position,
                            });
                        }
                    }
                }
                merged.columns.sort_by_key(|column| column.position);
                parent.put_index(Arc::new(merged));
            }
            ElementState::Removed => {
                if let Some(index) = changed_col
                    .any_missed_index_for_removed_doc_part_index(current_col, changed)
                {
                    return Err(MergeConflict::RemovedDocPartIndexStillRequired {
                        database: current_db.name().to_string(),
                        collection: current_col.name().to_string(),
                        path: changed_dp.path_key().clone(),
                        doc_part_index: changed.identifier.clone(),
                        index,
                    });
                }
                if by_id.is_none() || by_same_columns.is_none() {
                    // Already gone, or replaced by an equivalent index.
                    return Ok(());
                }
                parent.remove_index(&changed.identifier);
            }
            ElementState::NotChanged => {}
        }
        Ok(())
    }

    fn merge_index(
        &self,
        current_db: &MetaDatabase,
        current_col: &MetaCollection,
        changed_col: &MutableMetaCollection,
        parent: &mut MetaCollectionBuilder,
        changed: &MutableMetaIndex,
        state: ElementState,
    ) -> MergeResult<()> {
        let changed_index = changed.as_index();
        let by_name = current_col.index_by_name(&changed_index.name);

        match state {
            ElementState::Added | ElementState::Modified => {
                if let Some(existing) =
                    changed_col.any_conflicting_index(current_col, changed_index)
                {
                    return Err(MergeConflict::ConflictingIndex {
                        database: current_db.name().to_string(),
                        collection: current_col.name().to_string(),
                        new_index: changed_index.name.clone(),
                        existing_index: existing,
                    });
                }
                if let Some(path) = changed_col
                    .any_doc_part_with_missing_doc_part_index(current_col, changed_index)
                {
                    return Err(MergeConflict::MissingDocPartIndex {
                        database: current_db.name().to_string(),
                        collection: current_col.name().to_string(),
                        index: changed_index.name.clone(),
                        path,
                    });
                }

                let current_index = match by_name {
                    None => {
                        parent.put_index(changed.immutable_copy());
                        return Ok(());
                    }
                    Some(current_index) => current_index,
                };

                // Same name on both sides: merge field by field.
                let mut merged = (**current_index).clone();
                for field in &changed_index.fields {
                    let by_path_and_name = current_index.fields.iter().find(|other| {
                        other.path == field.path && other.field_name == field.field_name
                    });
                    let by_position = current_index
                        .fields
                        .iter()
                        .find(|other| other.position == field.position);
                    match resolve_value(by_path_and_name, by_position) {
                        Some(Resolution::Present(_)) => {}
                        Some(Resolution::Absent) => merged.fields.push(field.clone()),
                        None => {
                            let existing = by_path_and_name.or(by_position);
                            return Err(MergeConflict::IndexFieldMismatch {
                                database: current_db.name().to_string(),
                                collection: current_col.name().to_string(),
                                index: changed_index.name.clone(),
                                existing_field: existing
                                    .map(|other| other.field_name.clone())
                                    .unwrap_or_default(),
                                existing_path: existing
                                    .map(|other| other.path.clone())
                                    .unwrap_or_else(PathKey::root),
                                existing_position: existing
                                    .map(|other| other.position)
                                    .unwrap_or_default(),
                                new_field: field.field_name.clone(),
                                new_path: field.path.clone(),
                                new_position: field.position,
                            });
                        }
                    }
                }
                merged.fields.sort_by_key(|field| field.position);
                parent.put_index(Arc::new(merged));
            }
            ElementState::Removed => {
                if let Some((path, doc_part_index)) =
                    changed_col.any_orphan_doc_part_index(current_col, changed_index)
                {
                    return Err(MergeConflict::OrphanedDocPartIndex {
                        database: current_db.name().to_string(),
                        collection: current_col.name().to_string(),
                        path,
                        doc_part_index,
                        index: changed_index.name.clone(),
                    });
                }
                if by_name.is_none() {
                    return Ok(());
                }
                parent.remove_index(&changed_index.name);
            }
            ElementState::NotChanged => {}
        }
        Ok(())
    }
}
