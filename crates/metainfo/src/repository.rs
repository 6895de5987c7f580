//! The MVCC repository holding the committed snapshot
//!
//! One [`MvccMetainfoRepository`] owns the committed schema of the whole
//! server. Readers take a cheap `Arc` handle to the current snapshot and
//! keep seeing it unchanged however long they hold it; writers fork a
//! mutable snapshot, mutate it privately, and commit the delta through the
//! snapshot merger.
//!
//! Commits are serialized by a dedicated merge lock so at most one merge
//! runs at a time, while the snapshot pointer itself sits behind a
//! read-write lock that readers only hold for the duration of one pointer
//! clone. A reader never blocks a writer for longer than that.

use crate::error::MergeConflict;
use crate::immutable::MetaSnapshot;
use crate::merge::SnapshotMerger;
use crate::mutable::MutableMetaSnapshot;
use parking_lot::{Mutex, RwLock};
use shred_core::{PathKey, RidGenerator, UnknownDocPart};
use std::sync::Arc;

/// Shared owner of the committed metadata snapshot.
#[derive(Debug)]
pub struct MvccMetainfoRepository {
    current: RwLock<Arc<MetaSnapshot>>,
    merge_lock: Mutex<()>,
}

/// A scoped read stage: the snapshot it observes is pinned when the stage
/// opens and stays frozen however many merges commit afterwards.
#[derive(Debug)]
pub struct SnapshotStage {
    snapshot: Arc<MetaSnapshot>,
}

impl SnapshotStage {
    /// The committed snapshot as of the moment the stage opened.
    pub fn current(&self) -> &Arc<MetaSnapshot> {
        &self.snapshot
    }

    /// Fork the pinned snapshot into a private mutable one.
    pub fn fork(&self) -> MutableMetaSnapshot {
        MutableMetaSnapshot::new(Arc::clone(&self.snapshot))
    }
}

/// A scoped write stage holding one fork's delta, ready to commit.
///
/// The fork is only borrowed: on a conflict it is handed back to the caller
/// untouched, though the useful move is to discard it and re-fork.
#[derive(Debug)]
pub struct MergeStage<'a, 'b> {
    repository: &'a MvccMetainfoRepository,
    changed: &'b MutableMetaSnapshot,
}

impl MergeStage<'_, '_> {
    /// Attempt to publish the delta.
    pub fn commit(self) -> Result<Arc<MetaSnapshot>, MergeConflict> {
        self.repository.commit(self.changed)
    }
}

impl MvccMetainfoRepository {
    /// A repository starting from an empty snapshot.
    pub fn new() -> Self {
        MvccMetainfoRepository::with_snapshot(MetaSnapshot::empty())
    }

    /// A repository starting from a recovered snapshot, e.g. one rebuilt
    /// from the backend's catalog tables at startup.
    pub fn with_snapshot(snapshot: MetaSnapshot) -> Self {
        MvccMetainfoRepository {
            current: RwLock::new(Arc::new(snapshot)),
            merge_lock: Mutex::new(()),
        }
    }

    /// A handle to the currently committed snapshot.
    pub fn snapshot(&self) -> Arc<MetaSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Fork the currently committed snapshot into a private mutable one.
    pub fn fork(&self) -> MutableMetaSnapshot {
        MutableMetaSnapshot::new(self.snapshot())
    }

    /// Open a read stage pinned to the currently committed snapshot.
    pub fn open_snapshot_stage(&self) -> SnapshotStage {
        SnapshotStage {
            snapshot: self.snapshot(),
        }
    }

    /// Open a write stage around a fork's delta.
    pub fn open_merge_stage<'a, 'b>(
        &'a self,
        changed: &'b MutableMetaSnapshot,
    ) -> MergeStage<'a, 'b> {
        MergeStage {
            repository: self,
            changed,
        }
    }

    /// Merge a fork's delta onto the committed snapshot and publish the
    /// result.
    ///
    /// The delta always goes through the [`SnapshotMerger`], even when the
    /// committed snapshot is still the fork's baseline: the merger is the
    /// sole gatekeeper of the index consistency rules, and a delta that
    /// violates them must not land just because no other writer got in
    /// first. On a [`MergeConflict`] nothing is published and the caller
    /// may re-fork and retry.
    pub fn commit(
        &self,
        changed: &MutableMetaSnapshot,
    ) -> Result<Arc<MetaSnapshot>, MergeConflict> {
        let _serialized = self.merge_lock.lock();
        let current = self.snapshot();
        if !changed.has_changes() {
            return Ok(current);
        }
        if !Arc::ptr_eq(&current, changed.baseline()) {
            tracing::debug!("baseline is stale, replaying delta against the current snapshot");
        }
        let merged = match SnapshotMerger::new(&current, changed).merge() {
            Ok(merged) => Arc::new(merged),
            Err(conflict) => {
                tracing::warn!(%conflict, "merge conflict, delta not applied");
                return Err(conflict);
            }
        };
        *self.current.write() = Arc::clone(&merged);
        tracing::debug!(databases = merged.len(), "committed snapshot");
        Ok(merged)
    }
}

impl Default for MvccMetainfoRepository {
    fn default() -> Self {
        MvccMetainfoRepository::new()
    }
}

impl RidGenerator for MvccMetainfoRepository {
    fn consume_rids(
        &self,
        database: &str,
        collection: &str,
        path: &PathKey,
        count: u64,
    ) -> Result<u64, UnknownDocPart> {
        let snapshot = self.snapshot();
        let doc_part = snapshot
            .database_by_name(database)
            .and_then(|db| db.collection_by_name(collection))
            .and_then(|col| col.doc_part_by_path(path))
            .ok_or_else(|| UnknownDocPart {
                database: database.to_string(),
                collection: collection.to_string(),
                path: path.clone(),
            })?;
        Ok(doc_part.consume_rids(count))
    }
}
