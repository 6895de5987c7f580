//! End-to-end tests of the schema transaction flow
//!
//! Exercised here:
//! - fork → mutate → commit → DDL application against a recording backend
//! - snapshot isolation across threads
//! - the conflict → re-fork → retry loop embedders are expected to run
//! - order independence of disjoint schema deltas
//! - merge behavior under randomized concurrent database creation

use parking_lot::Mutex;
use proptest::prelude::*;
use shreddb::{
    BackendResult, ColumnSpec, DefaultIdentifierFactory, Error, FieldIndexOrdering, FieldType,
    IdentifierFactory, IndexColumnSpec, MetaDocPartIndex, MetaDocPartIndexColumn, MetaSnapshot,
    MutableMetaSnapshot, MvccMetainfoRepository, PathKey, RidGenerator, SchemaDiffApplier,
    StorageDialect,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

// ============================================================================
// Helpers
// ============================================================================

/// A dialect that records which DDL operations were issued.
#[derive(Debug, Default)]
struct RecordingDialect {
    operations: Mutex<Vec<String>>,
}

impl RecordingDialect {
    fn operations(&self) -> Vec<String> {
        self.operations.lock().clone()
    }

    fn push(&self, op: String) -> BackendResult<()> {
        self.operations.lock().push(op);
        Ok(())
    }
}

impl StorageDialect for RecordingDialect {
    fn create_schema(&self, schema: &str) -> BackendResult<()> {
        self.push(format!("create_schema {}", schema))
    }

    fn drop_schema(&self, schema: &str) -> BackendResult<()> {
        self.push(format!("drop_schema {}", schema))
    }

    fn create_doc_part_table(
        &self,
        schema: &str,
        table: &str,
        _columns: &[ColumnSpec],
    ) -> BackendResult<()> {
        self.push(format!("create_table {}.{}", schema, table))
    }

    fn drop_doc_part_table(&self, schema: &str, table: &str) -> BackendResult<()> {
        self.push(format!("drop_table {}.{}", schema, table))
    }

    fn add_column(
        &self,
        schema: &str,
        table: &str,
        column: &str,
        _field_type: FieldType,
    ) -> BackendResult<()> {
        self.push(format!("add_column {}.{}.{}", schema, table, column))
    }

    fn create_index(
        &self,
        name: &str,
        schema: &str,
        table: &str,
        _columns: &[IndexColumnSpec],
        _unique: bool,
    ) -> BackendResult<()> {
        self.push(format!("create_index {} on {}.{}", name, schema, table))
    }

    fn drop_index(&self, schema: &str, name: &str) -> BackendResult<()> {
        self.push(format!("drop_index {}.{}", schema, name))
    }

    fn rename_table(&self, schema: &str, from: &str, to: &str) -> BackendResult<()> {
        self.push(format!("rename_table {}.{} to {}", schema, from, to))
    }

    fn rename_index(&self, schema: &str, from: &str, to: &str) -> BackendResult<()> {
        self.push(format!("rename_index {}.{} to {}", schema, from, to))
    }
}

/// Run a schema transaction with the standard retry loop: on a retryable
/// error, re-fork from the latest snapshot and replay.
fn transact<F>(repository: &MvccMetainfoRepository, mut mutate: F) -> Result<(), Error>
where
    F: FnMut(&mut MutableMetaSnapshot) -> Result<(), Error>,
{
    loop {
        let mut fork = repository.fork();
        mutate(&mut fork)?;
        match repository.commit(&fork) {
            Ok(_) => return Ok(()),
            Err(conflict) => {
                let err = Error::from(conflict);
                if !err.is_retryable() {
                    return Err(err);
                }
            }
        }
    }
}

fn database_names(snapshot: &MetaSnapshot) -> BTreeSet<String> {
    snapshot
        .databases()
        .map(|db| db.name().to_string())
        .collect()
}

// ============================================================================
// Full lifecycle
// ============================================================================

#[test]
fn test_schema_transaction_down_to_ddl() {
    let repository = MvccMetainfoRepository::new();
    let before = repository.snapshot();

    let mut fork = repository.fork();
    let collection = fork
        .add_database("blog", "blog")
        .unwrap()
        .add_collection("posts", "blog_posts")
        .unwrap();
    let root = collection
        .add_doc_part(PathKey::root(), "blog_posts")
        .unwrap();
    root.add_field("title", "blog_posts_title_s", FieldType::String)
        .unwrap();
    collection
        .add_doc_part(PathKey::root().child("comments"), "blog_posts_comments")
        .unwrap();
    let after = repository.commit(&fork).unwrap();

    let dialect = RecordingDialect::default();
    SchemaDiffApplier::new(&dialect)
        .apply(&before, &after)
        .unwrap();
    assert_eq!(
        dialect.operations(),
        vec![
            "create_schema blog",
            "create_table blog.blog_posts",
            "create_table blog.blog_posts_comments",
        ]
    );

    // Row ids flow from the committed doc part.
    assert_eq!(
        repository
            .consume_rids("blog", "posts", &PathKey::root(), 3)
            .unwrap(),
        0
    );
    assert_eq!(
        repository
            .consume_rids("blog", "posts", &PathKey::root(), 1)
            .unwrap(),
        3
    );
}

#[test]
fn test_index_lifecycle_down_to_ddl() {
    let repository = MvccMetainfoRepository::new();
    transact(&repository, |fork| {
        fork.add_database("blog", "blog")?
            .add_collection("posts", "blog_posts")?
            .add_doc_part(PathKey::root(), "blog_posts")?
            .add_field("title", "blog_posts_title_s", FieldType::String)?;
        Ok(())
    })
    .unwrap();
    let before = repository.snapshot();

    transact(&repository, |fork| {
        let collection = fork
            .database_by_name_mut("blog")
            .unwrap()
            .collection_by_name_mut("posts")
            .unwrap();
        collection
            .add_index("idx_title", true)?
            .add_field(PathKey::root(), "title", FieldIndexOrdering::Asc);
        collection
            .doc_part_by_path_mut(&PathKey::root())
            .unwrap()
            .add_index(MetaDocPartIndex {
                identifier: "blog_posts_idx_title".into(),
                unique: true,
                columns: vec![MetaDocPartIndexColumn {
                    position: 0,
                    identifier: "blog_posts_title_s".into(),
                    ordering: FieldIndexOrdering::Asc,
                }],
            })?;
        Ok(())
    })
    .unwrap();

    let dialect = RecordingDialect::default();
    SchemaDiffApplier::new(&dialect)
        .apply(&before, &repository.snapshot())
        .unwrap();
    assert_eq!(
        dialect.operations(),
        vec!["create_index blog_posts_idx_title on blog.blog_posts"]
    );
}

#[test]
fn test_shape_discovery_with_derived_identifiers() {
    // The flow a document insert runs when it encounters a new shape:
    // derive every identifier through the factory, register the structure,
    // commit, then allocate row ids for the insert itself.
    let factory = DefaultIdentifierFactory;
    let repository = MvccMetainfoRepository::new();

    let db_id = factory.database_identifier("My-App");
    let col_id = factory.collection_identifier(&db_id, "users");
    let root_id = factory.doc_part_identifier(&col_id, &PathKey::root());
    let tags_path = PathKey::root().child("tags");
    let tags_id = factory.doc_part_identifier(&col_id, &tags_path);

    let mut fork = repository.fork();
    let collection = fork
        .add_database("My-App", &db_id)
        .unwrap()
        .add_collection("users", &col_id)
        .unwrap();
    collection
        .add_doc_part(PathKey::root(), &root_id)
        .unwrap()
        .add_field(
            "name",
            &factory.field_identifier(&root_id, "name", FieldType::String),
            FieldType::String,
        )
        .unwrap();
    collection
        .add_doc_part(tags_path.clone(), &tags_id)
        .unwrap()
        .add_scalar(
            &factory.scalar_identifier(&tags_id, FieldType::String),
            FieldType::String,
        )
        .unwrap();
    repository.commit(&fork).unwrap();

    let snapshot = repository.snapshot();
    let collection = snapshot
        .database_by_name("My-App")
        .unwrap()
        .collection_by_name("users")
        .unwrap();
    assert_eq!(collection.identifier(), "my_app_users");
    assert_eq!(
        collection.doc_part_by_path(&tags_path).unwrap().identifier(),
        "my_app_users_tags"
    );
    assert_eq!(
        repository
            .consume_rids("My-App", "users", &tags_path, 5)
            .unwrap(),
        0
    );
}

// ============================================================================
// Snapshot isolation across threads
// ============================================================================

#[test]
fn test_reader_threads_see_a_frozen_schema() {
    let repository = Arc::new(MvccMetainfoRepository::new());
    transact(&repository, |fork| {
        fork.add_database("db", "db")?;
        Ok(())
    })
    .unwrap();

    let held = repository.snapshot();
    let writer = {
        let repository = Arc::clone(&repository);
        thread::spawn(move || {
            transact(&repository, |fork| {
                fork.add_database("late", "late")?;
                Ok(())
            })
            .unwrap();
        })
    };
    writer.join().unwrap();

    // The held snapshot is frozen; a fresh one sees the commit.
    assert!(held.database_by_name("late").is_none());
    assert!(repository.snapshot().database_by_name("late").is_some());
}

#[test]
fn test_concurrent_writers_all_land_with_retries() {
    let repository = Arc::new(MvccMetainfoRepository::new());
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let repository = Arc::clone(&repository);
            thread::spawn(move || {
                let name = format!("db_{}", i);
                transact(&repository, |fork| {
                    fork.add_database(&name, &name)?
                        .add_collection("events", &format!("{}_events", name))?
                        .add_doc_part(PathKey::root(), &format!("{}_events", name))?;
                    Ok(())
                })
                .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = repository.snapshot();
    assert_eq!(snapshot.len(), 8);
    for i in 0..8 {
        let db = snapshot.database_by_name(&format!("db_{}", i)).unwrap();
        assert!(db.collection_by_name("events").is_some());
    }
}

// ============================================================================
// Conflict and retry
// ============================================================================

#[test]
fn test_losing_writer_retries_and_adapts() {
    let repository = MvccMetainfoRepository::new();

    // Two transactions race to create the same database with different
    // identifiers. The loser's replay observes the winner and reuses it.
    let stale = {
        let mut fork = repository.fork();
        fork.add_database("shared", "shared_a").unwrap();
        fork
    };
    transact(&repository, |fork| {
        fork.add_database("shared", "shared_b")?;
        Ok(())
    })
    .unwrap();

    let conflict = repository.commit(&stale).unwrap_err();
    assert!(Error::from(conflict).is_retryable());

    transact(&repository, |fork| {
        if fork.database_by_name("shared").is_none() {
            fork.add_database("shared", "shared_a")?;
        }
        fork.database_by_name_mut("shared")
            .unwrap()
            .add_collection("items", "shared_items")?;
        Ok(())
    })
    .unwrap();

    let db = repository.snapshot();
    let db = db.database_by_name("shared").unwrap();
    assert_eq!(db.identifier(), "shared_b");
    assert!(db.collection_by_name("items").is_some());
}

// ============================================================================
// Order independence of disjoint deltas
// ============================================================================

#[test]
fn test_disjoint_deltas_commute() {
    let commit_both = |first_wins: bool| {
        let repository = MvccMetainfoRepository::new();
        let mut a = repository.fork();
        a.add_database("a", "a").unwrap();
        let mut b = repository.fork();
        b.add_database("b", "b").unwrap();
        let (first, second) = if first_wins { (a, b) } else { (b, a) };
        repository.commit(&first).unwrap();
        repository.commit(&second).unwrap();
        database_names(&repository.snapshot())
    };
    assert_eq!(commit_both(true), commit_both(false));
}

// ============================================================================
// Randomized concurrent database creation
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Two forks of the same baseline each add an arbitrary set of
    /// databases, named so a shared name always carries the same
    /// identifier. Committing both must succeed in either order and end
    /// with the union of names.
    #[test]
    fn prop_equivalent_deltas_always_merge(
        left in prop::collection::btree_set("[a-d][0-9]", 0..6),
        right in prop::collection::btree_set("[a-d][0-9]", 0..6),
    ) {
        let repository = MvccMetainfoRepository::new();
        let mut first = repository.fork();
        for name in &left {
            first.add_database(name, name).unwrap();
        }
        let mut second = repository.fork();
        for name in &right {
            second.add_database(name, name).unwrap();
        }
        repository.commit(&first).unwrap();
        repository.commit(&second).unwrap();

        let expected: BTreeSet<String> = left.union(&right).cloned().collect();
        prop_assert_eq!(database_names(&repository.snapshot()), expected);
    }

    /// When the same name is bound to different identifiers, exactly the
    /// second commit fails and the winner's binding survives.
    #[test]
    fn prop_identifier_races_conflict(
        name in "[a-z]{3}",
    ) {
        let repository = MvccMetainfoRepository::new();
        let mut first = repository.fork();
        first.add_database(&name, &format!("{}_1", name)).unwrap();
        let mut second = repository.fork();
        second.add_database(&name, &format!("{}_2", name)).unwrap();

        repository.commit(&first).unwrap();
        prop_assert!(repository.commit(&second).is_err());
        let snapshot = repository.snapshot();
        let winner = format!("{}_1", name);
        prop_assert_eq!(
            snapshot.database_by_name(&name).unwrap().identifier(),
            winner.as_str()
        );
    }
}
