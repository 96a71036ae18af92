//! End-to-end reconciliation runs against the in-memory store.

use chrono::NaiveDateTime;
use resync_core::{
    row, CheckpointStore, ConflictAction, DeleteAction, EntityPolicy, InsertAction, MemoryStore,
    MemoryTable, Operation, OverrideSet, PipelineSummary, Row, StageKind, StagedSnapshot,
    Staging, SyncConfig, SyncEngine, SyncError, SyncListener, SyncOptions, SyncResult,
    TargetStore, UpdateAction, Value,
};
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;

fn author(id: i64, name: &str, date: &str) -> Row {
    row([
        ("id", Value::from(id)),
        ("name", Value::from(name)),
        ("date_updated", Value::from(date)),
    ])
}

fn post(id: i64, author_id: i64, title: &str, date: &str) -> Row {
    row([
        ("id", Value::from(id)),
        ("author_id", Value::from(author_id)),
        ("title", Value::from(title)),
        ("date_updated", Value::from(date)),
    ])
}

fn authors() -> EntityPolicy {
    EntityPolicy::new("authors").with_fields(["id", "name", "date_updated"])
}

fn posts() -> EntityPolicy {
    EntityPolicy::new("posts")
        .with_fields(["id", "author_id", "title", "date_updated"])
        .requires("authors")
}

fn comments() -> EntityPolicy {
    EntityPolicy::new("comments")
        .with_fields(["id", "post_id", "date_updated"])
        .requires("posts")
}

fn set(entries: &[(&str, serde_json::Value)]) -> OverrideSet {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn full() -> SyncOptions {
    SyncOptions::new().with_incremental(false)
}

fn blog() -> MemoryStore {
    MemoryStore::new()
        .with_source(
            "authors",
            vec![
                author(1, "ada", "2024-01-01 00:00:00"),
                author(2, "bob", "2024-01-02 00:00:00"),
            ],
        )
        .with_source(
            "posts",
            vec![post(10, 1, "hello", "2024-01-03 00:00:00")],
        )
        .with_source("comments", Vec::new())
        .with_target("authors", MemoryTable::new().with_primary_key("id"))
        .with_target("posts", MemoryTable::new().with_primary_key("id"))
        .with_target("comments", MemoryTable::new().with_primary_key("id"))
        .with_foreign_key("posts", "author_id", "authors", "id")
}

/// Records entity names as they start.
#[derive(Clone, Default)]
struct Started(Rc<RefCell<Vec<String>>>);

impl SyncListener for Started {
    fn before_entity(&mut self, policy: &mut EntityPolicy) {
        self.0.borrow_mut().push(policy.name.clone());
    }
}

fn names(policies: &[EntityPolicy]) -> Vec<&str> {
    policies.iter().map(|p| p.name.as_str()).collect()
}

#[test]
fn dependencies_run_first() {
    let started = Started::default();
    let mut engine = SyncEngine::new(full()).with_listener(started.clone());
    let mut store = blog();

    let report = engine
        .run(vec![comments(), posts(), authors()], &mut store)
        .unwrap();

    assert!(report.success());
    assert_eq!(*started.0.borrow(), vec!["authors", "posts", "comments"]);
    assert_eq!(store.target_rows("authors").len(), 2);
    assert_eq!(store.target_rows("posts").len(), 1);
    assert_eq!(
        report.entity("authors").unwrap().summary.as_ref().unwrap().affected(StageKind::Insert),
        2
    );
    assert_eq!(report.total_affected(), 3);
}

#[test]
fn plan_filters() {
    let tags = || EntityPolicy::new("tags").with_fields(["id", "date_updated"]);
    let all = || vec![authors(), posts(), comments(), tags()];

    let plan = SyncEngine::new(full()).plan(all()).unwrap();
    assert_eq!(names(&plan), vec!["authors", "posts", "comments", "tags"]);

    let plan = SyncEngine::new(full().with_include(["posts"]))
        .plan(all())
        .unwrap();
    assert_eq!(names(&plan), vec!["authors", "posts"]);

    let plan = SyncEngine::new(full().with_include(["posts"]).with_add_relations(true))
        .plan(all())
        .unwrap();
    assert_eq!(names(&plan), vec!["authors", "posts", "comments"]);

    let plan = SyncEngine::new(full().with_exclude(["posts"]))
        .plan(all())
        .unwrap();
    assert_eq!(names(&plan), vec!["authors", "tags"]);
}

#[test]
fn configuration_errors_touch_nothing() {
    let mut store = blog();
    let err = SyncEngine::new(full())
        .run(vec![posts()], &mut store)
        .unwrap_err();
    assert!(matches!(err, SyncError::UnresolvedReference { .. }));
    assert!(err.is_configuration());
    assert!(store.fk_history().is_empty());
    assert!(store.target_rows("posts").is_empty());
}

#[test]
fn foreign_keys_restored_after_run() {
    let mut store = blog();
    SyncEngine::new(full())
        .run(vec![authors(), posts()], &mut store)
        .unwrap();
    assert_eq!(store.fk_history(), &[false, true]);
    assert!(store.fk_enabled());
}

/// Refuses to turn foreign-key enforcement back on.
struct StuckForeignKeys(MemoryStore);

impl Staging for StuckForeignKeys {
    fn stage(
        &mut self,
        policy: &EntityPolicy,
        since: Option<NaiveDateTime>,
    ) -> SyncResult<StagedSnapshot> {
        self.0.stage(policy, since)
    }

    fn release(&mut self, snapshot: &StagedSnapshot) -> SyncResult<()> {
        Staging::release(&mut self.0, snapshot)
    }
}

impl TargetStore for StuckForeignKeys {
    fn execute(
        &mut self,
        policy: &EntityPolicy,
        snapshot: &StagedSnapshot,
        operation: &Operation,
    ) -> SyncResult<usize> {
        self.0.execute(policy, snapshot, operation)
    }

    fn foreign_keys_enabled(&mut self) -> SyncResult<bool> {
        self.0.foreign_keys_enabled()
    }

    fn set_foreign_keys(&mut self, enabled: bool) -> SyncResult<()> {
        if enabled {
            return Err(SyncError::store("database is locked"));
        }
        self.0.set_foreign_keys(enabled)
    }
}

impl CheckpointStore for StuckForeignKeys {
    fn load_checkpoint(&mut self, entity: &str) -> SyncResult<Option<NaiveDateTime>> {
        self.0.load_checkpoint(entity)
    }

    fn save_checkpoint(&mut self, entity: &str, at: NaiveDateTime) -> SyncResult<()> {
        self.0.save_checkpoint(entity, at)
    }
}

#[test]
fn failed_foreign_key_restore_keeps_the_report() {
    let mut store = StuckForeignKeys(blog());
    let report = SyncEngine::new(full())
        .run(vec![authors(), posts()], &mut store)
        .unwrap();

    assert!(report.success());
    assert_eq!(report.entities.len(), 2);
    assert_eq!(report.total_affected(), 3);
    assert_eq!(store.0.fk_history(), &[false]);
    assert!(!store.0.fk_enabled());
}

#[test]
fn update_is_sync_by_exception() {
    let target = || {
        MemoryTable::new()
            .with_primary_key("id")
            .with_rows([author(1, "old", "2023-12-01 00:00:00")])
    };

    let mut store = blog().with_target("authors", target());
    let policy = authors().with_on_update(UpdateAction::Update, OverrideSet::new());
    SyncEngine::new(full()).run(vec![policy], &mut store).unwrap();
    let row = store.find_target("authors", "id", 1).unwrap();
    assert_eq!(row.get("name"), Some(&Value::from("old")));

    let mut store = blog().with_target("authors", target());
    let policy = authors().with_on_update(UpdateAction::Update, set(&[("name", json!(null))]));
    let report = SyncEngine::new(full()).run(vec![policy], &mut store).unwrap();
    let row = store.find_target("authors", "id", 1).unwrap();
    assert_eq!(row.get("name"), Some(&Value::from("ada")));
    assert_eq!(
        row.get("date_updated"),
        Some(&Value::from("2023-12-01 00:00:00"))
    );
    let summary = report.entity("authors").unwrap().summary.clone().unwrap();
    assert_eq!(summary.affected(StageKind::Update), 1);
    assert_eq!(summary.affected(StageKind::Insert), 1);
}

#[test]
fn conflicting_rows_are_flagged_not_overwritten() {
    let mut store = blog().with_target(
        "authors",
        MemoryTable::new()
            .with_primary_key("id")
            .with_rows([author(1, "local", "2024-06-01 00:00:00")]),
    );
    let policy = authors()
        .with_on_update(UpdateAction::Update, set(&[("name", json!(null))]))
        .with_on_conflict(ConflictAction::Update, set(&[("status", json!("conflict"))]));

    let report = SyncEngine::new(full()).run(vec![policy], &mut store).unwrap();

    let row = store.find_target("authors", "id", 1).unwrap();
    assert_eq!(row.get("name"), Some(&Value::from("local")));
    assert_eq!(row.get("status"), Some(&Value::from("conflict")));
    assert!(store.find_target("authors", "id", 2).is_some());

    let summary = report.entity("authors").unwrap().summary.clone().unwrap();
    assert_eq!(summary.affected(StageKind::Conflict), 1);
    assert_eq!(summary.affected(StageKind::Update), 0);
}

#[test]
fn conflict_delete_removes_the_target_row() {
    let mut store = blog().with_target(
        "authors",
        MemoryTable::new()
            .with_primary_key("id")
            .with_rows([author(1, "local", "2024-06-01 00:00:00")]),
    );
    let policy = authors().with_on_conflict(ConflictAction::Delete, OverrideSet::new());
    SyncEngine::new(full()).run(vec![policy], &mut store).unwrap();

    // The marked staged row is not inserted again.
    assert!(store.find_target("authors", "id", 1).is_none());
    assert!(store.find_target("authors", "id", 2).is_some());
}

#[test]
fn abort_stops_the_run() {
    let mut store = blog().with_target(
        "posts",
        MemoryTable::new()
            .with_primary_key("id")
            .with_rows([post(10, 1, "edited", "2024-06-01 00:00:00")]),
    );
    let started = Started::default();
    let mut engine = SyncEngine::new(full()).with_listener(started.clone());
    let report = engine
        .run(
            vec![
                authors(),
                posts().with_on_conflict(ConflictAction::Abort, OverrideSet::new()),
                comments(),
            ],
            &mut store,
        )
        .unwrap();

    assert!(!report.success());
    assert_eq!(report.aborted.as_deref(), Some("posts"));
    assert_eq!(*started.0.borrow(), vec!["authors", "posts"]);
    assert!(report.entity("comments").is_none());
    assert!(report.entity("authors").unwrap().succeeded());
    assert_eq!(store.target_rows("authors").len(), 2);
    assert_eq!(
        store.find_target("posts", "id", 10).unwrap().get("title"),
        Some(&Value::from("edited"))
    );
    assert!(store.fk_enabled());
}

#[test]
fn failed_entity_does_not_stop_others() {
    let tags = EntityPolicy::new("tags").with_fields(["id", "date_updated"]);
    let mut store = blog()
        .with_source("tags", vec![row([("id", Value::from(1)), ("date_updated", Value::Null)])])
        .with_target("tags", MemoryTable::new());
    store.fail_staging("authors");

    let report = SyncEngine::new(full())
        .run(vec![authors(), tags], &mut store)
        .unwrap();

    assert!(!report.success());
    assert!(report.aborted.is_none());
    let failed: Vec<_> = report.failures().map(|e| e.name.as_str()).collect();
    assert_eq!(failed, vec!["authors"]);
    assert!(report.entity("authors").unwrap().error.as_ref().unwrap().contains("staging"));
    assert!(report.entity("tags").unwrap().succeeded());
    assert_eq!(store.target_rows("tags").len(), 1);
    assert!(store.checkpoint("authors").is_none());
    assert!(store.checkpoint("tags").is_some());
}

#[test]
fn hard_delete_cascades() {
    let mut store = blog()
        .with_target(
            "authors",
            MemoryTable::new().with_primary_key("id").with_rows([
                author(1, "ada", "2024-01-01 00:00:00"),
                author(3, "gone", "2024-01-01 00:00:00"),
            ]),
        )
        .with_target(
            "posts",
            MemoryTable::new()
                .with_primary_key("id")
                .with_rows([post(30, 3, "orphan", "2024-01-01 00:00:00")]),
        );
    let policy = authors().with_on_delete(DeleteAction::Delete, OverrideSet::new());

    let report = SyncEngine::new(full()).run(vec![policy], &mut store).unwrap();

    assert!(store.find_target("authors", "id", 3).is_none());
    assert!(store.target_rows("posts").is_empty());
    assert_eq!(store.fk_history(), &[false, true, false, true]);
    let summary = report.entity("authors").unwrap().summary.clone().unwrap();
    assert_eq!(summary.affected(StageKind::Delete), 1);
}

#[test]
fn delete_as_update_rewrites_vanished_rows() {
    let mut store = blog().with_target(
        "authors",
        MemoryTable::new()
            .with_primary_key("id")
            .with_rows([author(3, "gone", "2024-01-01 00:00:00")]),
    );
    let policy = authors().with_on_delete(DeleteAction::Update, set(&[("name", json!("removed"))]));
    SyncEngine::new(full()).run(vec![policy], &mut store).unwrap();
    assert_eq!(
        store.find_target("authors", "id", 3).unwrap().get("name"),
        Some(&Value::from("removed"))
    );
}

fn items() -> EntityPolicy {
    EntityPolicy::new("items")
        .with_fields(["id", "date_updated", "active"])
        .with_soft_delete("active")
        .with_on_delete(DeleteAction::Delete, OverrideSet::new())
}

fn item(id: i64, active: bool) -> Row {
    row([
        ("id", Value::from(id)),
        ("date_updated", Value::from("2024-01-01 00:00:00")),
        ("active", Value::from(active)),
    ])
}

#[test]
fn vanished_rows_are_reaped_on_the_next_full_run() {
    let mut store = MemoryStore::new()
        .with_source("items", vec![item(1, true)])
        .with_target(
            "items",
            MemoryTable::new()
                .with_primary_key("id")
                .with_rows([item(1, true), item(2, true)]),
        );

    let report = SyncEngine::new(full()).run(vec![items()], &mut store).unwrap();
    let deactivated = store.find_target("items", "id", 2).unwrap();
    assert_eq!(deactivated.get("active"), Some(&Value::from(0)));
    let summary = report.entity("items").unwrap().summary.clone().unwrap();
    assert_eq!(summary.affected(StageKind::SoftDelete), 1);
    assert_eq!(summary.outcome(StageKind::Delete).map(|o| o.is_skipped()), Some(true));

    SyncEngine::new(full()).run(vec![items()], &mut store).unwrap();
    assert!(store.find_target("items", "id", 2).is_none());
    assert!(store.find_target("items", "id", 1).is_some());
}

#[test]
fn incremental_runs_only_deactivate_flagged_rows() {
    let mut store = MemoryStore::new()
        .with_source("items", vec![item(1, false)])
        .with_target(
            "items",
            MemoryTable::new()
                .with_primary_key("id")
                .with_rows([item(1, true), item(2, true)]),
        );

    SyncEngine::new(SyncOptions::new())
        .run(vec![items()], &mut store)
        .unwrap();

    assert_eq!(
        store.find_target("items", "id", 1).unwrap().get("active"),
        Some(&Value::from(0))
    );
    assert_eq!(
        store.find_target("items", "id", 2).unwrap().get("active"),
        Some(&Value::from(1))
    );
}

#[test]
fn insert_collisions_are_skipped() {
    let mut store = blog().with_target(
        "authors",
        MemoryTable::new()
            .with_primary_key("id")
            .with_unique(["name"])
            .with_rows([author(7, "bob", "2024-01-01 00:00:00")]),
    );
    let report = SyncEngine::new(full())
        .run(vec![authors()], &mut store)
        .unwrap();

    assert!(report.success());
    assert_eq!(store.target_rows("authors").len(), 2);
    assert!(store.find_target("authors", "id", 2).is_none());
}

#[test]
fn checkpoints_drive_incremental_runs() {
    let mut store = blog();
    let mut engine = SyncEngine::new(SyncOptions::new());

    engine.run(vec![authors()], &mut store).unwrap();
    assert_eq!(store.target_rows("authors").len(), 2);
    let first = store.checkpoint("authors").unwrap();

    // Nothing changed since the checkpoint.
    let report = engine.run(vec![authors()], &mut store).unwrap();
    assert_eq!(report.total_affected(), 0);

    store
        .source_rows_mut("authors")
        .unwrap()
        .push(author(3, "cy", "2999-01-01 00:00:00"));
    engine.run(vec![authors()], &mut store).unwrap();
    assert_eq!(store.target_rows("authors").len(), 3);
    assert!(store.checkpoint("authors").unwrap() >= first);
}

#[test]
fn checkpoints_can_be_disabled() {
    let mut store = blog();
    SyncEngine::new(SyncOptions::new().with_save_checkpoints(false))
        .run(vec![authors()], &mut store)
        .unwrap();
    assert!(store.checkpoint("authors").is_none());
}

#[test]
fn staging_is_released_unless_kept() {
    let mut store = blog();
    SyncEngine::new(full()).run(vec![authors()], &mut store).unwrap();
    assert!(store.staged_rows("_tmp_authors").is_none());

    SyncEngine::new(full().with_keep_staging(true))
        .run(vec![authors()], &mut store)
        .unwrap();
    assert_eq!(store.staged_rows("_tmp_authors").map(<[Row]>::len), Some(2));
}

/// Turns inserts off for one entity.
struct NoInserts(&'static str);

impl SyncListener for NoInserts {
    fn before_entity(&mut self, policy: &mut EntityPolicy) {
        if policy.name == self.0 {
            policy.on_insert = InsertAction::Ignore;
        }
    }
}

#[test]
fn listeners_can_adjust_the_policy() {
    let mut store = blog();
    let report = SyncEngine::new(full())
        .with_listener(NoInserts("authors"))
        .run(vec![authors(), posts()], &mut store)
        .unwrap();

    assert!(store.target_rows("authors").is_empty());
    assert_eq!(store.target_rows("posts").len(), 1);
    assert_eq!(
        report.entity("authors").unwrap().summary.as_ref().map(PipelineSummary::total_affected),
        Some(0)
    );
}

#[test]
fn configuration_file_end_to_end() {
    let config = SyncConfig::from_json_str(
        r#"{
            "name": "blog",
            "options": {"incremental": false},
            "entities": {
                "writers": {
                    "sourceName": "authors",
                    "mapping": {"id": null, "name": "title", "date_updated": null},
                    "onDelete": "delete"
                }
            }
        }"#,
    )
    .unwrap();
    let mut store = blog().with_target(
        "writers",
        MemoryTable::new()
            .with_primary_key("id")
            .with_rows([row([("id", Value::from(9)), ("title", Value::from("old"))])]),
    );

    let report = SyncEngine::new(config.options.clone())
        .run(config.policies().unwrap(), &mut store)
        .unwrap();

    assert!(report.success());
    let rows = store.target_rows("writers");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.get("title").is_some()));
    assert!(store.find_target("writers", "id", 9).is_none());
}
