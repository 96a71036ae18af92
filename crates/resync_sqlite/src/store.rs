//! SQLite-backed staging, target and checkpoint store.

use crate::error::{SqliteError, SqliteResult};
use crate::sql::{create_staging, fill_staging, quote_ident, ColumnDef, Statements};
use chrono::NaiveDateTime;
use resync_core::{
    CheckpointStore, EntityPolicy, Operation, StagedSnapshot, Staging, SyncResult, TargetStore,
    TIMESTAMP_FORMAT,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

/// Table holding one checkpoint per synchronisation and entity.
pub const CHECKPOINT_TABLE: &str = "sync_date";

/// Reconciliation store over one SQLite connection.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    name: String,
    persistent_staging: bool,
}

impl SqliteStore {
    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> SqliteResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens an in-memory database.
    pub fn open_in_memory() -> SqliteResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wraps an existing connection, creating the checkpoint table if needed.
    pub fn from_connection(conn: Connection) -> SqliteResult<Self> {
        let store = Self {
            conn,
            name: "resync".to_string(),
            persistent_staging: false,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> SqliteResult<()> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {CHECKPOINT_TABLE} (
                title TEXT PRIMARY KEY,
                date TEXT NOT NULL
            );"
        ))?;
        Ok(())
    }

    /// Attaches a source database under `schema`, so entities can name
    /// `schema.table` as their source.
    pub fn attach_source(&mut self, path: impl AsRef<Path>, schema: &str) -> SqliteResult<()> {
        let path = path.as_ref().to_string_lossy().into_owned();
        self.conn.execute(
            &format!("ATTACH DATABASE ?1 AS {}", quote_ident(schema)),
            params![path],
        )?;
        tracing::debug!(schema, path = %path, "source database attached");
        Ok(())
    }

    /// Sets the synchronisation name prefixing checkpoint titles.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Creates staging tables as regular tables instead of temporary ones,
    /// so kept staging outlives the connection.
    pub fn with_persistent_staging(mut self, persistent: bool) -> Self {
        self.persistent_staging = persistent;
        self
    }

    /// Synchronisation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn checkpoint_title(&self, entity: &str) -> String {
        format!("{} {}", self.name, entity)
    }

    /// Declared column types of `table`.
    fn declared_types(&self, table: &str) -> SqliteResult<HashMap<String, String>> {
        let pragma = match table.split_once('.') {
            Some((schema, name)) => format!(
                "PRAGMA {}.table_info({})",
                quote_ident(schema),
                quote_ident(name)
            ),
            None => format!("PRAGMA table_info({})", quote_ident(table)),
        };
        let mut stmt = self.conn.prepare(&pragma)?;
        let columns = stmt
            .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
            .collect::<Result<HashMap<_, _>, _>>()?;
        if columns.is_empty() {
            return Err(SqliteError::MissingTable(table.to_string()));
        }
        Ok(columns)
    }

    fn stage_rows(
        &self,
        policy: &EntityPolicy,
        since: Option<NaiveDateTime>,
    ) -> SqliteResult<StagedSnapshot> {
        let types = self.declared_types(&policy.name)?;
        let columns: Vec<ColumnDef> = policy
            .mapping
            .iter()
            .map(|m| ColumnDef {
                name: m.target.clone(),
                declared_type: types.get(&m.target).cloned().unwrap_or_default(),
            })
            .collect();

        let table = format!("_tmp_{}", policy.name);
        self.drop_staging(&table)?;
        self.conn.execute(
            &create_staging(
                &table,
                &columns,
                &policy.conflicts_field,
                self.persistent_staging,
            ),
            [],
        )?;
        let rows = self.conn.execute(&fill_staging(policy, &table, since)?, [])?;
        Ok(StagedSnapshot {
            entity: policy.name.clone(),
            table,
            rows,
        })
    }

    fn drop_staging(&self, table: &str) -> SqliteResult<()> {
        self.conn
            .execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)), [])?;
        Ok(())
    }

    fn run(
        &self,
        policy: &EntityPolicy,
        snapshot: &StagedSnapshot,
        operation: &Operation,
    ) -> SqliteResult<usize> {
        let sql = Statements::new(policy, &snapshot.table).render(operation)?;
        tracing::trace!(entity = %policy.name, %sql, "executing");
        match operation {
            Operation::Count { .. } => {
                let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
                Ok(usize::try_from(count).unwrap_or_default())
            }
            _ => Ok(self.conn.execute(&sql, [])?),
        }
    }

    fn load(&self, entity: &str) -> SqliteResult<Option<NaiveDateTime>> {
        let title = self.checkpoint_title(entity);
        let stored: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT date FROM {CHECKPOINT_TABLE} WHERE title = ?1"),
                params![title],
                |row| row.get(0),
            )
            .optional()?;
        stored
            .map(|value| {
                NaiveDateTime::parse_from_str(&value, TIMESTAMP_FORMAT)
                    .map_err(|_| SqliteError::InvalidCheckpoint { title, value })
            })
            .transpose()
    }

    fn save(&self, entity: &str, at: NaiveDateTime) -> SqliteResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO {CHECKPOINT_TABLE} (title, date) VALUES (?1, ?2) \
                 ON CONFLICT(title) DO UPDATE SET date = excluded.date"
            ),
            params![
                self.checkpoint_title(entity),
                at.format(TIMESTAMP_FORMAT).to_string()
            ],
        )?;
        Ok(())
    }
}

impl Staging for SqliteStore {
    fn stage(
        &mut self,
        policy: &EntityPolicy,
        since: Option<NaiveDateTime>,
    ) -> SyncResult<StagedSnapshot> {
        Ok(self.stage_rows(policy, since)?)
    }

    fn release(&mut self, snapshot: &StagedSnapshot) -> SyncResult<()> {
        Ok(self.drop_staging(&snapshot.table)?)
    }
}

impl TargetStore for SqliteStore {
    fn execute(
        &mut self,
        policy: &EntityPolicy,
        snapshot: &StagedSnapshot,
        operation: &Operation,
    ) -> SyncResult<usize> {
        Ok(self.run(policy, snapshot, operation)?)
    }

    fn foreign_keys_enabled(&mut self) -> SyncResult<bool> {
        let enabled: i64 = self
            .conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .map_err(SqliteError::from)?;
        Ok(enabled != 0)
    }

    fn set_foreign_keys(&mut self, enabled: bool) -> SyncResult<()> {
        self.conn
            .pragma_update(None, "foreign_keys", enabled)
            .map_err(SqliteError::from)?;
        Ok(())
    }
}

impl CheckpointStore for SqliteStore {
    fn load_checkpoint(&mut self, entity: &str) -> SyncResult<Option<NaiveDateTime>> {
        Ok(self.load(entity)?)
    }

    fn save_checkpoint(&mut self, entity: &str, at: NaiveDateTime) -> SyncResult<()> {
        Ok(self.save(entity, at)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_titles_carry_the_name() {
        let mut store = SqliteStore::open_in_memory().unwrap().with_name("crm");
        let at = NaiveDateTime::parse_from_str("2024-05-01 12:00:00", TIMESTAMP_FORMAT).unwrap();
        assert!(store.load_checkpoint("users").unwrap().is_none());

        store.save_checkpoint("users", at).unwrap();
        store.save_checkpoint("users", at).unwrap();
        assert_eq!(store.load_checkpoint("users").unwrap(), Some(at));

        let title: String = store
            .connection()
            .query_row("SELECT title FROM sync_date", [], |r| r.get(0))
            .unwrap();
        assert_eq!(title, "crm users");
    }

    #[test]
    fn corrupt_checkpoint_is_reported() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute(
                "INSERT INTO sync_date (title, date) VALUES ('resync users', 'yesterday')",
                [],
            )
            .unwrap();
        let err = store.load_checkpoint("users").unwrap_err();
        assert!(err.to_string().contains("invalid checkpoint"));
    }

    #[test]
    fn foreign_key_pragma() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.set_foreign_keys(true).unwrap();
        assert!(store.foreign_keys_enabled().unwrap());
        store.set_foreign_keys(false).unwrap();
        assert!(!store.foreign_keys_enabled().unwrap());
    }

    #[test]
    fn staging_requires_the_target_table() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let policy = EntityPolicy::new("missing").with_fields(["id"]);
        let err = store.stage(&policy, None).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
