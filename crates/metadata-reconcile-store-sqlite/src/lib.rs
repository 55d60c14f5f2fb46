use std::path::Path;

use anyhow::{anyhow, Context, Result};
use metadata_reconcile_core::{
    Assertion, FieldCandidate, FieldId, FieldSpec, MetadataStore, ObjectId, ReconcileError,
    StoreTransaction,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};

const REQUIRED_TABLES: [&str; 3] =
    ["metadataschemaregistry", "metadatafieldregistry", "metadatavalue"];

const CREATE_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS metadataschemaregistry (
  metadata_schema_id INTEGER PRIMARY KEY AUTOINCREMENT,
  short_id TEXT NOT NULL UNIQUE,
  namespace TEXT
);

CREATE TABLE IF NOT EXISTS metadatafieldregistry (
  metadata_field_id INTEGER PRIMARY KEY AUTOINCREMENT,
  metadata_schema_id INTEGER NOT NULL,
  element TEXT NOT NULL,
  qualifier TEXT,
  scope_note TEXT,
  FOREIGN KEY (metadata_schema_id) REFERENCES metadataschemaregistry(metadata_schema_id)
);

CREATE TABLE IF NOT EXISTS metadatavalue (
  metadata_value_id INTEGER PRIMARY KEY AUTOINCREMENT,
  dspace_object_id TEXT NOT NULL,
  metadata_field_id INTEGER NOT NULL,
  text_value TEXT,
  text_lang TEXT,
  place INTEGER NOT NULL DEFAULT 0,
  authority TEXT,
  confidence INTEGER NOT NULL DEFAULT -1,
  FOREIGN KEY (metadata_field_id) REFERENCES metadatafieldregistry(metadata_field_id)
);

CREATE INDEX IF NOT EXISTS idx_metadatavalue_field_object
  ON metadatavalue(metadata_field_id, dspace_object_id);
CREATE INDEX IF NOT EXISTS idx_metadatavalue_text ON metadatavalue(text_value);
";

const INSERT_IF_ABSENT_SQL: &str = r"
INSERT INTO metadatavalue(dspace_object_id, metadata_field_id, text_value, place)
SELECT ?1, ?2, ?3, (
  SELECT COALESCE(MAX(place), -1) + 1 FROM metadatavalue
  WHERE dspace_object_id = ?1 AND metadata_field_id = ?2
)
WHERE NOT EXISTS (
  SELECT 1 FROM metadatavalue
  WHERE dspace_object_id = ?1 AND metadata_field_id = ?2 AND text_value = ?3
)
";

/// Metadata store backed by a registry/value schema in `SQLite`.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open an existing store. The file is never created and the registry and
    /// value tables must already be present.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, pragmas cannot be
    /// applied, or a required table is missing.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        let store = Self::configure(conn)?;
        for table in REQUIRED_TABLES {
            if !table_exists(&store.conn, table)? {
                return Err(anyhow!(
                    "database at {} has no {table} table; run `mdr init` for a fresh store",
                    path.display()
                ));
            }
        }
        Ok(store)
    }

    /// Open or create a store file and create any missing tables.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or the schema
    /// cannot be created.
    pub fn create(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        let store = Self::configure(conn)?;
        store.create_schema_if_missing()?;
        Ok(store)
    }

    /// Fresh private in-memory store with the schema in place.
    ///
    /// # Errors
    /// Returns an error when the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        let store = Self::configure(conn)?;
        store.create_schema_if_missing()?;
        Ok(store)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }

    /// # Errors
    /// Returns an error when the DDL fails.
    pub fn create_schema_if_missing(&self) -> Result<()> {
        self.conn.execute_batch(CREATE_SCHEMA_SQL).context("failed to create metadata schema")
    }

    /// Id of the schema with `short_id`, registering it first when absent.
    ///
    /// # Errors
    /// Returns an error when the registry cannot be read or written.
    pub fn register_schema(&self, short_id: &str, namespace: Option<&str>) -> Result<i64> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO metadataschemaregistry(short_id, namespace) VALUES (?1, ?2)",
                params![short_id, namespace],
            )
            .with_context(|| format!("failed to register schema {short_id}"))?;

        self.conn
            .query_row(
                "SELECT metadata_schema_id FROM metadataschemaregistry WHERE short_id = ?1",
                params![short_id],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to read schema id for {short_id}"))
    }

    /// Id of the lowest registry row matching `spec`, registering the field
    /// (and its schema) first when absent.
    ///
    /// # Errors
    /// Returns an error when the registry cannot be read or written.
    pub fn register_field(&self, spec: &FieldSpec, scope_note: Option<&str>) -> Result<FieldId> {
        if let Some(existing) = query_candidates(&self.conn, spec)?.first() {
            return Ok(existing.field_id);
        }

        let schema_id = self.register_schema(&spec.namespace, None)?;
        self.conn
            .execute(
                "INSERT INTO metadatafieldregistry
                     (metadata_schema_id, element, qualifier, scope_note)
                 VALUES (?1, ?2, ?3, ?4)",
                params![schema_id, spec.element, spec.qualifier, scope_note],
            )
            .with_context(|| format!("failed to register field {spec}"))?;

        let field_id = FieldId(self.conn.last_insert_rowid());
        tracing::info!(field = %spec, field_id = %field_id, "registered field");
        Ok(field_id)
    }

    /// Append one assertion without any existence check.
    ///
    /// # Errors
    /// Returns an error when the insert fails, including for an unknown field.
    pub fn add_assertion(
        &self,
        object_id: &ObjectId,
        field_id: FieldId,
        value: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO metadatavalue(dspace_object_id, metadata_field_id, text_value, place)
                 SELECT ?1, ?2, ?3, COALESCE(MAX(place), -1) + 1 FROM metadatavalue
                 WHERE dspace_object_id = ?1 AND metadata_field_id = ?2",
                params![object_id.as_str(), field_id.0, value],
            )
            .with_context(|| format!("failed to add assertion for {object_id}"))?;
        Ok(())
    }

    /// Every value row in storage order.
    ///
    /// # Errors
    /// Returns an error when the value table cannot be read.
    pub fn row_snapshot(&self) -> Result<Vec<Assertion>> {
        let mut stmt = self.conn.prepare(
            "SELECT dspace_object_id, metadata_field_id, text_value FROM metadatavalue
             WHERE text_value IS NOT NULL
             ORDER BY metadata_value_id ASC",
        )?;
        let rows = stmt.query_map([], assertion_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read value rows")
    }

    fn read_values(
        &self,
        field_ids: &[FieldId],
        object_id: Option<&ObjectId>,
    ) -> Result<Vec<Assertion>> {
        if field_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders =
            (0..field_ids.len()).map(|offset| format!("?{}", offset + 2)).collect::<Vec<_>>();
        let sql = format!(
            "SELECT dspace_object_id, metadata_field_id, text_value FROM metadatavalue
             WHERE metadata_field_id IN ({})
               AND (?1 IS NULL OR dspace_object_id = ?1)
               AND text_value IS NOT NULL
             ORDER BY metadata_value_id ASC",
            placeholders.join(", ")
        );

        let mut values = Vec::with_capacity(field_ids.len() + 1);
        values.push(object_id.map_or(Value::Null, |object| Value::Text(object.0.clone())));
        values.extend(field_ids.iter().map(|field_id| Value::Integer(field_id.0)));

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare value read")?;
        let rows = stmt.query_map(params_from_iter(values.iter()), assertion_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read value rows")
    }

    fn count_matches(&self, scope: Option<FieldId>, value: &str) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM metadatavalue
                 WHERE text_value = ?1 AND (?2 IS NULL OR metadata_field_id = ?2)",
                params![value, scope.map(|field_id| field_id.0)],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count rows matching {value:?}"))?;
        u64::try_from(count).context("negative row count")
    }
}

impl MetadataStore for SqliteStore {
    type Transaction<'a> = SqliteTransaction<'a>;

    fn field_candidates(&self, spec: &FieldSpec) -> Result<Vec<FieldCandidate>, ReconcileError> {
        query_candidates(&self.conn, spec).map_err(store_error)
    }

    fn read_assertions(
        &self,
        field_ids: &[FieldId],
        object_id: Option<&ObjectId>,
    ) -> Result<Vec<Assertion>, ReconcileError> {
        self.read_values(field_ids, object_id).map_err(store_error)
    }

    fn count_assertions(&self) -> Result<u64, ReconcileError> {
        self.conn
            .query_row("SELECT COUNT(*) FROM metadatavalue", [], |row| row.get::<_, i64>(0))
            .context("failed to count value rows")
            .and_then(|count| u64::try_from(count).context("negative row count"))
            .map_err(store_error)
    }

    fn count_value_matches(
        &self,
        scope: Option<FieldId>,
        value: &str,
    ) -> Result<u64, ReconcileError> {
        self.count_matches(scope, value).map_err(store_error)
    }

    fn begin(&mut self) -> Result<Self::Transaction<'_>, ReconcileError> {
        let tx =
            self.conn.transaction().context("failed to start transaction").map_err(store_error)?;
        Ok(SqliteTransaction { tx })
    }
}

/// Open write transaction. Dropped without commit, `rusqlite` rolls it back.
pub struct SqliteTransaction<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn insert_assertion(
        &mut self,
        object_id: &ObjectId,
        field_id: FieldId,
        value: &str,
    ) -> Result<(), ReconcileError> {
        let conflict = || ReconcileError::WriteConflict {
            object_id: object_id.clone(),
            field_id,
            value: value.to_string(),
        };

        let inserted =
            self.tx.execute(INSERT_IF_ABSENT_SQL, params![object_id.as_str(), field_id.0, value]);
        match inserted {
            Ok(0) => Err(conflict()),
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(conflict()),
            Err(err) => Err(store_error(
                anyhow::Error::new(err).context(format!("failed to insert value for {object_id}")),
            )),
        }
    }

    fn update_assertion_by_value(
        &mut self,
        scope: Option<FieldId>,
        old_value: &str,
        new_value: &str,
    ) -> Result<u64, ReconcileError> {
        let changed = self
            .tx
            .execute(
                "UPDATE metadatavalue SET text_value = ?1
                 WHERE text_value = ?2 AND (?3 IS NULL OR metadata_field_id = ?3)",
                params![new_value, old_value, scope.map(|field_id| field_id.0)],
            )
            .with_context(|| format!("failed to rewrite {old_value:?}"))
            .map_err(store_error)?;
        Ok(changed as u64)
    }

    fn commit(self) -> Result<(), ReconcileError> {
        self.tx.commit().context("failed to commit write transaction").map_err(store_error)
    }

    fn rollback(self) -> Result<(), ReconcileError> {
        self.tx.rollback().context("failed to roll back write transaction").map_err(store_error)
    }
}

fn query_candidates(conn: &Connection, spec: &FieldSpec) -> Result<Vec<FieldCandidate>> {
    let mut stmt = conn.prepare(
        "SELECT f.metadata_field_id, s.short_id, f.element, f.qualifier
         FROM metadatafieldregistry f
         JOIN metadataschemaregistry s ON s.metadata_schema_id = f.metadata_schema_id
         WHERE s.short_id = ?1 AND f.element = ?2 AND f.qualifier IS ?3
         ORDER BY f.metadata_field_id ASC",
    )?;
    let rows = stmt.query_map(params![spec.namespace, spec.element, spec.qualifier], |row| {
        Ok(FieldCandidate {
            field_id: FieldId(row.get(0)?),
            namespace: row.get(1)?,
            element: row.get(2)?,
            qualifier: row.get(3)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to look up field {spec}"))
}

fn assertion_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Assertion> {
    Ok(Assertion {
        object_id: ObjectId::new(row.get::<_, String>(0)?),
        field_id: FieldId(row.get(1)?),
        text_value: row.get(2)?,
    })
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists.is_some())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn store_error(err: anyhow::Error) -> ReconcileError {
    ReconcileError::Store(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use metadata_reconcile_core::{
        apply_plan, build_plan, run_job, AmbiguityPolicy, JobSpec, PathRewrite, RunMode,
        RunOptions, RunState, TransformRule, WriteInstruction,
    };

    use super::*;

    fn spec(value: &str) -> FieldSpec {
        FieldSpec::parse(value).unwrap_or_else(|err| panic!("bad spec {value}: {err}"))
    }

    fn seeded() -> Result<(SqliteStore, FieldId, FieldId)> {
        let store = SqliteStore::open_in_memory()?;
        let subject = store.register_field(&spec("dc.subject"), None)?;
        let flat = store.register_field(&spec("local.subject.flat"), Some("leaf terms"))?;
        Ok((store, subject, flat))
    }

    fn flatten_job() -> JobSpec {
        JobSpec::Flatten { source: spec("dc.subject"), target: spec("local.subject.flat") }
    }

    fn values(store: &SqliteStore, object_id: &str, field_id: FieldId) -> Result<Vec<String>> {
        Ok(store
            .row_snapshot()?
            .into_iter()
            .filter(|row| row.object_id.as_str() == object_id && row.field_id == field_id)
            .map(|row| row.text_value)
            .collect())
    }

    #[test]
    fn register_field_is_idempotent_and_qualifier_sensitive() -> Result<()> {
        let (store, subject, flat) = seeded()?;
        assert_ne!(subject, flat);
        assert_eq!(store.register_field(&spec("dc.subject"), None)?, subject);

        let candidates = store.field_candidates(&spec("dc.subject"))?;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].qualifier, None);
        Ok(())
    }

    #[test]
    fn duplicate_registry_rows_are_reported_as_candidates() -> Result<()> {
        let (mut store, subject, _) = seeded()?;
        store.conn.execute(
            "INSERT INTO metadatafieldregistry(metadata_schema_id, element, qualifier)
             SELECT metadata_schema_id, 'subject', NULL FROM metadataschemaregistry
             WHERE short_id = 'dc'",
            [],
        )?;

        let candidates = store.field_candidates(&spec("dc.subject"))?;
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].field_id, subject);

        let strict = run_job(
            &mut store,
            &flatten_job(),
            &RunOptions { policy: AmbiguityPolicy::Strict, ..RunOptions::default() },
        );
        assert!(matches!(strict, Err(ReconcileError::AmbiguousField { .. })));
        Ok(())
    }

    #[test]
    fn flatten_inserts_leaf_once_and_second_run_is_empty() -> Result<()> {
        let (mut store, subject, flat) = seeded()?;
        let object = ObjectId::new("3f2a9c7e-0000-4000-8000-000000000001");
        store.add_assertion(&object, subject, "A::B::C")?;

        let first = run_job(&mut store, &flatten_job(), &RunOptions::default())?;
        assert_eq!(first.apply.state, RunState::Committed);
        assert_eq!(first.apply.inserted, 1);
        assert_eq!(values(&store, object.as_str(), flat)?, vec!["C".to_string()]);

        let second = run_job(&mut store, &flatten_job(), &RunOptions::default())?;
        assert!(second.plan.is_empty());
        assert_eq!(second.apply.inserted, 0);
        assert_eq!(values(&store, object.as_str(), flat)?.len(), 1);
        Ok(())
    }

    #[test]
    fn dry_run_leaves_the_store_byte_for_byte_unchanged() -> Result<()> {
        let (mut store, subject, _) = seeded()?;
        store.add_assertion(&ObjectId::new("o1"), subject, "Root::Leaf")?;
        store.add_assertion(&ObjectId::new("o2"), subject, "Other::Leaf")?;
        let before = store.row_snapshot()?;

        let report = run_job(
            &mut store,
            &flatten_job(),
            &RunOptions { mode: RunMode::DryRun, ..RunOptions::default() },
        )?;

        assert_eq!(report.apply.state, RunState::Reported);
        assert_eq!(report.plan.pending_count(), 2);
        assert_eq!(store.row_snapshot()?, before);
        Ok(())
    }

    #[test]
    fn forced_failure_rolls_back_every_write_of_the_run() -> Result<()> {
        let (mut store, subject, flat) = seeded()?;
        for index in 1..=5 {
            let object = ObjectId::new(format!("o{index}"));
            store.add_assertion(&object, subject, &format!("T::V{index}"))?;
        }
        store.conn.execute_batch(
            "CREATE TRIGGER fail_third BEFORE INSERT ON metadatavalue
             WHEN NEW.text_value = 'V3'
             BEGIN SELECT RAISE(ABORT, 'forced failure'); END;",
        )?;
        let before = store.row_snapshot()?;

        let rule = TransformRule::SuffixExtraction { source: subject, target: flat };
        let plan = build_plan(&store, &rule, None)?;
        assert_eq!(plan.pending_count(), 5);

        let result = apply_plan(&mut store, &plan, RunMode::Apply);

        assert!(matches!(result, Err(ReconcileError::Transaction { index: 2, .. })));
        assert_eq!(store.row_snapshot()?, before);
        assert!(values(&store, "o1", flat)?.is_empty());
        Ok(())
    }

    #[test]
    fn failed_rewrite_restores_rows_rewritten_earlier_in_the_run() -> Result<()> {
        let (mut store, subject, flat) = seeded()?;
        store.add_assertion(&ObjectId::new("o1"), subject, "A")?;
        store.add_assertion(&ObjectId::new("o2"), subject, "B")?;
        store.add_assertion(&ObjectId::new("o3"), flat, "C")?;
        store.conn.execute_batch(
            "CREATE TRIGGER fail_second_rewrite BEFORE UPDATE ON metadatavalue
             WHEN NEW.text_value = 'R::B'
             BEGIN SELECT RAISE(ABORT, 'forced failure'); END;",
        )?;
        let before = store.row_snapshot()?;

        let rule = TransformRule::PathRewrite {
            scope: None,
            entries: vec![
                PathRewrite::new("A", "R::A"),
                PathRewrite::new("B", "R::B"),
                PathRewrite::new("C", "R::C"),
            ],
        };
        let plan = build_plan(&store, &rule, None)?;
        assert_eq!(plan.pending_count(), 3);

        let result = apply_plan(&mut store, &plan, RunMode::Apply);

        assert!(matches!(result, Err(ReconcileError::Transaction { index: 1, .. })));
        assert_eq!(store.row_snapshot()?, before);
        assert_eq!(values(&store, "o1", subject)?, vec!["A".to_string()]);
        Ok(())
    }

    #[test]
    fn insert_of_existing_row_is_a_write_conflict() -> Result<()> {
        let (mut store, subject, _) = seeded()?;
        let object = ObjectId::new("o1");
        store.add_assertion(&object, subject, "Leaf")?;

        let mut tx = store.begin()?;
        let result = tx.insert_assertion(&object, subject, "Leaf");
        assert!(matches!(result, Err(ReconcileError::WriteConflict { .. })));
        tx.insert_assertion(&object, subject, "Other")?;
        tx.commit()?;

        assert_eq!(values(&store, "o1", subject)?, vec!["Leaf".to_string(), "Other".to_string()]);
        Ok(())
    }

    #[test]
    fn rewrite_counts_and_replaces_exact_matches_only() -> Result<()> {
        let (mut store, subject, flat) = seeded()?;
        store.add_assertion(&ObjectId::new("o1"), subject, "Leaf")?;
        store.add_assertion(&ObjectId::new("o2"), flat, "Leaf")?;
        store.add_assertion(&ObjectId::new("o3"), subject, "Leaf ")?;

        let job = JobSpec::RewritePaths {
            scope: None,
            entries: vec![PathRewrite::new("Leaf", "Root::Leaf")],
        };
        let report = run_job(&mut store, &job, &RunOptions::default())?;

        assert!(matches!(
            report.plan.instructions.as_slice(),
            [WriteInstruction::Rewrite { matched_rows: 2, .. }]
        ));
        assert_eq!(report.apply.rows_rewritten, 2);
        assert_eq!(values(&store, "o1", subject)?, vec!["Root::Leaf".to_string()]);
        assert_eq!(values(&store, "o2", flat)?, vec!["Root::Leaf".to_string()]);
        assert_eq!(values(&store, "o3", subject)?, vec!["Leaf ".to_string()]);
        Ok(())
    }

    #[test]
    fn open_refuses_missing_files_and_foreign_schemas() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("mdr-store-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;

        let missing = dir.join("missing.sqlite3");
        assert!(SqliteStore::open(&missing).is_err());
        assert!(!missing.exists());

        let foreign = dir.join("foreign.sqlite3");
        Connection::open(&foreign)?.execute_batch("CREATE TABLE other (id INTEGER);")?;
        assert!(SqliteStore::open(&foreign).is_err());

        let created = dir.join("created.sqlite3");
        drop(SqliteStore::create(&created)?);
        let reopened = SqliteStore::open(&created)?;
        assert_eq!(reopened.count_assertions()?, 0);

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
