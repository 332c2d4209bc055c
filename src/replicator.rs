//! # Replicator (C3)
//!
//! Applies streamed commits to the local SQLite replica and maintains the
//! cross-table ChangeLog that makes snapshot diffs cheap.
//!
//! Per commit, one replica transaction:
//!
//! 1. Row ops land in the data tables, with `_0_version` set to the
//!    commit's watermark on every affected row.
//! 2. `_viewsync_change_log` entries are upserted: a `set` supersedes any
//!    prior live entry for the same `(tbl, row_key)` in place, bumping its
//!    `state_version`; a `truncate` clears the table's entries and leaves
//!    one sentinel.
//! 3. `_viewsync_replica_state.version` advances to the watermark.
//!
//! The in-memory version is updated only after the transaction commits, so
//! memory never leads disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::schema;
use crate::streamer::ChangeStream;
use crate::types::{Change, CommitRecord, Row, RowKey, SqliteValue, TableSpec, Watermark, ROW_VERSION_COLUMN};

/// Capacity of the commit-notification channel feeding view syncers.
const NOTIFY_CAPACITY: usize = 256;

// =============================================================================
// Replica
// =============================================================================

/// The local columnar replica: data tables plus the bookkeeping tables the
/// snapshotter and view syncer depend on. Single writer; readers open
/// their own read-only connections against [`Replica::path`].
pub struct Replica {
    conn: Connection,
    path: PathBuf,
    tables: BTreeMap<String, TableSpec>,
    version: Watermark,
    schema_hash: String,
}

impl Replica {
    /// Opens (or creates) the replica at `path` with the given tables.
    pub fn open(path: impl AsRef<Path>, specs: &[TableSpec]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(|e| Error::DatabaseInit {
            reason: format!("cannot open replica at {}: {e}", path.display()),
        })?;
        schema::init_replica(&conn)?;
        for spec in specs {
            schema::create_data_table(&conn, spec)?;
        }

        let hash = schema::schema_hash(specs);
        let (version, stored_hash): (String, String) = conn.query_row(
            "SELECT version, schema_hash FROM _viewsync_replica_state",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if stored_hash.is_empty() {
            conn.execute(
                "UPDATE _viewsync_replica_state SET schema_hash = ?1",
                params![hash],
            )?;
        } else if stored_hash != hash {
            return Err(Error::DatabaseInit {
                reason: "replica schema does not match the supplied table specs".to_string(),
            });
        }

        Ok(Self {
            conn,
            path,
            tables: specs.iter().map(|s| (s.name.clone(), s.clone())).collect(),
            version: Watermark::new(version),
            schema_hash: hash,
        })
    }

    /// The replica file path; snapshot readers open this.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The replica's current version.
    pub fn version(&self) -> &Watermark {
        &self.version
    }

    /// Hash of the current column layout.
    pub fn schema_hash(&self) -> &str {
        &self.schema_hash
    }

    /// The spec of `table`, if replicated.
    pub fn table(&self, table: &str) -> Option<&TableSpec> {
        self.tables.get(table)
    }

    /// All replicated table specs.
    pub fn tables(&self) -> impl Iterator<Item = &TableSpec> {
        self.tables.values()
    }

    // =========================================================================
    // Initial Sync
    // =========================================================================

    /// Bulk-loads an upstream snapshot consistent at `baseline`. One
    /// transaction; the ChangeLog stays empty — views materialize by full
    /// execution, diffs only matter from `baseline` on.
    pub fn initial_sync(
        &mut self,
        baseline: &Watermark,
        data: Vec<(String, Vec<Row>)>,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        let mut loaded = 0usize;
        for (table, rows) in data {
            let spec = self.tables.get(&table).ok_or_else(|| Error::InvalidQuery {
                reason: format!("initial sync references unknown table '{table}'"),
            })?;
            for row in rows {
                upsert_row(&tx, spec, &row, baseline)?;
                loaded += 1;
            }
        }
        tx.execute(
            "UPDATE _viewsync_replica_state SET version = ?1",
            params![baseline.as_str()],
        )?;
        tx.commit()?;
        self.version = baseline.clone();
        info!(rows = loaded, baseline = %baseline, "initial sync complete");
        Ok(())
    }

    // =========================================================================
    // Commit Application
    // =========================================================================

    /// Applies one commit atomically; see the module docs for the steps.
    pub fn apply_commit(&mut self, commit: &CommitRecord) -> Result<()> {
        if commit.watermark <= self.version {
            debug!(watermark = %commit.watermark, "skipping already-applied commit");
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        for change in &commit.changes {
            apply_change(&tx, &self.tables, change, &commit.watermark)?;
        }
        tx.execute(
            "UPDATE _viewsync_replica_state SET version = ?1",
            params![commit.watermark.as_str()],
        )?;
        tx.commit()?;
        self.version = commit.watermark.clone();
        Ok(())
    }

    // =========================================================================
    // Schema Migration
    // =========================================================================

    /// Replaces the table specs, adding any new tables/columns and bumping
    /// the stored schema hash. Diffs spanning this point fail with
    /// `SchemaChange` until views re-materialize.
    pub fn migrate(&mut self, specs: &[TableSpec]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for spec in specs {
            match self.tables.get(&spec.name) {
                None => {
                    tx.execute_batch(&schema::data_table_ddl(spec))?;
                }
                Some(old) => {
                    for (name, col) in &spec.columns {
                        if !old.columns.contains_key(name) {
                            tx.execute_batch(&format!(
                                "ALTER TABLE \"{}\" ADD COLUMN \"{name}\" {}",
                                spec.name,
                                col.data_type.sql_type()
                            ))?;
                        }
                    }
                }
            }
        }
        let hash = schema::schema_hash(specs);
        tx.execute(
            "UPDATE _viewsync_replica_state SET schema_hash = ?1",
            params![hash],
        )?;
        tx.commit()?;
        self.schema_hash = hash;
        self.tables = specs.iter().map(|s| (s.name.clone(), s.clone())).collect();
        Ok(())
    }

    /// Closes the replica, deleting its file and WAL sidecars. Used by
    /// the supervisor on auto-reset.
    pub fn wipe(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.conn);
        remove_store_files(&path)
    }
}

/// Removes a SQLite store's main file plus its `-wal`/`-shm` sidecars.
pub fn remove_store_files(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|e| Error::DatabaseInit {
            reason: format!("cannot remove {}: {e}", path.display()),
        })?;
    }
    for suffix in ["-wal", "-shm"] {
        let sidecar = PathBuf::from(format!("{}{suffix}", path.display()));
        let _ = std::fs::remove_file(sidecar);
    }
    Ok(())
}

// =============================================================================
// Row Ops
// =============================================================================

fn apply_change(
    tx: &rusqlite::Transaction<'_>,
    tables: &BTreeMap<String, TableSpec>,
    change: &Change,
    watermark: &Watermark,
) -> Result<()> {
    let table = match change.table() {
        Some(table) => table,
        // Begin/Commit markers never reach an assembled CommitRecord, but
        // tolerate them rather than corrupting the transaction.
        None => return Ok(()),
    };
    let spec = tables.get(table).ok_or_else(|| Error::InvalidQuery {
        reason: format!("change references unknown table '{table}'"),
    })?;

    match change {
        Change::Insert { row, .. } => {
            upsert_row(tx, spec, row, watermark)?;
            log_set(tx, spec, row, watermark)?;
        }
        Change::Update { old_key, row, .. } => {
            if let Some(old_key) = old_key {
                delete_row(tx, spec, old_key)?;
                log_entry(tx, spec, &old_key.canonical_json(), "d", watermark)?;
            }
            upsert_row(tx, spec, row, watermark)?;
            log_set(tx, spec, row, watermark)?;
        }
        Change::Delete { key, .. } => {
            delete_row(tx, spec, key)?;
            log_entry(tx, spec, &key.canonical_json(), "d", watermark)?;
        }
        Change::Truncate { .. } => {
            tx.execute(&format!("DELETE FROM \"{}\"", spec.name), [])?;
            tx.execute(
                "DELETE FROM _viewsync_change_log WHERE tbl = ?1",
                params![spec.name],
            )?;
            log_entry(tx, spec, "", "t", watermark)?;
        }
        Change::Begin | Change::Commit { .. } => {}
    }
    Ok(())
}

fn upsert_row(
    tx: &rusqlite::Transaction<'_>,
    spec: &TableSpec,
    row: &Row,
    watermark: &Watermark,
) -> Result<()> {
    let mut columns: Vec<&str> = Vec::with_capacity(row.len() + 1);
    let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(row.len() + 1);
    for (name, value) in row {
        if !spec.has_column(name) {
            return Err(Error::InvalidQuery {
                reason: format!("row references unknown column '{}.{name}'", spec.name),
            });
        }
        columns.push(name);
        values.push(value);
    }
    let version = SqliteValue::Text(watermark.as_str().to_string());
    columns.push(ROW_VERSION_COLUMN);
    values.push(&version);

    let column_list = columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT OR REPLACE INTO \"{}\" ({column_list}) VALUES ({placeholders})",
        spec.name
    );
    tx.prepare_cached(&sql)?.execute(values.as_slice())?;
    Ok(())
}

fn delete_row(tx: &rusqlite::Transaction<'_>, spec: &TableSpec, key: &RowKey) -> Result<()> {
    let mut clauses = Vec::new();
    let mut values: Vec<&dyn rusqlite::ToSql> = Vec::new();
    for (i, (column, value)) in key.columns().enumerate() {
        // IS handles NULL key parts; = would silently match nothing.
        clauses.push(format!("\"{column}\" IS ?{}", i + 1));
        values.push(value);
    }
    let sql = format!(
        "DELETE FROM \"{}\" WHERE {}",
        spec.name,
        clauses.join(" AND ")
    );
    tx.prepare_cached(&sql)?.execute(values.as_slice())?;
    Ok(())
}

fn log_set(
    tx: &rusqlite::Transaction<'_>,
    spec: &TableSpec,
    row: &Row,
    watermark: &Watermark,
) -> Result<()> {
    let key = RowKey::from_row(row, &spec.primary_key)?;
    log_entry(tx, spec, &key.canonical_json(), "s", watermark)
}

fn log_entry(
    tx: &rusqlite::Transaction<'_>,
    spec: &TableSpec,
    row_key: &str,
    op: &str,
    watermark: &Watermark,
) -> Result<()> {
    tx.prepare_cached(
        "INSERT INTO _viewsync_change_log (state_version, tbl, row_key, op)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (tbl, row_key) DO UPDATE SET
           state_version = excluded.state_version,
           op = excluded.op",
    )?
    .execute(params![watermark.as_str(), spec.name, row_key, op])?;
    Ok(())
}

// =============================================================================
// Replicator Task
// =============================================================================

/// A commit that has landed on the replica, broadcast to view syncers.
#[derive(Debug, Clone)]
pub struct ReplicaChange {
    /// Replica version before the commit.
    pub prev: Watermark,
    /// Replica version after the commit.
    pub next: Watermark,
    /// The commit itself, for invalidation tagging.
    pub commit: std::sync::Arc<CommitRecord>,
}

/// Drives the replica from a change stream and broadcasts applied commits.
pub struct Replicator {
    replica: Replica,
    notify_tx: broadcast::Sender<ReplicaChange>,
}

impl Replicator {
    /// Wraps an opened replica.
    pub fn new(replica: Replica) -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self { replica, notify_tx }
    }

    /// The replica under replication.
    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Mutable access for initial sync and migrations.
    pub fn replica_mut(&mut self) -> &mut Replica {
        &mut self.replica
    }

    /// Subscribes to applied-commit notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaChange> {
        self.notify_tx.subscribe()
    }

    /// The notification sender, for creating receivers after this
    /// replicator has moved into its task.
    pub fn notifier(&self) -> broadcast::Sender<ReplicaChange> {
        self.notify_tx.clone()
    }

    /// Applies one commit and notifies subscribers. Exposed for tests and
    /// in-process drivers; [`Replicator::run`] is the production loop.
    pub fn apply(&mut self, commit: std::sync::Arc<CommitRecord>) -> Result<()> {
        let prev = self.replica.version().clone();
        self.replica.apply_commit(&commit)?;
        let next = self.replica.version().clone();
        if next != prev {
            // No receivers is fine; view syncers may come and go.
            let _ = self.notify_tx.send(ReplicaChange { prev, next, commit });
        }
        Ok(())
    }

    /// Consumes commits from the streamer until it ends or errors.
    pub async fn run(mut self, mut stream: ChangeStream) -> Result<()> {
        while let Some(commit) = stream.next().await? {
            self.apply(commit)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
