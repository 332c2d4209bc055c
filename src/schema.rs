//! # SQLite Schema
//!
//! DDL and initialization for the two stores the engine owns:
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────────────┐
//! │        CDC store (C1)        │   │             Replica (C3)             │
//! ├──────────────────────────────┤   ├──────────────────────────────────────┤
//! │ change_log                   │   │ <data tables> (+ _0_version TEXT)    │
//! │   (watermark, pos, change)   │   │ _viewsync_change_log                 │
//! │ replication_state            │   │   (state_version, tbl, row_key, op)  │
//! │   (last_watermark, owner)    │   │ _viewsync_replica_state              │
//! │ replication_config           │   │   (version, schema_hash)             │
//! │   (replica_version, pubs,    │   │ _viewsync_schema_versions            │
//! │    reset_required)           │   │   (min/max supported)                │
//! └──────────────────────────────┘   └──────────────────────────────────────┘
//! ```
//!
//! Both stores run in WAL mode: one writer, many readers, and readers get
//! stable snapshots for the lifetime of their read transaction — which is
//! exactly what the snapshotter pins.
//!
//! The spec's schema-scoped names (`_zero.ChangeLog` style) flatten to
//! `_viewsync_*` prefixes; SQLite has no schema namespaces.

use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::types::{TableSpec, ROW_VERSION_COLUMN};

// =============================================================================
// Schema Version
// =============================================================================

/// Bumped on breaking layout changes; stored in `PRAGMA user_version`.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// CDC Store DDL
// =============================================================================

/// The durable change log: one row per change record, ordered by
/// `(watermark, pos)` where `pos` orders records within one commit.
const CREATE_CHANGE_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS change_log (
    watermark TEXT NOT NULL,
    pos       INTEGER NOT NULL,
    change    TEXT NOT NULL,
    PRIMARY KEY (watermark, pos)
)
"#;

/// Singleton replication state: the log's head watermark and the writer
/// lease token. `lock = 1` pins the table to exactly one row.
const CREATE_REPLICATION_STATE: &str = r#"
CREATE TABLE IF NOT EXISTS replication_state (
    lock           INTEGER PRIMARY KEY CHECK (lock = 1),
    last_watermark TEXT NOT NULL,
    owner          TEXT
)
"#;

/// Singleton replication config: identity of the replica this log feeds.
/// A mismatch at startup truncates and reinitializes C1/C3 state.
const CREATE_REPLICATION_CONFIG: &str = r#"
CREATE TABLE IF NOT EXISTS replication_config (
    lock            INTEGER PRIMARY KEY CHECK (lock = 1),
    replica_version TEXT NOT NULL,
    publications    TEXT NOT NULL,
    reset_required  INTEGER NOT NULL DEFAULT 0
)
"#;

// =============================================================================
// Replica DDL
// =============================================================================

/// The cross-table ChangeLog: at most one live entry per `(tbl, row_key)`;
/// a newer `state_version` supersedes in place via the unique index.
///
/// `row_key` is the canonical JSON of the normalized primary key. Truncate
/// sentinels store the empty string (NULL would defeat both the primary key
/// and the uniqueness constraint under SQLite's NULL semantics).
const CREATE_REPLICA_CHANGE_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS _viewsync_change_log (
    state_version TEXT NOT NULL,
    tbl           TEXT NOT NULL,
    row_key       TEXT NOT NULL,
    op            TEXT NOT NULL CHECK (op IN ('s', 'd', 't')),
    PRIMARY KEY (state_version, tbl, row_key)
)
"#;

/// Enforces at-most-one live entry per row across versions.
const CREATE_REPLICA_CHANGE_LOG_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS _viewsync_change_log_row
ON _viewsync_change_log (tbl, row_key)
"#;

/// Singleton replica state: the version the replica is at and a hash of
/// its column layout. The snapshotter reads this row inside its pinned
/// transaction to detect advancement and schema changes.
const CREATE_REPLICA_STATE: &str = r#"
CREATE TABLE IF NOT EXISTS _viewsync_replica_state (
    lock        INTEGER PRIMARY KEY CHECK (lock = 1),
    version     TEXT NOT NULL,
    schema_hash TEXT NOT NULL
)
"#;

/// Singleton protocol-version range supported by this replica.
const CREATE_SCHEMA_VERSIONS: &str = r#"
CREATE TABLE IF NOT EXISTS _viewsync_schema_versions (
    lock                  INTEGER PRIMARY KEY CHECK (lock = 1),
    min_supported_version INTEGER NOT NULL,
    max_supported_version INTEGER NOT NULL
)
"#;

// =============================================================================
// Initialization
// =============================================================================

/// Applies connection pragmas common to both stores.
pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Initializes (or verifies) the CDC store layout.
pub fn init_cdc_store(conn: &Connection) -> Result<()> {
    apply_pragmas(conn)?;
    check_user_version(conn)?;
    conn.execute_batch(&format!(
        "{CREATE_CHANGE_LOG};{CREATE_REPLICATION_STATE};{CREATE_REPLICATION_CONFIG};"
    ))?;
    conn.execute(
        "INSERT OR IGNORE INTO replication_state (lock, last_watermark, owner)
         VALUES (1, '', NULL)",
        [],
    )?;
    Ok(())
}

/// Initializes (or verifies) the replica's bookkeeping tables.
pub fn init_replica(conn: &Connection) -> Result<()> {
    apply_pragmas(conn)?;
    check_user_version(conn)?;
    conn.execute_batch(&format!(
        "{CREATE_REPLICA_CHANGE_LOG};{CREATE_REPLICA_CHANGE_LOG_INDEX};\
         {CREATE_REPLICA_STATE};{CREATE_SCHEMA_VERSIONS};"
    ))?;
    conn.execute(
        "INSERT OR IGNORE INTO _viewsync_replica_state (lock, version, schema_hash)
         VALUES (1, '', '')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO _viewsync_schema_versions
         (lock, min_supported_version, max_supported_version)
         VALUES (1, 1, 1)",
        [],
    )?;
    Ok(())
}

/// Verifies `PRAGMA user_version`, stamping it on a fresh database.
fn check_user_version(conn: &Connection) -> Result<()> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version == 0 {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        return Ok(());
    }
    if version != SCHEMA_VERSION {
        return Err(Error::DatabaseInit {
            reason: format!(
                "store has schema version {version}, this build expects {SCHEMA_VERSION}"
            ),
        });
    }
    Ok(())
}

// =============================================================================
// Data Tables
// =============================================================================

/// Creates a data table from its spec, appending the implicit
/// [`ROW_VERSION_COLUMN`].
pub fn create_data_table(conn: &Connection, spec: &TableSpec) -> Result<()> {
    conn.execute_batch(&data_table_ddl(spec))?;
    Ok(())
}

/// Renders the DDL for a data table. Columns appear in declaration order
/// (`pos`), then the version column, then the primary key.
pub fn data_table_ddl(spec: &TableSpec) -> String {
    let mut cols: Vec<(&String, &crate::types::ColumnSpec)> = spec.columns.iter().collect();
    cols.sort_by_key(|(_, c)| c.pos);

    let mut ddl = format!("CREATE TABLE IF NOT EXISTS \"{}\" (\n", spec.name);
    for (name, col) in cols {
        let not_null = if col.not_null { " NOT NULL" } else { "" };
        ddl.push_str(&format!("  \"{name}\" {}{not_null},\n", col.data_type.sql_type()));
    }
    ddl.push_str(&format!("  \"{ROW_VERSION_COLUMN}\" TEXT NOT NULL,\n"));
    let pk = spec
        .primary_key
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    ddl.push_str(&format!("  PRIMARY KEY ({pk})\n)"));
    ddl
}

/// Stable hash of the replica's column layout, stored in
/// `_viewsync_replica_state.schema_hash`. Two snapshots with different
/// hashes cannot be diffed.
pub fn schema_hash(specs: &[TableSpec]) -> String {
    use sha2::{Digest, Sha256};
    let mut sorted: Vec<&TableSpec> = specs.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let mut hasher = Sha256::new();
    for spec in sorted {
        hasher.update(spec.name.as_bytes());
        hasher.update([0u8]);
        for (name, col) in &spec.columns {
            hasher.update(name.as_bytes());
            hasher.update([col.data_type.sql_type().as_bytes()[0], u8::from(col.not_null)]);
        }
        hasher.update([0xffu8]);
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// =============================================================================
// Tests
// =============================================================================
