//! # Snapshotter (C4)
//!
//! A pair of pinned read snapshots of the replica plus a cursor over the
//! version-ordered diff between them.
//!
//! Each [`Snapshot`] is a read-only connection holding an open read
//! transaction; under WAL that transaction sees the replica exactly as it
//! was when pinned, no matter how far the replicator advances afterwards.
//! The diff walks `_viewsync_change_log` entries in
//! `(state_version, tbl, row_key)` order for `v1 < state_version <= v2`,
//! reading each row's before-image from the `prev` snapshot and its
//! after-image from `curr`. Truncate sentinels expand into one
//! `{prev, None}` entry per row the table had in `prev`.
//!
//! Statement handles on both connections are pooled (`prepare_cached`) and
//! return to their pools when the cursor is closed or dropped, on every
//! exit path including consumer panics.

use std::collections::VecDeque;
use std::path::Path;

use rusqlite::{params, Connection, OpenFlags};

use crate::error::{Error, Result};
use crate::types::{Row, RowKey, SqliteValue, TableSpec, Watermark};

// =============================================================================
// Snapshot
// =============================================================================

/// One pinned read view of the replica.
#[derive(Debug)]
pub struct Snapshot {
    conn: Connection,
    version: Watermark,
    schema_hash: String,
}

impl Snapshot {
    /// Pins the replica at whatever version it is currently at.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        // A deferred BEGIN plus the state read below acquires the WAL read
        // mark; from here the view is frozen.
        conn.execute_batch("BEGIN")?;
        let (version, schema_hash): (String, String) = conn.query_row(
            "SELECT version, schema_hash FROM _viewsync_replica_state",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(Self {
            conn,
            version: Watermark::new(version),
            schema_hash,
        })
    }

    /// Pins the replica and verifies it is still at `expected`.
    ///
    /// A caller that kept a logical position `expected` but finds the
    /// replica already advanced cannot diff from that position and must
    /// resync from a fresh pair.
    pub fn open_at(path: impl AsRef<Path>, expected: &Watermark) -> Result<Self> {
        let snapshot = Self::open(path)?;
        if snapshot.version != *expected {
            return Err(Error::InvalidDiff {
                expected: expected.as_str().to_string(),
                actual: snapshot.version.as_str().to_string(),
            });
        }
        Ok(snapshot)
    }

    /// The version this snapshot is pinned at.
    pub fn version(&self) -> &Watermark {
        &self.version
    }

    /// Schema hash at pin time.
    pub fn schema_hash(&self) -> &str {
        &self.schema_hash
    }

    /// Runs an arbitrary read against the pinned view.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Reads one row by key, `None` if absent in this snapshot.
    pub fn read_row(&self, spec: &TableSpec, key: &RowKey) -> Result<Option<Row>> {
        let mut clauses = Vec::new();
        let mut values: Vec<&dyn rusqlite::ToSql> = Vec::new();
        for (i, (column, value)) in key.columns().enumerate() {
            clauses.push(format!("\"{column}\" IS ?{}", i + 1));
            values.push(value);
        }
        let sql = format!(
            "SELECT * FROM \"{}\" WHERE {}",
            spec.name,
            clauses.join(" AND ")
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(values.as_slice())?;
        match rows.next()? {
            None => Ok(None),
            Some(row) => Ok(Some(materialize_row(row)?)),
        }
    }

    /// Reads every row of a table, in primary-key order.
    pub fn read_table(&self, spec: &TableSpec) -> Result<Vec<Row>> {
        let order = spec
            .primary_key
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT * FROM \"{}\" ORDER BY {order}", spec.name);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(materialize_row(row)?);
        }
        Ok(out)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        // Ends the read transaction; harmless if the connection already
        // rolled back.
        let _ = self.conn.execute_batch("ROLLBACK");
    }
}

fn materialize_row(row: &rusqlite::Row<'_>) -> Result<Row> {
    let mut out = Row::new();
    for i in 0..row.as_ref().column_count() {
        let name = row.as_ref().column_name(i)?.to_string();
        let value: SqliteValue = row.get(i)?;
        out.insert(name, value);
    }
    Ok(out)
}

// =============================================================================
// Snapshotter
// =============================================================================

/// One diff entry: a row's before- and after-image. At least one side is
/// always present.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    /// Table the row belongs to.
    pub table: String,
    /// The row as of the older snapshot, if it existed.
    pub prev: Option<Row>,
    /// The row as of the newer snapshot, if it still exists.
    pub next: Option<Row>,
}

/// A `prev`/`curr` snapshot pair ready to diff.
#[derive(Debug)]
pub struct Snapshotter {
    prev: Snapshot,
    curr: Snapshot,
}

impl Snapshotter {
    /// Pairs two pinned snapshots.
    ///
    /// Fails with [`Error::SchemaChange`] when the column layout differs
    /// between them — a diff across a schema change is meaningless and the
    /// caller must re-materialize from scratch.
    pub fn new(prev: Snapshot, curr: Snapshot) -> Result<Self> {
        if prev.version() > curr.version() {
            return Err(Error::InvalidDiff {
                expected: prev.version.as_str().to_string(),
                actual: curr.version.as_str().to_string(),
            });
        }
        if prev.schema_hash != curr.schema_hash {
            return Err(Error::SchemaChange {
                prev: prev.version.as_str().to_string(),
                curr: curr.version.as_str().to_string(),
            });
        }
        Ok(Self { prev, curr })
    }

    /// The older snapshot.
    pub fn prev(&self) -> &Snapshot {
        &self.prev
    }

    /// The newer snapshot.
    pub fn curr(&self) -> &Snapshot {
        &self.curr
    }

    /// Rotates the pair forward: the current snapshot becomes `prev` and
    /// `next` becomes `curr`. The old `prev` unpins on drop.
    pub fn advance(self, next: Snapshot) -> Result<Snapshotter> {
        Snapshotter::new(self.curr, next)
    }

    /// Opens the diff cursor over `(prev.version, curr.version]`.
    ///
    /// ChangeLog entries are read up front (the window between two
    /// snapshots is small); row images are fetched lazily per entry.
    pub fn diff<'a>(
        &'a self,
        tables: &'a std::collections::BTreeMap<String, TableSpec>,
    ) -> Result<DiffCursor<'a>> {
        let mut stmt = self.curr.conn.prepare_cached(
            "SELECT state_version, tbl, row_key, op FROM _viewsync_change_log
             WHERE state_version > ?1 AND state_version <= ?2
             ORDER BY state_version, tbl, row_key",
        )?;
        let mut rows = stmt.query(params![
            self.prev.version.as_str(),
            self.curr.version.as_str()
        ])?;
        let mut entries = VecDeque::new();
        while let Some(row) = rows.next()? {
            entries.push_back(LogEntry {
                table: row.get(1)?,
                row_key: row.get(2)?,
                op: row.get::<_, String>(3)?,
            });
        }
        Ok(DiffCursor {
            snapshotter: self,
            tables,
            entries,
            truncating: VecDeque::new(),
            closed: false,
        })
    }
}

struct LogEntry {
    table: String,
    row_key: String,
    op: String,
}

// =============================================================================
// Diff Cursor
// =============================================================================

/// Lazy cursor over a snapshot pair's diff. [`DiffCursor::close`] (or
/// drop) returns all pooled statements.
pub struct DiffCursor<'a> {
    snapshotter: &'a Snapshotter,
    tables: &'a std::collections::BTreeMap<String, TableSpec>,
    entries: VecDeque<LogEntry>,
    /// Rows still to be emitted for an in-progress truncate expansion.
    truncating: VecDeque<(String, Row)>,
    closed: bool,
}

impl DiffCursor<'_> {
    /// The next diff entry, or `None` at exhaustion.
    pub fn next(&mut self) -> Result<Option<DiffEntry>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            if let Some((table, prev_row)) = self.truncating.pop_front() {
                return Ok(Some(DiffEntry {
                    table,
                    prev: Some(prev_row),
                    next: None,
                }));
            }

            let entry = match self.entries.pop_front() {
                Some(entry) => entry,
                None => return Ok(None),
            };
            let spec = self
                .tables
                .get(&entry.table)
                .ok_or_else(|| Error::InvalidQuery {
                    reason: format!("change log references unknown table '{}'", entry.table),
                })?;

            match entry.op.as_str() {
                "t" => {
                    for row in self.snapshotter.prev.read_table(spec)? {
                        self.truncating.push_back((entry.table.clone(), row));
                    }
                    // An empty table in prev expands to nothing.
                    continue;
                }
                op => {
                    let key: RowKey = serde_json::from_str(&entry.row_key)?;
                    let prev = self.snapshotter.prev.read_row(spec, &key)?;
                    let next = if op == "s" {
                        self.snapshotter.curr.read_row(spec, &key)?
                    } else {
                        None
                    };
                    if prev.is_none() && next.is_none() {
                        // A row created and deleted inside the window has
                        // no visible effect on either side.
                        continue;
                    }
                    return Ok(Some(DiffEntry {
                        table: entry.table,
                        prev,
                        next,
                    }));
                }
            }
        }
    }

    /// Drains nothing further; statements go back to their pools.
    pub fn close(mut self) {
        self.closed = true;
        self.entries.clear();
        self.truncating.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicator::Replica;
    use crate::types::{Change, ColumnSpec, ColumnType, CommitRecord};
    use std::collections::BTreeMap;

    fn issues_spec() -> TableSpec {
        let mut columns = BTreeMap::new();
        columns.insert(
            "id".to_string(),
            ColumnSpec {
                data_type: ColumnType::Integer,
                not_null: true,
                pos: 0,
            },
        );
        columns.insert(
            "title".to_string(),
            ColumnSpec {
                data_type: ColumnType::Text,
                not_null: false,
                pos: 1,
            },
        );
        TableSpec {
            name: "issues".to_string(),
            columns,
            primary_key: vec!["id".to_string()],
        }
    }

    fn row(id: i64, title: &str) -> Row {
        let mut row = Row::new();
        row.insert("id".to_string(), SqliteValue::Integer(id));
        row.insert("title".to_string(), SqliteValue::Text(title.to_string()));
        row
    }

    fn wm(v: u64) -> Watermark {
        Watermark::from_u64(v)
    }

    fn commit(v: u64, changes: Vec<Change>) -> CommitRecord {
        CommitRecord {
            watermark: wm(v),
            changes,
        }
    }

    fn table_map() -> BTreeMap<String, TableSpec> {
        let mut map = BTreeMap::new();
        map.insert("issues".to_string(), issues_spec());
        map
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        replica: Replica,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let replica = Replica::open(dir.path().join("replica.db"), &[issues_spec()]).unwrap();
        Fixture { _dir: dir, replica }
    }

    #[test]
    fn diff_yields_inserts_updates_and_deletes_in_version_order() {
        let mut fx = fixture();
        fx.replica
            .apply_commit(&commit(
                1,
                vec![
                    Change::Insert {
                        table: "issues".to_string(),
                        row: row(1, "a"),
                    },
                    Change::Insert {
                        table: "issues".to_string(),
                        row: row(2, "b"),
                    },
                ],
            ))
            .unwrap();
        let prev = Snapshot::open_at(fx.replica.path(), &wm(1)).unwrap();

        fx.replica
            .apply_commit(&commit(
                2,
                vec![Change::Update {
                    table: "issues".to_string(),
                    old_key: None,
                    row: row(1, "a2"),
                }],
            ))
            .unwrap();
        fx.replica
            .apply_commit(&commit(
                3,
                vec![
                    Change::Delete {
                        table: "issues".to_string(),
                        key: RowKey::from_parts([("id".to_string(), SqliteValue::Integer(2))]),
                    },
                    Change::Insert {
                        table: "issues".to_string(),
                        row: row(3, "c"),
                    },
                ],
            ))
            .unwrap();
        let curr = Snapshot::open_at(fx.replica.path(), &wm(3)).unwrap();

        let tables = table_map();
        let snapshotter = Snapshotter::new(prev, curr).unwrap();
        let mut cursor = snapshotter.diff(&tables).unwrap();

        let mut seen = Vec::new();
        while let Some(entry) = cursor.next().unwrap() {
            seen.push(entry);
        }
        assert_eq!(seen.len(), 3);

        // (v2, issues, id=1): update
        assert_eq!(
            seen[0].prev.as_ref().unwrap().get("title"),
            Some(&SqliteValue::Text("a".to_string()))
        );
        assert_eq!(
            seen[0].next.as_ref().unwrap().get("title"),
            Some(&SqliteValue::Text("a2".to_string()))
        );
        // (v3, issues, id=2): delete
        assert!(seen[1].prev.is_some() && seen[1].next.is_none());
        // (v3, issues, id=3): insert
        assert!(seen[2].prev.is_none());
        assert_eq!(
            seen[2].next.as_ref().unwrap().get("_0_version"),
            Some(&SqliteValue::Text(wm(3).as_str().to_string()))
        );
    }

    #[test]
    fn truncate_expands_to_prev_rows() {
        let mut fx = fixture();
        fx.replica
            .apply_commit(&commit(
                1,
                vec![
                    Change::Insert {
                        table: "issues".to_string(),
                        row: row(1, "a"),
                    },
                    Change::Insert {
                        table: "issues".to_string(),
                        row: row(2, "b"),
                    },
                ],
            ))
            .unwrap();
        let prev = Snapshot::open_at(fx.replica.path(), &wm(1)).unwrap();

        fx.replica
            .apply_commit(&commit(
                2,
                vec![Change::Truncate {
                    table: "issues".to_string(),
                }],
            ))
            .unwrap();
        let curr = Snapshot::open_at(fx.replica.path(), &wm(2)).unwrap();

        let tables = table_map();
        let snapshotter = Snapshotter::new(prev, curr).unwrap();
        let mut cursor = snapshotter.diff(&tables).unwrap();

        let mut deleted = Vec::new();
        while let Some(entry) = cursor.next().unwrap() {
            assert!(entry.next.is_none());
            deleted.push(
                entry
                    .prev
                    .unwrap()
                    .get("id")
                    .and_then(|v| v.as_integer())
                    .unwrap(),
            );
        }
        assert_eq!(deleted, vec![1, 2]);
    }

    #[test]
    fn pinned_snapshot_ignores_later_commits() {
        let mut fx = fixture();
        fx.replica
            .apply_commit(&commit(
                1,
                vec![Change::Insert {
                    table: "issues".to_string(),
                    row: row(1, "old"),
                }],
            ))
            .unwrap();
        let pinned = Snapshot::open(fx.replica.path()).unwrap();

        fx.replica
            .apply_commit(&commit(
                2,
                vec![Change::Update {
                    table: "issues".to_string(),
                    old_key: None,
                    row: row(1, "new"),
                }],
            ))
            .unwrap();

        let spec = issues_spec();
        let key = RowKey::from_parts([("id".to_string(), SqliteValue::Integer(1))]);
        let seen = pinned.read_row(&spec, &key).unwrap().unwrap();
        assert_eq!(seen.get("title"), Some(&SqliteValue::Text("old".to_string())));
    }

    #[test]
    fn open_at_stale_version_is_an_invalid_diff() {
        let mut fx = fixture();
        fx.replica
            .apply_commit(&commit(
                1,
                vec![Change::Insert {
                    table: "issues".to_string(),
                    row: row(1, "a"),
                }],
            ))
            .unwrap();
        fx.replica
            .apply_commit(&commit(
                2,
                vec![Change::Insert {
                    table: "issues".to_string(),
                    row: row(2, "b"),
                }],
            ))
            .unwrap();

        let err = Snapshot::open_at(fx.replica.path(), &wm(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidDiff { .. }));
    }

    #[test]
    fn schema_change_between_snapshots_is_refused() {
        let mut fx = fixture();
        fx.replica
            .apply_commit(&commit(
                1,
                vec![Change::Insert {
                    table: "issues".to_string(),
                    row: row(1, "a"),
                }],
            ))
            .unwrap();
        let prev = Snapshot::open(fx.replica.path()).unwrap();

        let mut wider = issues_spec();
        wider.columns.insert(
            "owner".to_string(),
            ColumnSpec {
                data_type: ColumnType::Text,
                not_null: false,
                pos: 2,
            },
        );
        fx.replica.migrate(&[wider]).unwrap();
        fx.replica
            .apply_commit(&commit(
                2,
                vec![Change::Insert {
                    table: "issues".to_string(),
                    row: row(2, "b"),
                }],
            ))
            .unwrap();
        let curr = Snapshot::open(fx.replica.path()).unwrap();

        let err = Snapshotter::new(prev, curr).unwrap_err();
        assert!(matches!(err, Error::SchemaChange { .. }));
    }
}
