//! # Domain Types
//!
//! Core types shared by the whole pipeline: watermarks, change records, rows
//! and row identities, table specs, and the identifier newtypes.
//!
//! ## Invariants
//!
//! - [`Watermark`]: lexicographic byte order equals version order; strictly
//!   increasing across commits.
//! - [`RowKey`]: column order is normalized (sorted) before serialization,
//!   so the same logical key always fingerprints identically.
//! - Every replicated row carries a [`ROW_VERSION_COLUMN`] equal to the
//!   watermark of the transaction that last wrote it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the implicit per-row version column.
pub const ROW_VERSION_COLUMN: &str = "_0_version";

/// Largest integer magnitude representable exactly as an IEEE 754 double.
///
/// Outbound pokes reject anything beyond this rather than silently
/// truncating on the client.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

// =============================================================================
// Watermark
// =============================================================================

/// A lexicographically sortable, strictly increasing version string.
///
/// Two watermarks `a < b` iff byte-compare orders them. Watermarks built
/// with [`Watermark::from_u64`] use a length-prefixed base-36 encoding
/// (`'a' + ndigits - 1`, then the digits), so numeric order and byte order
/// agree without padding:
///
/// ```text
/// 0   -> "a0"
/// 35  -> "az"
/// 36  -> "b10"
/// 1295-> "bzz"
/// ```
///
/// A watermark may additionally carry a *minor* suffix (`"<major>.<minor>"`)
/// for cookie advances that happen between upstream commits, e.g. when a
/// client's desired-query set changes. `"b10" < "b10.a1" < "b11"` holds
/// under byte order because `'.'` sorts below every base-36 digit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(String);

impl Watermark {
    /// The empty-position sentinel; sorts before every real watermark.
    pub const MIN: Watermark = Watermark(String::new());

    /// Wraps an already-encoded watermark string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Encodes a numeric position as a sortable watermark.
    pub fn from_u64(v: u64) -> Self {
        let digits = to_base36(v);
        let prefix = (b'a' + (digits.len() as u8 - 1)) as char;
        Self(format!("{prefix}{digits}"))
    }

    /// Derives a cookie strictly between this watermark and the next
    /// upstream one, for pokes that advance client state without an
    /// upstream commit.
    pub fn with_minor(&self, minor: u64) -> Watermark {
        let digits = to_base36(minor);
        let prefix = (b'a' + (digits.len() as u8 - 1)) as char;
        Watermark(format!("{}.{prefix}{digits}", self.major()))
    }

    /// The major (upstream commit) component, with any minor suffix removed.
    pub fn major(&self) -> &str {
        match self.0.find('.') {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the [`Watermark::MIN`] sentinel.
    pub fn is_min(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Watermark {
    fn from(s: &str) -> Self {
        Watermark::new(s)
    }
}

fn to_base36(mut v: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if v == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while v > 0 {
        out.push(DIGITS[(v % 36) as usize]);
        v /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

// =============================================================================
// Scalar Values
// =============================================================================

/// A scalar cell value: what a column of a replicated row can hold.
///
/// Serialized untagged, so JSON `null`/`true`/`5`/`5.5`/`"x"` round-trip
/// naturally. SQLite has no boolean affinity; booleans are stored as
/// integers and come back as [`SqliteValue::Integer`] when read from the
/// replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqliteValue {
    /// SQL NULL.
    Null,
    /// A boolean (wire-side only; stored as 0/1).
    Boolean(bool),
    /// A 64-bit integer.
    Integer(i64),
    /// A double-precision float.
    Real(f64),
    /// A text string.
    Text(String),
}

impl SqliteValue {
    /// The integer payload, if this value is one (booleans count as 0/1).
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SqliteValue::Integer(v) => Some(*v),
            SqliteValue::Boolean(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// The text payload, if this value is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqliteValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl rusqlite::types::ToSql for SqliteValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value};
        Ok(match self {
            SqliteValue::Null => ToSqlOutput::Owned(Value::Null),
            SqliteValue::Boolean(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            SqliteValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqliteValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            SqliteValue::Text(s) => ToSqlOutput::Borrowed(s.as_str().into()),
        })
    }
}

impl rusqlite::types::FromSql for SqliteValue {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        use rusqlite::types::ValueRef;
        Ok(match value {
            ValueRef::Null => SqliteValue::Null,
            ValueRef::Integer(v) => SqliteValue::Integer(v),
            ValueRef::Real(v) => SqliteValue::Real(v),
            ValueRef::Text(t) => {
                SqliteValue::Text(String::from_utf8_lossy(t).into_owned())
            }
            ValueRef::Blob(_) => {
                return Err(rusqlite::types::FromSqlError::InvalidType);
            }
        })
    }
}

// =============================================================================
// Rows and Row Identity
// =============================================================================

/// A row: column name to scalar value.
pub type Row = BTreeMap<String, SqliteValue>;

/// An ordered projection of a row onto its primary-key columns.
///
/// Key columns are held in normalized (sorted) order regardless of the
/// order they were declared in, so two encodings of the same logical key
/// always compare and fingerprint identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(BTreeMap<String, SqliteValue>);

impl RowKey {
    /// Projects `row` onto `primary_key`. Every key column must be present.
    pub fn from_row(row: &Row, primary_key: &[String]) -> Result<Self> {
        let mut key = BTreeMap::new();
        for col in primary_key {
            let value = row.get(col).ok_or_else(|| Error::InvalidQuery {
                reason: format!("row is missing primary-key column '{col}'"),
            })?;
            key.insert(col.clone(), value.clone());
        }
        Ok(Self(key))
    }

    /// Builds a key directly from column/value pairs.
    pub fn from_parts(parts: impl IntoIterator<Item = (String, SqliteValue)>) -> Self {
        Self(parts.into_iter().collect())
    }

    /// Canonical JSON serialization, stable across key orderings.
    pub fn canonical_json(&self) -> String {
        // BTreeMap iterates in sorted column order, so this is canonical.
        serde_json::to_string(&self.0).expect("row key serializes")
    }

    /// Stable 64-bit fingerprint of the canonical form.
    pub fn fingerprint(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(self.canonical_json().as_bytes())
    }

    /// The key's columns and values in normalized order.
    pub fn columns(&self) -> impl Iterator<Item = (&String, &SqliteValue)> {
        self.0.iter()
    }
}

/// In-memory identity of a replicated row: `(table, normalized key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId {
    /// Table the row lives in.
    pub table: String,
    /// Canonical JSON of the normalized primary key.
    pub key: String,
}

impl RowId {
    /// Identity for a keyed row of `table`.
    pub fn new(table: impl Into<String>, key: &RowKey) -> Self {
        Self {
            table: table.into(),
            key: key.canonical_json(),
        }
    }

    /// The key clients address this row by in entity patches.
    pub fn entity_key(&self) -> String {
        format!("{}/{}", self.table, self.key)
    }
}

// =============================================================================
// Table Specs
// =============================================================================

/// Column data types recognized by the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// TEXT affinity.
    Text,
    /// INTEGER affinity.
    Integer,
    /// REAL affinity.
    Real,
    /// Stored as INTEGER 0/1.
    Boolean,
    /// JSON scalar stored as TEXT.
    Json,
}

impl ColumnType {
    /// The SQLite column type keyword used in DDL.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Json => "TEXT",
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }
}

/// Spec of one column of a replicated table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Declared data type.
    pub data_type: ColumnType,
    /// NOT NULL constraint.
    pub not_null: bool,
    /// Declaration position, for deterministic DDL output.
    pub pos: u32,
}

/// Spec of a replicated table. Immutable for the lifetime of a replica
/// version; a schema change is modeled as a bumped replica version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Table name.
    pub name: String,
    /// Columns by name.
    pub columns: BTreeMap<String, ColumnSpec>,
    /// Primary-key columns, in declared order.
    pub primary_key: Vec<String>,
}

impl TableSpec {
    /// Normalized key order: the declared primary key, sorted.
    pub fn normalized_key(&self) -> Vec<String> {
        let mut key = self.primary_key.clone();
        key.sort();
        key
    }

    /// True if `column` exists on this table.
    pub fn has_column(&self, column: &str) -> bool {
        column == ROW_VERSION_COLUMN || self.columns.contains_key(column)
    }
}

// =============================================================================
// Identifiers
// =============================================================================

/// A connected client's identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Wraps a client id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A client group's identifier: the unit of view-syncer residency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientGroupId(String);

impl ClientGroupId {
    /// Wraps a group id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable hash of a query's canonical expanded form.
///
/// Two distinct ASTs that canonicalize identically share one hash and
/// therefore one materialized view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryHash(String);

impl QueryHash {
    /// Wraps an already-computed hash string.
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// The hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Change Records
// =============================================================================

/// One record of the upstream CDC feed.
///
/// Changes between `Begin` and `Commit` are atomic; no partial commit is
/// ever visible downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase")]
pub enum Change {
    /// Transaction start.
    Begin,
    /// A new row.
    #[serde(rename_all = "camelCase")]
    Insert {
        /// Target table.
        table: String,
        /// The full new row.
        row: Row,
    },
    /// A changed row. `old_key` is present only when the primary key itself
    /// changed.
    #[serde(rename_all = "camelCase")]
    Update {
        /// Target table.
        table: String,
        /// The row's previous key, when the key changed.
        old_key: Option<RowKey>,
        /// The full new row.
        row: Row,
    },
    /// A deleted row.
    #[serde(rename_all = "camelCase")]
    Delete {
        /// Target table.
        table: String,
        /// Key of the deleted row.
        key: RowKey,
    },
    /// All rows of a table removed.
    #[serde(rename_all = "camelCase")]
    Truncate {
        /// Target table.
        table: String,
    },
    /// Transaction end, bearing the watermark that names the post-state.
    #[serde(rename_all = "camelCase")]
    Commit {
        /// The transaction's watermark.
        watermark: Watermark,
    },
}

impl Change {
    /// The table a row-level change touches, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            Change::Insert { table, .. }
            | Change::Update { table, .. }
            | Change::Delete { table, .. }
            | Change::Truncate { table } => Some(table),
            Change::Begin | Change::Commit { .. } => None,
        }
    }
}

/// A change record paired with its position, as produced by an upstream
/// source adapter. Only `Commit` records carry a watermark.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedChange {
    /// The change record.
    pub change: Change,
    /// Set on `Commit` records.
    pub watermark: Option<Watermark>,
}

/// An assembled upstream transaction: the row-level changes between one
/// `Begin`/`Commit` pair, named by the commit's watermark.
///
/// `changes` preserves upstream order; index is the `pos` used by the
/// durable log.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRecord {
    /// Watermark naming the post-state of this transaction.
    pub watermark: Watermark,
    /// Row-level changes, in upstream order.
    pub changes: Vec<Change>,
}

// =============================================================================
// Tests
// =============================================================================
