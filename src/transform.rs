//! # Query Transformer (C5)
//!
//! Canonicalizes an opaque query AST into the form the view syncer
//! materializes:
//!
//! 1. The selection set is expanded with every primary-key column of every
//!    referenced table, the `_0_version` column, and any column referenced
//!    by `where`/`orderBy` but not selected.
//! 2. Result columns are aliased `<rowAlias>/<column>` where the row alias
//!    is `<path>/<table>`, so flat multi-table join rows can be
//!    partitioned back into per-table sub-rows by splitting at the last
//!    separator.
//! 3. The AST is normalized (sorted conjunctions, primary keys appended to
//!    `orderBy`, relationships as explicit correlations) and hashed with
//!    SHA-256 over its canonical JSON. Two ASTs with the same
//!    transformation hash yield identical result sets on identical data,
//!    which is what lets materializations be shared.
//! 4. An invalidation summary is computed so the syncer can skip queries a
//!    commit cannot possibly affect. Only inserts carry full-row images,
//!    so only equality filters over inserts are tag-matched; updates,
//!    deletes and truncates blanket-tag their table. A query wrongly
//!    skipped would be a correctness bug; this scheme never skips wrongly.
//!
//! Transformed queries are cached by the canonical form of their input, so
//! repeated `changeDesiredQueries` churn does not re-derive them.

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::ast::{CmpOp, Condition, Query};
use crate::error::{Error, Result};
use crate::snapshotter::Snapshot;
use crate::types::{
    Change, CommitRecord, QueryHash, SqliteValue, TableSpec, ROW_VERSION_COLUMN,
};

/// Separator for row aliases and column aliases.
pub const ALIAS_SEPARATOR: char = '/';

/// Transformed queries kept by canonical input form.
const TRANSFORM_CACHE_CAPACITY: usize = 256;

// =============================================================================
// Transformed Query
// =============================================================================

/// A query in canonical expanded form, ready to execute and diff.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedQuery {
    /// Stable hash of the canonical expanded form.
    pub hash: QueryHash,
    /// The expanded, normalized query.
    pub query: Query,
    /// Which changes can affect this query.
    pub invalidation: InvalidationInfo,
}

// =============================================================================
// Invalidation
// =============================================================================

/// How a query depends on one table.
#[derive(Debug, Clone, PartialEq)]
enum TableFilter {
    /// Any change to the table may affect the query.
    Any,
    /// Only rows satisfying this equality conjunction can; values are
    /// fingerprinted.
    EqAll(Vec<(String, u64)>),
}

/// The `(table, filter-tags)` a query depends on.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationInfo {
    tables: BTreeMap<String, TableFilter>,
}

impl InvalidationInfo {
    /// True when a commit with `tags` may change this query's results.
    pub fn affected_by(&self, tags: &DiffTags) -> bool {
        self.tables.iter().any(|(table, filter)| {
            let Some(changes) = tags.tables.get(table) else {
                return false;
            };
            match filter {
                TableFilter::Any => true,
                TableFilter::EqAll(conjuncts) => {
                    changes.blanket
                        || conjuncts.iter().all(|(column, fp)| {
                            changes
                                .values
                                .get(column)
                                .is_some_and(|set| set.contains(fp))
                        })
                }
            }
        })
    }

    /// The referenced tables, for schema-change resync decisions.
    pub fn tables(&self) -> impl Iterator<Item = &String> {
        self.tables.keys()
    }
}

#[derive(Debug, Default)]
struct TableChanges {
    /// Set by updates, deletes and truncates, whose before-images are not
    /// in the change record.
    blanket: bool,
    /// Column value fingerprints contributed by inserted rows.
    values: BTreeMap<String, BTreeSet<u64>>,
}

/// Per-commit change summary matched against [`InvalidationInfo`].
#[derive(Debug, Default)]
pub struct DiffTags {
    tables: BTreeMap<String, TableChanges>,
}

impl DiffTags {
    /// Summarizes one commit.
    pub fn from_commit(commit: &CommitRecord) -> Self {
        let mut tags = DiffTags::default();
        tags.add_commit(commit);
        tags
    }

    /// Folds another commit in; used when a debounced batch of commits is
    /// processed as one diff.
    pub fn add_commit(&mut self, commit: &CommitRecord) {
        for change in &commit.changes {
            match change {
                Change::Insert { table, row } => {
                    let entry = self.tables.entry(table.clone()).or_default();
                    for (column, value) in row {
                        entry
                            .values
                            .entry(column.clone())
                            .or_default()
                            .insert(value_fingerprint(value));
                    }
                }
                Change::Update { table, .. }
                | Change::Delete { table, .. }
                | Change::Truncate { table } => {
                    self.tables.entry(table.clone()).or_default().blanket = true;
                }
                Change::Begin | Change::Commit { .. } => {}
            }
        }
    }
}

/// Stable fingerprint of a scalar, shared by both sides of the match.
pub fn value_fingerprint(value: &SqliteValue) -> u64 {
    let json = serde_json::to_string(value).expect("scalar serializes");
    xxhash_rust::xxh3::xxh3_64(json.as_bytes())
}

// =============================================================================
// Transformer
// =============================================================================

/// Canonicalizes ASTs against a table schema, with an LRU cache keyed by
/// the input's canonical form.
pub struct QueryTransformer {
    tables: BTreeMap<String, TableSpec>,
    cache: LruCache<String, Arc<TransformedQuery>>,
}

impl QueryTransformer {
    /// A transformer over the replica's tables.
    pub fn new(tables: BTreeMap<String, TableSpec>) -> Self {
        Self {
            tables,
            cache: LruCache::new(
                NonZeroUsize::new(TRANSFORM_CACHE_CAPACITY).expect("nonzero capacity"),
            ),
        }
    }

    /// The schema this transformer validates against.
    pub fn tables(&self) -> &BTreeMap<String, TableSpec> {
        &self.tables
    }

    /// Transforms an AST; identical canonical inputs share one result.
    pub fn transform(&mut self, ast: &Query) -> Result<Arc<TransformedQuery>> {
        let normalized = ast.clone().normalize();
        let cache_key = serde_json::to_string(&normalized)?;
        if let Some(hit) = self.cache.get(&cache_key) {
            return Ok(Arc::clone(hit));
        }

        let expanded = expand(normalized, &self.tables)?;
        let canonical = serde_json::to_string(&expanded)?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let hash = QueryHash::new(
            hasher
                .finalize()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>(),
        );

        let invalidation = invalidation_info(&expanded);
        let transformed = Arc::new(TransformedQuery {
            hash,
            query: expanded,
            invalidation,
        });
        self.cache.put(cache_key, Arc::clone(&transformed));
        Ok(transformed)
    }
}

fn expand(mut query: Query, tables: &BTreeMap<String, TableSpec>) -> Result<Query> {
    let spec = tables.get(&query.table).ok_or_else(|| Error::InvalidQuery {
        reason: format!("unknown table '{}'", query.table),
    })?;

    let mut columns: BTreeSet<String> = if query.columns.is_empty() {
        spec.columns.keys().cloned().collect()
    } else {
        for column in &query.columns {
            check_column(spec, column)?;
        }
        query.columns.iter().cloned().collect()
    };

    // Primary keys and the row version are always selected.
    columns.extend(spec.primary_key.iter().cloned());
    columns.insert(ROW_VERSION_COLUMN.to_string());

    // Columns referenced by the filter and the sort are needed even when
    // not selected.
    if let Some(where_) = &query.where_ {
        let mut referenced = Vec::new();
        where_.referenced_fields(&mut referenced);
        for field in referenced {
            check_column(spec, &field)?;
            columns.insert(field);
        }
    }
    for (field, _) in &query.order_by {
        check_column(spec, field)?;
        columns.insert(field.clone());
    }

    // Deterministic sort: primary keys ascending close every ordering.
    for pk in &spec.primary_key {
        if !query.order_by.iter().any(|(field, _)| field == pk) {
            query
                .order_by
                .push((pk.clone(), crate::ast::Direction::Asc));
        }
    }

    for correlation in &mut query.related {
        check_column(spec, &correlation.parent_field)?;
        columns.insert(correlation.parent_field.clone());
        let child = std::mem::replace(&mut *correlation.query, Query::table(""));
        let child = expand(child, tables)?;
        let child_spec = tables
            .get(&child.table)
            .expect("expanded child has a known table");
        check_column(child_spec, &correlation.child_field)?;
        *correlation.query = child;
    }

    query.columns = columns.into_iter().collect();
    Ok(query)
}

fn check_column(spec: &TableSpec, column: &str) -> Result<()> {
    if spec.has_column(column) {
        Ok(())
    } else {
        Err(Error::InvalidQuery {
            reason: format!("unknown column '{}.{column}'", spec.name),
        })
    }
}

fn invalidation_info(query: &Query) -> InvalidationInfo {
    let mut tables = BTreeMap::new();

    // The root's filter can be tag-matched when it is a pure equality
    // conjunction; everything else falls back to the blanket table tag.
    let root_filter = match &query.where_ {
        Some(condition) => match eq_conjunction(condition) {
            Some(conjuncts) => TableFilter::EqAll(conjuncts),
            None => TableFilter::Any,
        },
        None => TableFilter::Any,
    };
    tables.insert(query.table.clone(), root_filter);

    collect_child_tables(query, &mut tables);
    InvalidationInfo { tables }
}

fn collect_child_tables(query: &Query, tables: &mut BTreeMap<String, TableFilter>) {
    for correlation in &query.related {
        // Child rows are selected through the correlation, which is
        // row-dependent; only the blanket tag is sound.
        tables.insert(correlation.query.table.clone(), TableFilter::Any);
        collect_child_tables(&correlation.query, tables);
    }
}

fn eq_conjunction(condition: &Condition) -> Option<Vec<(String, u64)>> {
    match condition {
        Condition::Cmp {
            field,
            op: CmpOp::Eq,
            value,
        } => Some(vec![(field.clone(), value_fingerprint(value))]),
        Condition::And(terms) => {
            let mut conjuncts = Vec::new();
            for term in terms {
                conjuncts.extend(eq_conjunction(term)?);
            }
            Some(conjuncts)
        }
        _ => None,
    }
}

// =============================================================================
// Aliases
// =============================================================================

/// The row alias of a query's own rows under `path` (`""` for the root).
pub fn row_alias(path: &str, table: &str) -> String {
    format!("{path}{ALIAS_SEPARATOR}{table}")
}

/// Splits a column alias into `(rowAlias, column)` at the last separator.
pub fn split_alias(alias: &str) -> Option<(&str, &str)> {
    alias.rfind(ALIAS_SEPARATOR).map(|at| (&alias[..at], &alias[at + 1..]))
}

/// The table named by a row alias.
pub fn alias_table(row_alias: &str) -> &str {
    match row_alias.rfind(ALIAS_SEPARATOR) {
        Some(at) => &row_alias[at + 1..],
        None => row_alias,
    }
}

// =============================================================================
// Execution
// =============================================================================

/// One flat result row: canonical column alias to value.
pub type FlatRow = BTreeMap<String, SqliteValue>;

/// Runs a transformed query against a pinned snapshot, yielding flat rows
/// whose column names are canonical aliases.
pub fn execute(query: &TransformedQuery, snapshot: &Snapshot) -> Result<Vec<FlatRow>> {
    let mut builder = SqlBuilder::default();
    builder.add_query(&query.query, "", None);
    let sql = builder.render(&query.query);

    let mut stmt = snapshot.connection().prepare_cached(&sql)?;
    let params: Vec<&dyn rusqlite::ToSql> = builder
        .params
        .iter()
        .map(|p| p as &dyn rusqlite::ToSql)
        .collect();
    let mut rows = stmt.query(params.as_slice())?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut flat = FlatRow::new();
        for i in 0..row.as_ref().column_count() {
            let name = row.as_ref().column_name(i)?.to_string();
            let value: SqliteValue = row.get(i)?;
            flat.insert(name, value);
        }
        out.push(flat);
    }
    Ok(out)
}

#[derive(Default)]
struct SqlBuilder {
    select: Vec<String>,
    joins: Vec<String>,
    where_sql: Option<String>,
    params: Vec<SqliteValue>,
    next_table_alias: usize,
}

impl SqlBuilder {
    /// Walks the query tree, assigning `tN` table aliases and emitting the
    /// select list and joins. Returns this node's table alias.
    fn add_query(&mut self, query: &Query, path: &str, join_on: Option<(String, String, String)>) {
        let table_alias = format!("t{}", self.next_table_alias);
        self.next_table_alias += 1;
        let row = row_alias(path, &query.table);

        for column in &query.columns {
            self.select.push(format!(
                "\"{table_alias}\".\"{column}\" AS \"{row}{ALIAS_SEPARATOR}{column}\""
            ));
        }

        match join_on {
            None => {
                if let Some(where_) = &query.where_ {
                    let sql = self.condition_sql(where_, &table_alias);
                    self.where_sql = Some(sql);
                }
            }
            Some((parent_alias, parent_field, child_field)) => {
                let mut on = format!(
                    "\"{table_alias}\".\"{child_field}\" IS \"{parent_alias}\".\"{parent_field}\""
                );
                if let Some(where_) = &query.where_ {
                    let sql = self.condition_sql(where_, &table_alias);
                    on.push_str(&format!(" AND {sql}"));
                }
                self.joins.push(format!(
                    "LEFT JOIN \"{}\" AS \"{table_alias}\" ON {on}",
                    query.table
                ));
            }
        }

        for correlation in &query.related {
            let child_path = format!("{row}.{}", correlation.name);
            let on = (
                table_alias.clone(),
                correlation.parent_field.clone(),
                correlation.child_field.clone(),
            );
            self.add_query(&correlation.query, &child_path, Some(on));
        }
    }

    fn condition_sql(&mut self, condition: &Condition, table_alias: &str) -> String {
        match condition {
            Condition::Cmp { field, op, value } => {
                self.params.push(value.clone());
                let n = self.params.len();
                let op_sql = match op {
                    CmpOp::Eq => "IS",
                    CmpOp::Ne => "IS NOT",
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::Ge => ">=",
                    CmpOp::Like => "LIKE",
                };
                format!("\"{table_alias}\".\"{field}\" {op_sql} ?{n}")
            }
            Condition::And(terms) => self.group_sql(terms, table_alias, " AND "),
            Condition::Or(terms) => self.group_sql(terms, table_alias, " OR "),
        }
    }

    fn group_sql(&mut self, terms: &[Condition], table_alias: &str, joiner: &str) -> String {
        let rendered: Vec<String> = terms
            .iter()
            .map(|t| self.condition_sql(t, table_alias))
            .collect();
        format!("({})", rendered.join(joiner))
    }

    fn render(&self, root: &Query) -> String {
        let mut sql = format!(
            "SELECT {} FROM \"{}\" AS \"t0\"",
            self.select.join(", "),
            root.table
        );
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if let Some(where_sql) = &self.where_sql {
            sql.push_str(&format!(" WHERE {where_sql}"));
        }
        if !root.order_by.is_empty() {
            let order = root
                .order_by
                .iter()
                .map(|(field, dir)| {
                    let dir = match dir {
                        crate::ast::Direction::Asc => "ASC",
                        crate::ast::Direction::Desc => "DESC",
                    };
                    format!("\"t0\".\"{field}\" {dir}")
                })
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" ORDER BY {order}"));
        }
        if let Some(limit) = root.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Correlation, Direction};
    use crate::types::{ColumnSpec, ColumnType, Row};

    fn spec(name: &str, cols: &[&str], pk: &[&str]) -> TableSpec {
        let columns = cols
            .iter()
            .enumerate()
            .map(|(i, c)| {
                (
                    c.to_string(),
                    ColumnSpec {
                        data_type: if *c == "id" || c.ends_with("_id") {
                            ColumnType::Integer
                        } else {
                            ColumnType::Text
                        },
                        not_null: *c == "id",
                        pos: i as u32,
                    },
                )
            })
            .collect();
        TableSpec {
            name: name.to_string(),
            columns,
            primary_key: pk.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn schema() -> BTreeMap<String, TableSpec> {
        let mut tables = BTreeMap::new();
        tables.insert(
            "issues".to_string(),
            spec("issues", &["id", "title", "owner_id", "status"], &["id"]),
        );
        tables.insert("users".to_string(), spec("users", &["id", "name"], &["id"]));
        tables
    }

    fn eq(field: &str, v: i64) -> Condition {
        Condition::Cmp {
            field: field.to_string(),
            op: CmpOp::Eq,
            value: SqliteValue::Integer(v),
        }
    }

    #[test]
    fn expansion_adds_keys_version_and_referenced_columns() {
        let mut transformer = QueryTransformer::new(schema());
        let ast = Query {
            table: "issues".to_string(),
            columns: vec!["title".to_string()],
            where_: Some(eq("owner_id", 7)),
            order_by: vec![("status".to_string(), Direction::Desc)],
            limit: None,
            related: vec![],
        };
        let transformed = transformer.transform(&ast).unwrap();
        let columns = &transformed.query.columns;
        for expected in ["id", "title", "owner_id", "status", ROW_VERSION_COLUMN] {
            assert!(columns.contains(&expected.to_string()), "missing {expected}");
        }
        // Primary key appended ascending after the explicit sort.
        assert_eq!(
            transformed.query.order_by,
            vec![
                ("status".to_string(), Direction::Desc),
                ("id".to_string(), Direction::Asc),
            ]
        );
    }

    #[test]
    fn equivalent_spellings_share_a_hash() {
        let mut transformer = QueryTransformer::new(schema());
        let one = Query {
            table: "issues".to_string(),
            columns: vec!["title".to_string(), "id".to_string()],
            where_: Some(Condition::And(vec![eq("status", 1), eq("owner_id", 7)])),
            order_by: vec![],
            limit: None,
            related: vec![],
        };
        let two = Query {
            table: "issues".to_string(),
            columns: vec!["id".to_string(), "title".to_string()],
            where_: Some(Condition::And(vec![eq("owner_id", 7), eq("status", 1)])),
            order_by: vec![],
            limit: None,
            related: vec![],
        };
        let h1 = transformer.transform(&one).unwrap().hash.clone();
        let h2 = transformer.transform(&two).unwrap().hash.clone();
        assert_eq!(h1, h2);

        let three = Query {
            table: "issues".to_string(),
            columns: vec!["id".to_string()],
            where_: Some(eq("status", 2)),
            order_by: vec![],
            limit: None,
            related: vec![],
        };
        assert_ne!(h1, transformer.transform(&three).unwrap().hash);
    }

    #[test]
    fn unknown_references_are_invalid_queries() {
        let mut transformer = QueryTransformer::new(schema());
        let bad_table = Query::table("nope");
        assert!(matches!(
            transformer.transform(&bad_table).unwrap_err(),
            Error::InvalidQuery { .. }
        ));

        let bad_column = Query {
            table: "issues".to_string(),
            columns: vec!["nope".to_string()],
            where_: None,
            order_by: vec![],
            limit: None,
            related: vec![],
        };
        assert!(matches!(
            transformer.transform(&bad_column).unwrap_err(),
            Error::InvalidQuery { .. }
        ));
    }

    #[test]
    fn alias_splitting_round_trips() {
        assert_eq!(row_alias("", "issues"), "/issues");
        let alias = format!("{}{ALIAS_SEPARATOR}title", row_alias("", "issues"));
        let (row, column) = split_alias(&alias).unwrap();
        assert_eq!(row, "/issues");
        assert_eq!(column, "title");
        assert_eq!(alias_table(row), "issues");

        let child = row_alias("/issues.owner", "users");
        assert_eq!(child, "/issues.owner/users");
        assert_eq!(alias_table(&child), "users");
    }

    #[test]
    fn insert_only_commits_match_equality_tags() {
        let mut transformer = QueryTransformer::new(schema());
        let filtered = Query {
            table: "issues".to_string(),
            columns: vec!["id".to_string()],
            where_: Some(eq("owner_id", 7)),
            order_by: vec![],
            limit: None,
            related: vec![],
        };
        let transformed = transformer.transform(&filtered).unwrap();

        let mut matching = Row::new();
        matching.insert("id".to_string(), SqliteValue::Integer(1));
        matching.insert("owner_id".to_string(), SqliteValue::Integer(7));
        let hit = DiffTags::from_commit(&CommitRecord {
            watermark: crate::types::Watermark::from_u64(1),
            changes: vec![Change::Insert {
                table: "issues".to_string(),
                row: matching,
            }],
        });
        assert!(transformed.invalidation.affected_by(&hit));

        let mut other = Row::new();
        other.insert("id".to_string(), SqliteValue::Integer(2));
        other.insert("owner_id".to_string(), SqliteValue::Integer(8));
        let miss = DiffTags::from_commit(&CommitRecord {
            watermark: crate::types::Watermark::from_u64(2),
            changes: vec![Change::Insert {
                table: "issues".to_string(),
                row: other,
            }],
        });
        assert!(!transformed.invalidation.affected_by(&miss));

        // Updates carry no before-image, so they always match.
        let update = DiffTags::from_commit(&CommitRecord {
            watermark: crate::types::Watermark::from_u64(3),
            changes: vec![Change::Update {
                table: "issues".to_string(),
                old_key: None,
                row: Row::new(),
            }],
        });
        assert!(transformed.invalidation.affected_by(&update));

        // Changes to unrelated tables never match.
        let unrelated = DiffTags::from_commit(&CommitRecord {
            watermark: crate::types::Watermark::from_u64(4),
            changes: vec![Change::Truncate {
                table: "users".to_string(),
            }],
        });
        assert!(!transformed.invalidation.affected_by(&unrelated));
    }

    #[test]
    fn execution_partitions_by_canonical_aliases() {
        use crate::replicator::Replica;
        use crate::types::{CommitRecord, Watermark};

        let dir = tempfile::tempdir().unwrap();
        let specs: Vec<TableSpec> = schema().into_values().collect();
        let mut replica = Replica::open(dir.path().join("replica.db"), &specs).unwrap();

        let mut user = Row::new();
        user.insert("id".to_string(), SqliteValue::Integer(7));
        user.insert("name".to_string(), SqliteValue::Text("ada".to_string()));
        let mut issue = Row::new();
        issue.insert("id".to_string(), SqliteValue::Integer(1));
        issue.insert("title".to_string(), SqliteValue::Text("t".to_string()));
        issue.insert("owner_id".to_string(), SqliteValue::Integer(7));
        issue.insert("status".to_string(), SqliteValue::Text("open".to_string()));
        replica
            .apply_commit(&CommitRecord {
                watermark: Watermark::from_u64(1),
                changes: vec![
                    Change::Insert {
                        table: "users".to_string(),
                        row: user,
                    },
                    Change::Insert {
                        table: "issues".to_string(),
                        row: issue,
                    },
                ],
            })
            .unwrap();

        let mut transformer = QueryTransformer::new(schema());
        let ast = Query {
            table: "issues".to_string(),
            columns: vec!["title".to_string()],
            where_: None,
            order_by: vec![],
            limit: None,
            related: vec![Correlation {
                name: "owner".to_string(),
                parent_field: "owner_id".to_string(),
                child_field: "id".to_string(),
                query: Box::new(Query::table("users")),
            }],
        };
        let transformed = transformer.transform(&ast).unwrap();

        let snapshot = Snapshot::open(replica.path()).unwrap();
        let rows = execute(&transformed, &snapshot).unwrap();
        assert_eq!(rows.len(), 1);
        let flat = &rows[0];
        assert_eq!(
            flat.get("/issues/title"),
            Some(&SqliteValue::Text("t".to_string()))
        );
        assert_eq!(
            flat.get("/issues.owner/users/name"),
            Some(&SqliteValue::Text("ada".to_string()))
        );
        assert!(
            flat.contains_key("/issues/_0_version"),
            "row version is always selected"
        );
        assert!(flat.contains_key("/issues.owner/users/_0_version"));
    }
}
