//! # Query AST
//!
//! The tagged-variant form the engine consumes queries in. The SQL planner
//! that produces it is someone else's problem; here the AST is opaque
//! payload with exactly one structural obligation: [`Query::normalize`]
//! must map every equivalent spelling to one canonical value, because the
//! transformation hash — and therefore materialization sharing — is
//! computed over the canonical serialization.

use serde::{Deserialize, Serialize};

use crate::types::SqliteValue;

// =============================================================================
// Nodes
// =============================================================================

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// Comparison operators in `where` conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CmpOp {
    /// Null-safe equality.
    Eq,
    /// Null-safe inequality.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// SQL LIKE.
    Like,
}

/// A boolean filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Condition {
    /// A single comparison against a literal.
    #[serde(rename_all = "camelCase")]
    Cmp {
        /// Column of the query's table.
        field: String,
        /// Operator.
        op: CmpOp,
        /// Literal operand.
        value: SqliteValue,
    },
    /// Conjunction.
    And(Vec<Condition>),
    /// Disjunction.
    Or(Vec<Condition>),
}

impl Condition {
    /// Canonical form: nested And/Or flattened, terms sorted and deduped
    /// by their canonical serialization, single-term groups unwrapped.
    pub fn normalize(self) -> Condition {
        match self {
            Condition::Cmp { .. } => self,
            Condition::And(terms) => {
                let mut flat = Vec::new();
                for term in terms {
                    match term.normalize() {
                        Condition::And(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                normalize_group(flat, Condition::And)
            }
            Condition::Or(terms) => {
                let mut flat = Vec::new();
                for term in terms {
                    match term.normalize() {
                        Condition::Or(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                normalize_group(flat, Condition::Or)
            }
        }
    }

    /// Every column this condition reads.
    pub fn referenced_fields(&self, out: &mut Vec<String>) {
        match self {
            Condition::Cmp { field, .. } => out.push(field.clone()),
            Condition::And(terms) | Condition::Or(terms) => {
                for term in terms {
                    term.referenced_fields(out);
                }
            }
        }
    }
}

fn normalize_group(mut terms: Vec<Condition>, wrap: fn(Vec<Condition>) -> Condition) -> Condition {
    terms.sort_by_cached_key(|t| serde_json::to_string(t).expect("condition serializes"));
    terms.dedup();
    if terms.len() == 1 {
        terms.pop().unwrap()
    } else {
        wrap(terms)
    }
}

/// A named relationship resolved to an explicit correlation: child rows
/// where `child.child_field = parent.parent_field`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correlation {
    /// Relationship name; part of the child row alias path.
    pub name: String,
    /// Column on the parent query's table.
    pub parent_field: String,
    /// Column on the child query's table.
    pub child_field: String,
    /// The child query.
    pub query: Box<Query>,
}

/// A query over one table, with optional correlated children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// The queried table.
    pub table: String,
    /// Selected columns; empty selects every column.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Filter.
    #[serde(default, rename = "where")]
    pub where_: Option<Condition>,
    /// Sort; primary keys are appended during transformation.
    #[serde(default)]
    pub order_by: Vec<(String, Direction)>,
    /// Row limit.
    #[serde(default)]
    pub limit: Option<u64>,
    /// Correlated child queries.
    #[serde(default)]
    pub related: Vec<Correlation>,
}

impl Query {
    /// A bare `SELECT *`-equivalent over `table`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            where_: None,
            order_by: Vec::new(),
            limit: None,
            related: Vec::new(),
        }
    }

    /// Canonical form: normalized conditions, sorted/deduped selection,
    /// children sorted by relationship name and normalized recursively.
    pub fn normalize(mut self) -> Query {
        self.columns.sort();
        self.columns.dedup();
        self.where_ = self.where_.map(Condition::normalize);
        self.related.sort_by(|a, b| a.name.cmp(&b.name));
        for correlation in &mut self.related {
            let child = std::mem::replace(&mut *correlation.query, Query::table(""));
            *correlation.query = child.normalize();
        }
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
