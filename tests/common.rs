//! Shared helpers for the integration tests.

#![allow(dead_code)] // not every test file uses every helper

use std::collections::BTreeMap;

use viewsync::client::{Downstream, PokePart};
use viewsync::types::{
    Change, ColumnSpec, ColumnType, CommitRecord, Row, RowKey, SqliteValue, TableSpec, Watermark,
};

/// A two-column `issues` table keyed by `id`.
pub fn issues_spec() -> TableSpec {
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

pub fn table_map() -> BTreeMap<String, TableSpec> {
    [("issues".to_string(), issues_spec())].into_iter().collect()
}

pub fn issue(id: i64, title: &str) -> Row {
    let mut row = Row::new();
    row.insert("id".to_string(), SqliteValue::Integer(id));
    row.insert("title".to_string(), SqliteValue::Text(title.to_string()));
    row
}

pub fn issue_key(id: i64) -> RowKey {
    RowKey::from_parts([("id".to_string(), SqliteValue::Integer(id))])
}

pub fn insert(id: i64, title: &str) -> Change {
    Change::Insert {
        table: "issues".to_string(),
        row: issue(id, title),
    }
}

pub fn update(id: i64, title: &str) -> Change {
    Change::Update {
        table: "issues".to_string(),
        old_key: None,
        row: issue(id, title),
    }
}

pub fn delete(id: i64) -> Change {
    Change::Delete {
        table: "issues".to_string(),
        key: issue_key(id),
    }
}

pub fn wm(v: u64) -> Watermark {
    Watermark::from_u64(v)
}

pub fn commit(v: u64, changes: Vec<Change>) -> CommitRecord {
    CommitRecord {
        watermark: wm(v),
        changes,
    }
}

/// Reads one whole poke off a client's frame stream, returning its cookie
/// and parts.
pub async fn drain_poke(
    rx: &mut tokio::sync::mpsc::Receiver<Downstream>,
) -> (Watermark, Vec<PokePart>) {
    let cookie = match rx.recv().await.expect("frame stream open") {
        Downstream::PokeStart(start) => start.cookie,
        other => panic!("expected pokeStart, got {other:?}"),
    };
    let mut parts = Vec::new();
    loop {
        match rx.recv().await.expect("frame stream open") {
            Downstream::PokePart(part) => parts.push(part),
            Downstream::PokeEnd(_) => return (cookie, parts),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
