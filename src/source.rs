//! # Upstream Change Sources
//!
//! The streamer consumes an ordered CDC feed through the [`ChangeSource`]
//! trait, so the upstream can be a logical-replication slot, a test
//! harness, or anything else that can produce `begin / row ops / commit`
//! sequences with strictly increasing commit watermarks.
//!
//! [`CustomSource`] is the generic channel-backed adapter: the producing
//! side holds a [`SourceHandle`] and feeds individual change records or
//! whole commits; the streamer consumes the subscription stream. A
//! producer that loses its upstream position pushes
//! [`Error::AutoReset`], which the streamer propagates to the supervisor.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::types::{Change, CommitRecord, Row, TableSpec, VersionedChange, Watermark};

/// Capacity of the adapter's feed channel. Backpressure on the producer
/// side, not unbounded buffering.
const SOURCE_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Trait
// =============================================================================

/// A pluggable upstream CDC adapter.
pub trait ChangeSource: Send {
    /// The table specs this source replicates; used for initial sync and
    /// replica DDL.
    fn tables(&self) -> Vec<TableSpec>;

    /// Snapshot rows for initial sync, as `(table, rows)` pairs, all
    /// consistent at [`ChangeSource::baseline`].
    fn snapshot(&mut self) -> Result<Vec<(String, Vec<Row>)>>;

    /// The watermark naming the snapshot's post-state. Streaming resumes
    /// strictly after it.
    fn baseline(&self) -> Watermark;

    /// Subscribes to the live feed from (exclusive) `from`.
    fn subscribe(&mut self, from: &Watermark) -> Result<ChangeSubscription>;
}

// =============================================================================
// Subscription
// =============================================================================

/// The consuming end of an upstream feed: a stream of change records in
/// upstream order. Ends with `Err(AutoReset)` when the upstream position
/// became unusable, or with `None` when the producer hung up.
pub struct ChangeSubscription {
    rx: mpsc::Receiver<Result<VersionedChange>>,
}

impl ChangeSubscription {
    /// Receives the next change record.
    pub async fn recv(&mut self) -> Option<Result<VersionedChange>> {
        self.rx.recv().await
    }
}

impl Stream for ChangeSubscription {
    type Item = Result<VersionedChange>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// =============================================================================
// Custom Source
// =============================================================================

/// Channel-backed generic source. Tests and the stress driver feed it;
/// a real deployment wires a replication-slot adapter to the same trait.
pub struct CustomSource {
    tables: Vec<TableSpec>,
    snapshot: Vec<(String, Vec<Row>)>,
    baseline: Watermark,
    feed_rx: Option<mpsc::Receiver<Result<VersionedChange>>>,
}

/// The producing end of a [`CustomSource`].
#[derive(Clone)]
pub struct SourceHandle {
    tx: mpsc::Sender<Result<VersionedChange>>,
}

impl CustomSource {
    /// Creates a source with the given schema, an empty snapshot, and a
    /// baseline of `Watermark::MIN`.
    pub fn new(tables: Vec<TableSpec>) -> (Self, SourceHandle) {
        Self::with_snapshot(tables, Vec::new(), Watermark::MIN)
    }

    /// Creates a source with initial-sync content consistent at `baseline`.
    pub fn with_snapshot(
        tables: Vec<TableSpec>,
        snapshot: Vec<(String, Vec<Row>)>,
        baseline: Watermark,
    ) -> (Self, SourceHandle) {
        let (tx, rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        (
            Self {
                tables,
                snapshot,
                baseline,
                feed_rx: Some(rx),
            },
            SourceHandle { tx },
        )
    }
}

impl ChangeSource for CustomSource {
    fn tables(&self) -> Vec<TableSpec> {
        self.tables.clone()
    }

    fn snapshot(&mut self) -> Result<Vec<(String, Vec<Row>)>> {
        Ok(std::mem::take(&mut self.snapshot))
    }

    fn baseline(&self) -> Watermark {
        self.baseline.clone()
    }

    fn subscribe(&mut self, _from: &Watermark) -> Result<ChangeSubscription> {
        let rx = self.feed_rx.take().ok_or(Error::Closed {
            component: "custom source",
        })?;
        Ok(ChangeSubscription { rx })
    }
}

impl SourceHandle {
    /// Feeds one raw change record.
    pub async fn send(&self, change: VersionedChange) -> Result<()> {
        self.tx.send(Ok(change)).await.map_err(|_| Error::Closed {
            component: "change source feed",
        })
    }

    /// Feeds a whole transaction: begin, the row ops, then a commit at
    /// `watermark`.
    pub async fn send_commit(&self, watermark: Watermark, changes: Vec<Change>) -> Result<()> {
        self.send(VersionedChange {
            change: Change::Begin,
            watermark: None,
        })
        .await?;
        for change in changes {
            self.send(VersionedChange {
                change,
                watermark: None,
            })
            .await?;
        }
        self.send(VersionedChange {
            change: Change::Commit {
                watermark: watermark.clone(),
            },
            watermark: Some(watermark),
        })
        .await
    }

    /// Feeds a pre-assembled commit record.
    pub async fn send_commit_record(&self, commit: CommitRecord) -> Result<()> {
        self.send_commit(commit.watermark, commit.changes).await
    }

    /// Signals that the upstream position is no longer usable; the
    /// supervisor must wipe the replica and re-run initial sync.
    pub async fn send_auto_reset(&self, reason: impl Into<String>) -> Result<()> {
        self.tx
            .send(Err(Error::AutoReset {
                reason: reason.into(),
            }))
            .await
            .map_err(|_| Error::Closed {
                component: "change source feed",
            })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SqliteValue;

    fn row(id: i64) -> Row {
        let mut row = Row::new();
        row.insert("id".to_string(), SqliteValue::Integer(id));
        row
    }

    #[tokio::test]
    async fn custom_source_delivers_commits_in_order() {
        let (mut source, handle) = CustomSource::new(Vec::new());
        let mut sub = source.subscribe(&Watermark::MIN).unwrap();

        handle
            .send_commit(
                Watermark::from_u64(1),
                vec![Change::Insert {
                    table: "a".to_string(),
                    row: row(1),
                }],
            )
            .await
            .unwrap();

        let first = sub.recv().await.unwrap().unwrap();
        assert_eq!(first.change, Change::Begin);
        let second = sub.recv().await.unwrap().unwrap();
        assert!(matches!(second.change, Change::Insert { .. }));
        let third = sub.recv().await.unwrap().unwrap();
        assert_eq!(third.watermark, Some(Watermark::from_u64(1)));
    }

    #[tokio::test]
    async fn auto_reset_surfaces_as_an_error() {
        let (mut source, handle) = CustomSource::new(Vec::new());
        let mut sub = source.subscribe(&Watermark::MIN).unwrap();

        handle.send_auto_reset("slot dropped").await.unwrap();
        let err = sub.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::AutoReset { .. }));
    }

    #[tokio::test]
    async fn subscribe_twice_is_refused() {
        let (mut source, _handle) = CustomSource::new(Vec::new());
        let _sub = source.subscribe(&Watermark::MIN).unwrap();
        assert!(source.subscribe(&Watermark::MIN).is_err());
    }
}
