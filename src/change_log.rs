//! # ChangeLog Store (C1)
//!
//! The durable, append-only, watermark-keyed record of upstream commits.
//! The change streamer resumes subscribers from any watermark here, and
//! startup compares the stored replication config against the live replica.
//!
//! ## Invariants
//!
//! - Watermarks strictly increase across commits; [`ChangeLogStore::append`]
//!   rejects anything else.
//! - An append is atomic: a watermark present in the log always has all of
//!   its records.
//! - Exactly one writer holds the lease at a time. The lease token is
//!   persisted in `replication_state.owner`; a writer that finds another
//!   token there must abort ([`Error::LeaseLost`]).
//! - `truncate_below` is only legal when no subscriber's acknowledged
//!   position is below the cut (the streamer enforces this).

use std::collections::VecDeque;
use std::path::Path;

use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::schema;
use crate::types::{Change, CommitRecord, Watermark};

/// Commits fetched per storage read while scanning.
const SCAN_BATCH: usize = 256;

// =============================================================================
// Replication Config
// =============================================================================

/// Identity of the replica this log feeds. A mismatch at startup means the
/// log contents cannot apply to the replica and both must be reset.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationConfig {
    /// Version stamp of the replica's schema/content lineage.
    pub replica_version: String,
    /// Upstream publications feeding the log.
    pub publications: Vec<String>,
    /// Set by the upstream adapter when its position is no longer usable.
    pub reset_required: bool,
}

// =============================================================================
// Store
// =============================================================================

/// Single-writer handle over the durable change log.
///
/// The owning task appends; any number of [`ChangeScan`] cursors read.
pub struct ChangeLogStore {
    conn: Connection,
    last_watermark: Watermark,
    lease: String,
}

impl ChangeLogStore {
    /// Opens the store at `path`, initializing the layout if needed and
    /// acquiring the writer lease.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::DatabaseInit {
            reason: format!("cannot open change log: {e}"),
        })?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory store (tests, stress driver).
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        schema::init_cdc_store(&conn)?;
        let mut store = Self {
            conn,
            last_watermark: Watermark::MIN,
            lease: String::new(),
        };
        store.load_state()?;
        store.acquire_lease()?;
        Ok(store)
    }

    fn load_state(&mut self) -> Result<()> {
        let last: String = self.conn.query_row(
            "SELECT last_watermark FROM replication_state",
            [],
            |row| row.get(0),
        )?;
        self.last_watermark = Watermark::new(last);
        Ok(())
    }

    /// The log's head watermark; [`Watermark::MIN`] when empty.
    pub fn last_watermark(&self) -> &Watermark {
        &self.last_watermark
    }

    // =========================================================================
    // Writer Lease
    // =========================================================================

    /// Writes a fresh lease token into `replication_state.owner`.
    ///
    /// Any writer still holding the previous token aborts on its next
    /// append. This is the failover handshake: last acquirer wins.
    pub fn acquire_lease(&mut self) -> Result<()> {
        let token: String = {
            let mut rng = rand::thread_rng();
            (0..16)
                .map(|_| format!("{:x}", rng.gen_range(0..16)))
                .collect()
        };
        self.conn.execute(
            "UPDATE replication_state SET owner = ?1",
            params![token],
        )?;
        info!(owner = %token, "acquired change-log writer lease");
        self.lease = token;
        Ok(())
    }

    /// Verifies this writer still owns the lease.
    pub fn assert_lease(&self) -> Result<()> {
        let owner: Option<String> = self
            .conn
            .query_row("SELECT owner FROM replication_state", [], |row| row.get(0))?;
        match owner {
            Some(current) if current == self.lease => Ok(()),
            current => Err(Error::LeaseLost {
                held: self.lease.clone(),
                current: current.unwrap_or_default(),
            }),
        }
    }

    // =========================================================================
    // Append / Truncate
    // =========================================================================

    /// Atomically appends one commit's changes under `watermark`.
    ///
    /// Fails with [`Error::WatermarkOutOfOrder`] unless the watermark
    /// strictly advances the log, and with [`Error::LeaseLost`] if another
    /// writer took over.
    pub fn append(&mut self, watermark: &Watermark, changes: &[Change]) -> Result<()> {
        if *watermark <= self.last_watermark {
            return Err(Error::WatermarkOutOfOrder {
                watermark: watermark.as_str().to_string(),
                last: self.last_watermark.as_str().to_string(),
            });
        }

        let tx = self.conn.transaction()?;
        {
            // Re-check ownership inside the transaction so a failover that
            // raced this append is observed before any row lands.
            let owner: Option<String> =
                tx.query_row("SELECT owner FROM replication_state", [], |row| row.get(0))?;
            if owner.as_deref() != Some(self.lease.as_str()) {
                return Err(Error::LeaseLost {
                    held: self.lease.clone(),
                    current: owner.unwrap_or_default(),
                });
            }

            let mut insert = tx.prepare_cached(
                "INSERT INTO change_log (watermark, pos, change) VALUES (?1, ?2, ?3)",
            )?;
            for (pos, change) in changes.iter().enumerate() {
                let json = serde_json::to_string(change)?;
                insert.execute(params![watermark.as_str(), pos as i64, json])?;
            }

            tx.execute(
                "UPDATE replication_state SET last_watermark = ?1",
                params![watermark.as_str()],
            )?;
        }
        tx.commit()?;

        self.last_watermark = watermark.clone();
        Ok(())
    }

    /// Removes entries with watermark strictly less than `watermark`.
    pub fn truncate_below(&mut self, watermark: &Watermark) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM change_log WHERE watermark < ?1",
            params![watermark.as_str()],
        )?;
        if removed > 0 {
            info!(below = %watermark, removed, "compacted change log");
        }
        Ok(removed)
    }

    // =========================================================================
    // Scan
    // =========================================================================

    /// Reads up to `limit` whole commits with watermark strictly greater
    /// than `from`, in `(watermark, pos)` order.
    pub fn scan_batch(&self, from: &Watermark, limit: usize) -> Result<Vec<CommitRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT watermark, change FROM change_log
             WHERE watermark > ?1
               AND watermark <= (
                 SELECT COALESCE(MAX(watermark), '') FROM (
                   SELECT DISTINCT watermark FROM change_log
                   WHERE watermark > ?1 ORDER BY watermark LIMIT ?2))
             ORDER BY watermark, pos",
        )?;
        let mut rows = stmt.query(params![from.as_str(), limit as i64])?;

        let mut commits: Vec<CommitRecord> = Vec::new();
        while let Some(row) = rows.next()? {
            let watermark = Watermark::new(row.get::<_, String>(0)?);
            let change: Change = serde_json::from_str(&row.get::<_, String>(1)?)?;
            match commits.last_mut() {
                Some(last) if last.watermark == watermark => last.changes.push(change),
                _ => commits.push(CommitRecord {
                    watermark,
                    changes: vec![change],
                }),
            }
        }
        Ok(commits)
    }

    /// Opens a lazy, restartable cursor over commits with watermark
    /// strictly greater than `from`.
    pub fn scan<'a>(&'a self, from: &Watermark) -> ChangeScan<'a> {
        ChangeScan {
            store: self,
            cursor: from.clone(),
            buffer: VecDeque::new(),
            done: false,
        }
    }

    // =========================================================================
    // Replication Config
    // =========================================================================

    /// Reads the stored replication config, if any.
    pub fn read_config(&self) -> Result<Option<ReplicationConfig>> {
        let row = self
            .conn
            .query_row(
                "SELECT replica_version, publications, reset_required
                 FROM replication_config",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((replica_version, pubs_json, reset)) => Ok(Some(ReplicationConfig {
                replica_version,
                publications: serde_json::from_str(&pubs_json)?,
                reset_required: reset != 0,
            })),
        }
    }

    /// Reconciles the stored config with the live replica's identity.
    ///
    /// Returns `true` when the stored `(replica_version, publications)`
    /// disagreed and the log was truncated and reinitialized — the caller
    /// must reset replica-side state too. Raises [`Error::AutoReset`] when
    /// the upstream flagged `reset_required` and `auto_reset` is on.
    pub fn ensure_config(
        &mut self,
        replica_version: &str,
        publications: &[String],
        auto_reset: bool,
    ) -> Result<bool> {
        match self.read_config()? {
            None => {
                self.write_config(replica_version, publications, false)?;
                Ok(false)
            }
            Some(stored) => {
                if stored.reset_required {
                    if auto_reset {
                        return Err(Error::AutoReset {
                            reason: "replication config has resetRequired set".to_string(),
                        });
                    }
                    warn!("replication config has resetRequired set but autoReset is off");
                }
                if stored.replica_version == replica_version
                    && stored.publications == publications
                {
                    return Ok(false);
                }
                warn!(
                    stored = %stored.replica_version,
                    live = %replica_version,
                    "replication config mismatch; truncating change log"
                );
                let tx = self.conn.transaction()?;
                tx.execute("DELETE FROM change_log", [])?;
                tx.execute(
                    "UPDATE replication_state SET last_watermark = ''",
                    [],
                )?;
                tx.commit()?;
                self.last_watermark = Watermark::MIN;
                self.write_config(replica_version, publications, false)?;
                Ok(true)
            }
        }
    }

    /// Flags the stored config so the next startup triggers a reset.
    pub fn mark_reset_required(&mut self) -> Result<()> {
        self.conn.execute(
            "UPDATE replication_config SET reset_required = 1",
            [],
        )?;
        Ok(())
    }

    fn write_config(
        &mut self,
        replica_version: &str,
        publications: &[String],
        reset_required: bool,
    ) -> Result<()> {
        let pubs_json = serde_json::to_string(publications)?;
        self.conn.execute(
            "INSERT INTO replication_config
               (lock, replica_version, publications, reset_required)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT (lock) DO UPDATE SET
               replica_version = excluded.replica_version,
               publications = excluded.publications,
               reset_required = excluded.reset_required",
            params![replica_version, pubs_json, i64::from(reset_required)],
        )?;
        Ok(())
    }
}

// =============================================================================
// Scan Cursor
// =============================================================================

/// A lazy, ordered cursor over whole commits.
///
/// Reads the log in batches of [`SCAN_BATCH`]; restartable by opening a new
/// scan from the last consumed watermark. `close` is a no-op folded into
/// `Drop` — the cursor holds only a borrowed connection and a buffer.
pub struct ChangeScan<'a> {
    store: &'a ChangeLogStore,
    cursor: Watermark,
    buffer: VecDeque<CommitRecord>,
    done: bool,
}

impl ChangeScan<'_> {
    /// The next commit, or `None` once the scan has reached the log head
    /// observed at the time of the last storage read.
    pub fn next(&mut self) -> Result<Option<CommitRecord>> {
        if self.buffer.is_empty() && !self.done {
            let batch = self.store.scan_batch(&self.cursor, SCAN_BATCH)?;
            if batch.len() < SCAN_BATCH {
                self.done = true;
            }
            self.buffer.extend(batch);
        }
        match self.buffer.pop_front() {
            Some(commit) => {
                self.cursor = commit.watermark.clone();
                Ok(Some(commit))
            }
            None => Ok(None),
        }
    }

    /// Watermark of the last commit yielded; the restart position.
    pub fn position(&self) -> &Watermark {
        &self.cursor
    }

    /// Drops buffered commits and ends the scan.
    pub fn close(mut self) {
        self.buffer.clear();
        self.done = true;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Row, SqliteValue};

    fn insert(table: &str, id: i64) -> Change {
        let mut row = Row::new();
        row.insert("id".to_string(), SqliteValue::Integer(id));
        Change::Insert {
            table: table.to_string(),
            row,
        }
    }

    fn wm(v: u64) -> Watermark {
        Watermark::from_u64(v)
    }

    #[test]
    fn append_enforces_strictly_increasing_watermarks() {
        let mut store = ChangeLogStore::open_in_memory().unwrap();
        store.append(&wm(5), &[insert("a", 1)]).unwrap();
        store.append(&wm(6), &[insert("a", 2)]).unwrap();

        let err = store.append(&wm(6), &[insert("a", 3)]).unwrap_err();
        assert!(matches!(err, Error::WatermarkOutOfOrder { .. }));
        let err = store.append(&wm(4), &[insert("a", 3)]).unwrap_err();
        assert!(matches!(err, Error::WatermarkOutOfOrder { .. }));
        assert_eq!(store.last_watermark(), &wm(6));
    }

    #[test]
    fn scan_returns_whole_commits_in_order() {
        let mut store = ChangeLogStore::open_in_memory().unwrap();
        store
            .append(&wm(1), &[insert("a", 1), insert("b", 1)])
            .unwrap();
        store.append(&wm(2), &[insert("a", 2)]).unwrap();
        store.append(&wm(3), &[insert("a", 3)]).unwrap();

        let mut scan = store.scan(&Watermark::MIN);
        let c1 = scan.next().unwrap().unwrap();
        assert_eq!(c1.watermark, wm(1));
        assert_eq!(c1.changes.len(), 2);

        // Restartable: a new scan from c1's watermark sees the rest.
        let pos = scan.position().clone();
        scan.close();
        let mut resumed = store.scan(&pos);
        assert_eq!(resumed.next().unwrap().unwrap().watermark, wm(2));
        assert_eq!(resumed.next().unwrap().unwrap().watermark, wm(3));
        assert!(resumed.next().unwrap().is_none());
    }

    #[test]
    fn scan_is_exclusive_of_the_from_watermark() {
        let mut store = ChangeLogStore::open_in_memory().unwrap();
        store.append(&wm(1), &[insert("a", 1)]).unwrap();
        store.append(&wm(2), &[insert("a", 2)]).unwrap();

        let batch = store.scan_batch(&wm(1), 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].watermark, wm(2));
    }

    #[test]
    fn truncate_below_removes_only_older_entries() {
        let mut store = ChangeLogStore::open_in_memory().unwrap();
        for v in 1..=5 {
            store.append(&wm(v), &[insert("a", v as i64)]).unwrap();
        }
        let removed = store.truncate_below(&wm(3)).unwrap();
        assert_eq!(removed, 2);

        let rest = store.scan_batch(&Watermark::MIN, 10).unwrap();
        let watermarks: Vec<_> = rest.iter().map(|c| c.watermark.clone()).collect();
        assert_eq!(watermarks, vec![wm(3), wm(4), wm(5)]);
    }

    #[test]
    fn lease_transfer_aborts_the_old_writer() {
        let mut store = ChangeLogStore::open_in_memory().unwrap();
        store.append(&wm(1), &[insert("a", 1)]).unwrap();

        // A failover writer CASes a new token in.
        store.conn.execute(
            "UPDATE replication_state SET owner = 'other-node'",
            [],
        )
        .unwrap();

        let err = store.append(&wm(2), &[insert("a", 2)]).unwrap_err();
        assert!(matches!(err, Error::LeaseLost { .. }));
        assert!(store.assert_lease().is_err());

        // Nothing from the failed append landed.
        let commits = store.scan_batch(&Watermark::MIN, 10).unwrap();
        assert_eq!(commits.len(), 1);
    }

    #[test]
    fn config_mismatch_truncates_and_reinitializes() {
        let mut store = ChangeLogStore::open_in_memory().unwrap();
        let pubs = vec!["app_public".to_string()];
        assert!(!store.ensure_config("v1", &pubs, false).unwrap());

        store.append(&wm(1), &[insert("a", 1)]).unwrap();
        assert!(!store.ensure_config("v1", &pubs, false).unwrap());
        assert_eq!(store.scan_batch(&Watermark::MIN, 10).unwrap().len(), 1);

        // A different replica lineage wipes the log.
        assert!(store.ensure_config("v2", &pubs, false).unwrap());
        assert!(store.scan_batch(&Watermark::MIN, 10).unwrap().is_empty());
        assert!(store.last_watermark().is_min());
    }

    #[test]
    fn reset_required_with_auto_reset_raises() {
        let mut store = ChangeLogStore::open_in_memory().unwrap();
        let pubs = vec!["app_public".to_string()];
        store.ensure_config("v1", &pubs, false).unwrap();
        store.mark_reset_required().unwrap();

        let err = store.ensure_config("v1", &pubs, true).unwrap_err();
        assert!(matches!(err, Error::AutoReset { .. }));

        // Without autoReset the store keeps going.
        assert!(!store.ensure_config("v1", &pubs, false).unwrap());
    }
}
