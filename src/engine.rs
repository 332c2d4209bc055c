//! # Engine
//!
//! Wires the pipeline together and supervises it:
//!
//! ```text
//! upstream source ──► ChangeStreamer ──► change_log (C1)
//!                           │
//!                           ▼ subscription
//!                      Replicator ──► replica + _viewsync_change_log
//!                           │ broadcast
//!                           ▼
//!                  ViewSyncer per client group ──► client handlers
//! ```
//!
//! The supervisor owns the auto-reset path: when the upstream declares its
//! position unusable, the replica and change log are wiped, initial sync
//! re-runs, and the pipeline restarts. Fatal startup failures map to
//! process exit codes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::change_log::ChangeLogStore;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::replicator::{ReplicaChange, Replica, Replicator};
use crate::source::ChangeSource;
use crate::streamer::{ChangeStreamer, StreamerConfig};
use crate::types::{ClientGroupId, TableSpec, Watermark};
use crate::view_syncer::{spawn_view_syncer, Materializations, ViewSyncer, ViewSyncerHandle};

/// Exit code for a clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Exit code when the replica cannot be opened or initialized.
pub const EXIT_DB_INIT: i32 = 1;
/// Exit code for configuration errors.
pub const EXIT_CONFIG: i32 = 2;
/// Exit code for unrecoverable upstream loss.
pub const EXIT_UPSTREAM: i32 = 3;

// =============================================================================
// Engine
// =============================================================================

/// Owns configuration and the shared materialization registry; starts
/// pipelines and supervises restarts.
pub struct Engine {
    config: Config,
    materializations: Materializations,
}

impl Engine {
    /// An engine over a validated config.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            materializations: Materializations::new(),
        })
    }

    /// The engine's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn replica_path(&self) -> PathBuf {
        PathBuf::from(&self.config.replica_file)
    }

    fn cdc_path(&self) -> PathBuf {
        PathBuf::from(format!("{}-cdc", self.config.replica_file))
    }

    /// Builds and starts one pipeline instance over `source`.
    ///
    /// Steps: reconcile the stored replication config, run initial sync on
    /// a fresh replica, start the streamer (which owns the writer lease),
    /// and start the replicator from the replica's version.
    pub async fn start(&self, mut source: Box<dyn ChangeSource>) -> Result<Pipeline> {
        let specs = source.tables();
        let replica_version = crate::schema::schema_hash(&specs);
        let mut publications: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        publications.sort();

        let mut store = ChangeLogStore::open(self.cdc_path())?;
        let reset = store.ensure_config(&replica_version, &publications, self.config.auto_reset)?;
        if reset {
            warn!("replication config changed; discarding the stale replica");
            crate::replicator::remove_store_files(&self.replica_path())?;
        }

        let mut replica = Replica::open(self.replica_path(), &specs)?;
        if replica.version().is_min() && self.config.initial_sync {
            let baseline = source.baseline();
            let snapshot = source.snapshot()?;
            replica.initial_sync(&baseline, snapshot)?;
        }

        let streamer_config = StreamerConfig {
            max_connections: self.config.max_connections,
            min_delay_ms: self.config.min_delay_ms,
            max_delay_ms: self.config.max_delay_ms,
            ..StreamerConfig::default()
        };
        let streamer = ChangeStreamer::spawn(store, source, streamer_config);

        let from = replica.version().clone();
        let replica_path = self.replica_path();
        let tables: BTreeMap<String, TableSpec> =
            specs.iter().map(|s| (s.name.clone(), s.clone())).collect();

        let replicator = Replicator::new(replica);
        let commits = replicator.notifier();
        let stream = streamer.subscribe(from).await?;
        let replicator_task = tokio::spawn(replicator.run(stream));

        let watchdog = tokio::spawn({
            let mut progress = commits.subscribe();
            let window = std::time::Duration::from_millis(self.config.watchdog_timer_ms.max(1));
            async move {
                loop {
                    match tokio::time::timeout(window, progress.recv()).await {
                        Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => break,
                        Ok(_) => {}
                        Err(_) => {
                            warn!(window_ms = window.as_millis() as u64,
                                  "no replica progress within the watchdog window");
                        }
                    }
                }
            }
        });

        info!(replica = %replica_path.display(), "pipeline started");
        Ok(Pipeline {
            streamer,
            replicator_task,
            watchdog,
            commits,
            replica_path,
            tables,
            materializations: self.materializations.clone(),
            shard: self.config.shard.clone(),
            debounce: std::time::Duration::from_millis(self.config.debounce_delay_ms),
        })
    }

    /// Runs pipelines until a clean shutdown or a fatal error, wiping and
    /// resyncing on [`Error::AutoReset`]. `make_source` is called for
    /// every (re)start.
    pub async fn run<F>(self, mut make_source: F) -> i32
    where
        F: FnMut() -> Box<dyn ChangeSource>,
    {
        loop {
            let pipeline = match self.start(make_source()).await {
                Ok(pipeline) => pipeline,
                Err(err @ Error::AutoReset { .. }) => {
                    if !self.config.auto_reset {
                        error!(%err, "upstream requires a reset but autoReset is off");
                        return EXIT_UPSTREAM;
                    }
                    if let Err(err) = self.wipe() {
                        error!(%err, "auto-reset wipe failed");
                        return EXIT_DB_INIT;
                    }
                    continue;
                }
                Err(err @ Error::DatabaseInit { .. }) => {
                    error!(%err, "cannot initialize storage");
                    return EXIT_DB_INIT;
                }
                Err(err @ Error::Config { .. }) => {
                    error!(%err, "configuration rejected");
                    return EXIT_CONFIG;
                }
                Err(err) => {
                    error!(%err, "startup failed");
                    return EXIT_UPSTREAM;
                }
            };

            match pipeline.join().await {
                Ok(()) => return EXIT_OK,
                Err(Error::AutoReset { reason }) if self.config.auto_reset => {
                    warn!(%reason, "auto-reset: wiping replica and re-running initial sync");
                    if let Err(err) = self.wipe() {
                        error!(%err, "auto-reset wipe failed");
                        return EXIT_DB_INIT;
                    }
                }
                Err(err @ Error::AutoReset { .. }) => {
                    error!(%err, "upstream lost and autoReset is off");
                    return EXIT_UPSTREAM;
                }
                Err(err) => {
                    error!(%err, "pipeline failed");
                    return EXIT_UPSTREAM;
                }
            }
        }
    }

    /// Deletes the replica and CDC store files.
    fn wipe(&self) -> Result<()> {
        crate::replicator::remove_store_files(&self.replica_path())?;
        crate::replicator::remove_store_files(&self.cdc_path())
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// One running streamer + replicator pair, plus the ingredients for
/// spawning per-group view syncers.
pub struct Pipeline {
    streamer: ChangeStreamer,
    replicator_task: JoinHandle<Result<()>>,
    watchdog: JoinHandle<()>,
    commits: tokio::sync::broadcast::Sender<ReplicaChange>,
    replica_path: PathBuf,
    tables: BTreeMap<String, TableSpec>,
    materializations: Materializations,
    shard: String,
    debounce: std::time::Duration,
}

impl Pipeline {
    /// The streamer handle (for extra subscribers and compaction).
    pub fn streamer(&self) -> &ChangeStreamer {
        &self.streamer
    }

    /// Spawns the view syncer for one client group.
    pub fn view_syncer(&self, group_id: ClientGroupId) -> ViewSyncerHandle {
        let syncer = ViewSyncer::new(
            group_id,
            self.shard.clone(),
            self.replica_path.clone(),
            self.tables.clone(),
            self.materializations.clone(),
        );
        spawn_view_syncer(syncer, self.commits.subscribe(), self.debounce)
    }

    /// Compacts the change log below what every subscriber and pinned
    /// snapshot still needs.
    pub async fn compact(&self, pinned_floor: Watermark) -> Result<usize> {
        self.streamer.compact(pinned_floor).await
    }

    /// Waits for the pipeline to stop and returns its terminal result.
    /// The replicator finishing cleanly (stream closed) is a clean stop.
    pub async fn join(self) -> Result<()> {
        let replicated = match self.replicator_task.await {
            Ok(result) => result,
            Err(_) => Err(Error::Closed {
                component: "replicator task",
            }),
        };
        self.watchdog.abort();
        let streamed = self.streamer.shutdown().await;
        replicated.and(streamed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CustomSource;

    fn config_for(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.replica_file = dir
            .join("replica.db")
            .to_string_lossy()
            .into_owned();
        config.auto_reset = true;
        config.debounce_delay_ms = 0;
        config
    }

    #[tokio::test]
    async fn startup_runs_initial_sync_and_streams() {
        use crate::types::{Change, ColumnSpec, ColumnType, Row, SqliteValue};

        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(config_for(dir.path())).unwrap();

        let mut columns = BTreeMap::new();
        columns.insert(
            "id".to_string(),
            ColumnSpec {
                data_type: ColumnType::Integer,
                not_null: true,
                pos: 0,
            },
        );
        let spec = TableSpec {
            name: "items".to_string(),
            columns,
            primary_key: vec!["id".to_string()],
        };

        let mut seeded = Row::new();
        seeded.insert("id".to_string(), SqliteValue::Integer(1));
        let (source, handle) = CustomSource::with_snapshot(
            vec![spec],
            vec![("items".to_string(), vec![seeded])],
            Watermark::from_u64(5),
        );

        let pipeline = engine.start(Box::new(source)).await.unwrap();
        let mut commits = pipeline.commits.subscribe();

        let mut row = Row::new();
        row.insert("id".to_string(), SqliteValue::Integer(2));
        handle
            .send_commit(
                Watermark::from_u64(6),
                vec![Change::Insert {
                    table: "items".to_string(),
                    row,
                }],
            )
            .await
            .unwrap();

        let change = commits.recv().await.unwrap();
        assert_eq!(change.prev, Watermark::from_u64(5), "baseline from initial sync");
        assert_eq!(change.next, Watermark::from_u64(6));

        drop(handle);
        // With the feed gone the streamer retries; shut it down directly.
        let _ = pipeline.streamer.shutdown().await;
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = Config::default();
        config.max_connections = 0;
        assert!(Engine::new(config).is_err());
    }
}
