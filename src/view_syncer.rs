//! # View Syncer (C6)
//!
//! One syncer per client group. It owns the group's desired/got query
//! sets, the shared query materializations, and the row index that tracks
//! which queries reference which columns of which rows — and turns replica
//! commits into per-client pokes.
//!
//! ## Processing one upstream commit
//!
//! ```text
//! commit ──► DiffTags ──► prune queries by invalidation info
//!                   │
//!                   ▼
//!        execute affected queries against curr snapshot
//!                   │
//!                   ▼
//!        partition flat rows into per-table sub-rows (alias paths)
//!                   │
//!                   ▼
//!        diff against row_index ──► put / merge / constrain / del
//!                   │
//!                   ▼
//!        one poke per client, filtered by each client's base cookie
//! ```
//!
//! Ownership is arena-style: queries, rows and clients live in maps keyed
//! by `QueryHash`, `RowId` and `ClientId`; cross-references are ids, never
//! handles. All state is owned by the group task; cross-group access goes
//! through the shared [`Materializations`] registry only.
//!
//! Queries are executed in full against the current snapshot on every
//! relevant commit (every query is treated as non-incremental); the diff
//! against the row index produces the minimal patch set. The pinned
//! snapshot pair is still what detects schema changes and replica
//! advancement, and the previous snapshot gates change-log compaction.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ast::Query;
use crate::client::{
    ClientHandler, ClientsPatchOp, DesiredQueryOp, Downstream, EntityPatchOp, PatchData,
    QueriesPatchOp, Upstream,
};
use crate::error::{Error, Result};
use crate::replicator::ReplicaChange;
use crate::snapshotter::Snapshot;
use crate::transform::{
    alias_table, execute, split_alias, DiffTags, FlatRow, QueryTransformer, TransformedQuery,
};
use crate::types::{
    ClientGroupId, ClientId, QueryHash, Row, RowId, RowKey, TableSpec, Watermark,
    ROW_VERSION_COLUMN,
};

/// How long an unreferenced materialization lingers before teardown, so
/// subscribe/unsubscribe/resubscribe flicker does not thrash.
pub const MATERIALIZATION_IDLE: Duration = Duration::from_secs(10);

// =============================================================================
// Materializations
// =============================================================================

/// One materialized query, shared by transformation hash across clients
/// and groups. Result rows are cached per snapshot version, so two groups
/// at the same version pay for one execution.
pub struct Materialization {
    transformed: Arc<TransformedQuery>,
    refs: AtomicUsize,
    cache: Mutex<Option<(Watermark, Arc<Vec<FlatRow>>)>>,
}

impl Materialization {
    /// The canonical query this materializes.
    pub fn transformed(&self) -> &TransformedQuery {
        &self.transformed
    }

    /// Executes against `snapshot`, reusing the cached result when the
    /// version matches.
    pub fn execute_at(&self, snapshot: &Snapshot) -> Result<Arc<Vec<FlatRow>>> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some((version, rows)) = &*cache {
                if version == snapshot.version() {
                    return Ok(Arc::clone(rows));
                }
            }
        }
        let rows = Arc::new(execute(&self.transformed, snapshot)?);
        *self.cache.lock().unwrap() = Some((snapshot.version().clone(), Arc::clone(&rows)));
        Ok(rows)
    }
}

/// The cross-group registry: at most one [`Materialization`] per
/// transformation hash, reference-counted, torn down asynchronously after
/// [`MATERIALIZATION_IDLE`] once the last reference drops.
#[derive(Clone)]
pub struct Materializations {
    inner: Arc<Mutex<HashMap<QueryHash, Arc<Materialization>>>>,
    idle: Duration,
}

impl Materializations {
    /// A registry with the default idle-teardown timer.
    pub fn new() -> Self {
        Self::with_idle(MATERIALIZATION_IDLE)
    }

    /// A registry with an explicit idle-teardown timer.
    pub fn with_idle(idle: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            idle,
        }
    }

    /// Acquires (or creates) the materialization for `transformed`,
    /// bumping its reference count.
    pub fn acquire(&self, transformed: Arc<TransformedQuery>) -> Arc<Materialization> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entry(transformed.hash.clone())
            .or_insert_with(|| {
                Arc::new(Materialization {
                    transformed,
                    refs: AtomicUsize::new(0),
                    cache: Mutex::new(None),
                })
            });
        entry.refs.fetch_add(1, Ordering::SeqCst);
        Arc::clone(entry)
    }

    /// Releases one reference; schedules teardown when it was the last.
    pub fn release(&self, hash: &QueryHash) {
        let materialization = {
            let inner = self.inner.lock().unwrap();
            match inner.get(hash) {
                Some(m) => Arc::clone(m),
                None => return,
            }
        };
        if materialization.refs.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let registry = self.clone();
        let hash = hash.clone();
        tokio::spawn(async move {
            tokio::time::sleep(registry.idle).await;
            let mut inner = registry.inner.lock().unwrap();
            if let Some(m) = inner.get(&hash) {
                if m.refs.load(Ordering::SeqCst) == 0 {
                    debug!(%hash, "tearing down idle materialization");
                    inner.remove(&hash);
                }
            }
        });
    }

    /// True while a materialization exists for `hash`.
    pub fn contains(&self, hash: &QueryHash) -> bool {
        self.inner.lock().unwrap().contains_key(hash)
    }

    /// Number of live materializations.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// True when no materialization is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Materializations {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Row Index
// =============================================================================

/// Which queries reference which columns of one row, and the row's last
/// seen version.
#[derive(Debug, Clone, PartialEq)]
pub struct RowRecord {
    /// The row's identity.
    pub id: RowId,
    /// `_0_version` of the row as last delivered.
    pub row_version: Watermark,
    /// Column → the queries selecting it.
    pub queried_columns: BTreeMap<String, BTreeSet<QueryHash>>,
}

impl RowRecord {
    fn is_unreferenced(&self) -> bool {
        self.queried_columns.is_empty()
    }

    fn columns(&self) -> BTreeSet<String> {
        self.queried_columns.keys().cloned().collect()
    }
}

// =============================================================================
// View Syncer
// =============================================================================

struct QueryEntry {
    ast: Query,
    materialization: Arc<Materialization>,
    desired_by: BTreeSet<ClientId>,
}

struct ClientEntry {
    desired: BTreeSet<QueryHash>,
    handler: ClientHandler,
}

/// Per-group view synchronization state. All methods run on the group
/// task; [`spawn_view_syncer`] provides the task wrapper.
pub struct ViewSyncer {
    group_id: ClientGroupId,
    shard: String,
    replica_path: PathBuf,
    tables: BTreeMap<String, TableSpec>,
    transformer: QueryTransformer,
    materializations: Materializations,

    clients: BTreeMap<ClientId, ClientEntry>,
    queries: BTreeMap<QueryHash, QueryEntry>,
    got: BTreeSet<QueryHash>,
    row_index: HashMap<RowId, RowRecord>,

    /// Previous processing snapshot; pins the replica for diffing and
    /// gates compaction.
    snapshot: Option<Snapshot>,
    current_cookie: Watermark,
    minor: u64,
    poke_counter: u64,

    pending_clients_patch: Vec<ClientsPatchOp>,
    pending_mutation_ids: BTreeMap<String, u64>,
}

impl ViewSyncer {
    /// A syncer for `group_id` over the replica at `replica_path`.
    pub fn new(
        group_id: ClientGroupId,
        shard: impl Into<String>,
        replica_path: impl Into<PathBuf>,
        tables: BTreeMap<String, TableSpec>,
        materializations: Materializations,
    ) -> Self {
        Self {
            group_id,
            shard: shard.into(),
            replica_path: replica_path.into(),
            transformer: QueryTransformer::new(tables.clone()),
            tables,
            materializations,
            clients: BTreeMap::new(),
            queries: BTreeMap::new(),
            got: BTreeSet::new(),
            row_index: HashMap::new(),
            snapshot: None,
            current_cookie: Watermark::MIN,
            minor: 0,
            poke_counter: 0,
            pending_clients_patch: Vec::new(),
            pending_mutation_ids: BTreeMap::new(),
        }
    }

    /// The group this syncer serves.
    pub fn group_id(&self) -> &ClientGroupId {
        &self.group_id
    }

    /// The group's current cookie.
    pub fn current_cookie(&self) -> &Watermark {
        &self.current_cookie
    }

    /// The group's got set.
    pub fn got(&self) -> &BTreeSet<QueryHash> {
        &self.got
    }

    /// The row record for `id`, if any query references the row.
    pub fn row_record(&self, id: &RowId) -> Option<&RowRecord> {
        self.row_index.get(id)
    }

    /// The oldest replica version this group still pins, for compaction.
    pub fn pinned_version(&self) -> Option<Watermark> {
        self.snapshot.as_ref().map(|s| s.version().clone())
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Adds a client to the group at `base_cookie`; returns the frame
    /// stream its connection consumes. The membership patch rides the next
    /// poke.
    pub fn add_client(
        &mut self,
        client_id: ClientId,
        base_cookie: Watermark,
    ) -> mpsc::Receiver<Downstream> {
        let (handler, rx) = ClientHandler::channel(client_id.clone(), base_cookie);
        self.pending_clients_patch.push(ClientsPatchOp::Put {
            client_id: client_id.clone(),
        });
        self.clients.insert(
            client_id,
            ClientEntry {
                desired: BTreeSet::new(),
                handler,
            },
        );
        rx
    }

    /// Records a mutation-id advance to ride the next poke.
    pub fn record_mutation_id(&mut self, client_id: &ClientId, mutation_id: u64) {
        let entry = self
            .pending_mutation_ids
            .entry(client_id.as_str().to_string())
            .or_insert(0);
        *entry = (*entry).max(mutation_id);
    }

    /// Removes clients and every query only they desired, then pokes the
    /// survivors with the membership and row fallout.
    pub async fn remove_clients(&mut self, client_ids: &[ClientId]) -> Result<()> {
        let mut affected: BTreeSet<QueryHash> = BTreeSet::new();
        let mut desired_patches: BTreeMap<ClientId, Vec<QueriesPatchOp>> = BTreeMap::new();
        let mut got_patches = Vec::new();

        for client_id in client_ids {
            let Some(entry) = self.clients.remove(client_id) else {
                continue;
            };
            self.pending_clients_patch.push(ClientsPatchOp::Del {
                client_id: client_id.clone(),
            });
            for hash in entry.desired {
                desired_patches
                    .entry(client_id.clone())
                    .or_default()
                    .push(QueriesPatchOp::Del { hash: hash.clone() });
                if self.drop_query_reference(client_id, &hash) {
                    affected.insert(hash.clone());
                    if self.got.remove(&hash) {
                        got_patches.push(QueriesPatchOp::Del { hash });
                    }
                }
            }
        }
        if self.clients.is_empty() {
            // No one left to poke; membership patches are moot.
            self.pending_clients_patch.clear();
            return Ok(());
        }
        self.poke(affected, desired_patches, got_patches).await
    }

    /// Applies an upstream message from `client_id`.
    pub async fn handle_upstream(&mut self, client_id: &ClientId, message: Upstream) -> Result<()> {
        match message {
            Upstream::ChangeDesiredQueries {
                desired_queries_patch,
            } => {
                self.change_desired_queries(client_id, desired_queries_patch)
                    .await
            }
            Upstream::DeleteClients { client_ids } => self.remove_clients(&client_ids).await,
        }
    }

    // =========================================================================
    // Desired Queries
    // =========================================================================

    /// Applies a desired-query patch for one client and pokes the group.
    ///
    /// An invalid query is reported to the originating client and dropped;
    /// the rest of the patch still applies.
    pub async fn change_desired_queries(
        &mut self,
        client_id: &ClientId,
        ops: Vec<DesiredQueryOp>,
    ) -> Result<()> {
        if !self.clients.contains_key(client_id) {
            return Err(Error::protocol(format!("unknown client {client_id}")));
        }

        let mut affected: BTreeSet<QueryHash> = BTreeSet::new();
        let mut desired_patches: BTreeMap<ClientId, Vec<QueriesPatchOp>> = BTreeMap::new();
        let mut got_patches = Vec::new();
        let mut newly_materialized = Vec::new();
        let mut invalid: Vec<Error> = Vec::new();

        for op in ops {
            match op {
                DesiredQueryOp::Put { hash, ast } => {
                    let client = self.clients.get_mut(client_id).expect("checked above");
                    if client.desired.contains(&hash) {
                        continue;
                    }
                    let transformed = match self.transformer.transform(&ast) {
                        Ok(t) => t,
                        Err(err @ Error::InvalidQuery { .. }) => {
                            warn!(client = %client_id, %err, "dropping invalid desired query");
                            invalid.push(err);
                            continue;
                        }
                        Err(err) => return Err(err),
                    };
                    client.desired.insert(hash.clone());
                    let materializations = &self.materializations;
                    let entry = self.queries.entry(hash.clone()).or_insert_with(|| QueryEntry {
                        ast: ast.clone(),
                        materialization: materializations.acquire(transformed),
                        desired_by: BTreeSet::new(),
                    });
                    entry.desired_by.insert(client_id.clone());
                    desired_patches
                        .entry(client_id.clone())
                        .or_default()
                        .push(QueriesPatchOp::Put {
                            hash: hash.clone(),
                            ast: Some(ast),
                        });
                    affected.insert(hash.clone());
                    newly_materialized.push(hash);
                }
                DesiredQueryOp::Del { hash } => {
                    let client = self.clients.get_mut(client_id).expect("checked above");
                    if !client.desired.remove(&hash) {
                        continue;
                    }
                    desired_patches
                        .entry(client_id.clone())
                        .or_default()
                        .push(QueriesPatchOp::Del { hash: hash.clone() });
                    if self.drop_query_reference(client_id, &hash) {
                        affected.insert(hash.clone());
                        if self.got.remove(&hash) {
                            got_patches.push(QueriesPatchOp::Del { hash });
                        }
                    }
                }
            }
        }

        for hash in newly_materialized {
            if self.got.insert(hash.clone()) {
                got_patches.push(QueriesPatchOp::Put { hash, ast: None });
            }
        }

        for err in invalid {
            if let Some(client) = self.clients.get_mut(client_id) {
                let _ = client.handler.send_error(&err).await;
            }
        }

        self.poke(affected, desired_patches, got_patches).await
    }

    /// Drops one client's reference to a query; returns `true` when the
    /// query itself went away.
    fn drop_query_reference(&mut self, client_id: &ClientId, hash: &QueryHash) -> bool {
        let Some(entry) = self.queries.get_mut(hash) else {
            return false;
        };
        entry.desired_by.remove(client_id);
        if !entry.desired_by.is_empty() {
            return false;
        }
        let entry = self.queries.remove(hash).expect("present");
        self.materializations
            .release(&entry.materialization.transformed().hash);
        true
    }

    // =========================================================================
    // Upstream Commits
    // =========================================================================

    /// Processes one applied commit.
    pub async fn process_commit(&mut self, change: &ReplicaChange) -> Result<()> {
        self.process_batch(std::slice::from_ref(change)).await
    }

    /// Processes a debounced batch of applied commits as one poke.
    pub async fn process_batch(&mut self, changes: &[ReplicaChange]) -> Result<()> {
        let mut tags = DiffTags::default();
        let mut any_new = false;
        for change in changes {
            if change.next <= self.current_cookie {
                continue;
            }
            tags.add_commit(&change.commit);
            any_new = true;
        }
        if !any_new {
            return Ok(());
        }

        let affected: BTreeSet<QueryHash> = self
            .queries
            .iter()
            .filter(|(_, entry)| {
                entry
                    .materialization
                    .transformed()
                    .invalidation
                    .affected_by(&tags)
            })
            .map(|(hash, _)| hash.clone())
            .collect();

        self.poke(affected, BTreeMap::new(), Vec::new()).await
    }

    /// Recomputes everything after the commit channel lagged: every query
    /// is treated as affected, producing one catch-up poke.
    pub async fn resync(&mut self) -> Result<()> {
        let affected: BTreeSet<QueryHash> = self.queries.keys().cloned().collect();
        self.poke(affected, BTreeMap::new(), Vec::new()).await
    }

    // =========================================================================
    // Poke Assembly
    // =========================================================================

    /// Opens the current snapshot, diffs the affected queries, and sends
    /// one poke to every client in the group.
    async fn poke(
        &mut self,
        mut affected: BTreeSet<QueryHash>,
        desired_patches: BTreeMap<ClientId, Vec<QueriesPatchOp>>,
        got_patches: Vec<QueriesPatchOp>,
    ) -> Result<()> {
        let curr = Snapshot::open(&self.replica_path)?;

        let schema_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|prev| prev.schema_hash() != curr.schema_hash());
        let mut entities = Vec::new();
        if schema_changed {
            // Spanning a schema change: drop every cached row and
            // re-materialize the whole group at the new version.
            info!(group = %self.group_id, "schema changed; re-materializing group");
            for record in self.row_index.values() {
                entities.push(EntityPatchOp::Del {
                    key: record.id.entity_key(),
                });
            }
            self.row_index.clear();
            self.transformer = QueryTransformer::new(self.tables.clone());
            affected = self.queries.keys().cloned().collect();
        }
        entities.extend(self.run_and_diff(&affected, &curr)?);

        let cookie = self.next_cookie(curr.version());
        let clients_patch = std::mem::take(&mut self.pending_clients_patch);
        let mutation_ids = std::mem::take(&mut self.pending_mutation_ids);

        self.poke_counter += 1;
        let poke_id = format!(
            "{}/{}/{}",
            self.shard, self.group_id, self.poke_counter
        );

        let mut dead = Vec::new();
        for (client_id, entry) in &mut self.clients {
            let sent = send_one(
                &mut entry.handler,
                &poke_id,
                &cookie,
                &mutation_ids,
                &clients_patch,
                &desired_patches,
                &got_patches,
                &entities,
            )
            .await;
            if let Err(err) = sent {
                warn!(client = %client_id, %err, "dropping client on poke failure");
                dead.push(client_id.clone());
            }
        }
        for client_id in &dead {
            self.clients.remove(client_id);
            self.pending_clients_patch.push(ClientsPatchOp::Del {
                client_id: client_id.clone(),
            });
        }

        self.current_cookie = cookie;
        self.snapshot = Some(curr);
        Ok(())
    }

    /// The next cookie: the replica version when it advanced, otherwise a
    /// minor bump on the current major.
    fn next_cookie(&mut self, replica_version: &Watermark) -> Watermark {
        if *replica_version > self.current_cookie {
            self.minor = 0;
            replica_version.clone()
        } else {
            self.minor += 1;
            Watermark::new(self.current_cookie.major()).with_minor(self.minor)
        }
    }

    // =========================================================================
    // Row Diffing
    // =========================================================================

    /// Re-executes the affected queries at `curr` and diffs the results
    /// against the row index, producing entity patches.
    fn run_and_diff(
        &mut self,
        affected: &BTreeSet<QueryHash>,
        curr: &Snapshot,
    ) -> Result<Vec<EntityPatchOp>> {
        if affected.is_empty() {
            return Ok(Vec::new());
        }

        // Before-images of every row any affected query referenced.
        let mut before: HashMap<RowId, (Watermark, BTreeSet<String>)> = HashMap::new();
        for record in self.row_index.values() {
            let referenced = record
                .queried_columns
                .values()
                .any(|queries| queries.iter().any(|q| affected.contains(q)));
            if referenced {
                before.insert(record.id.clone(), (record.row_version.clone(), record.columns()));
            }
        }

        // Remove every affected-query reference; re-established below.
        for record in self.row_index.values_mut() {
            for queries in record.queried_columns.values_mut() {
                queries.retain(|q| !affected.contains(q));
            }
            record.queried_columns.retain(|_, queries| !queries.is_empty());
        }

        // Gather the new results.
        struct Accum {
            version: Watermark,
            values: Row,
            columns: BTreeMap<String, BTreeSet<QueryHash>>,
        }
        let mut results: HashMap<RowId, Accum> = HashMap::new();
        for hash in affected {
            let Some(entry) = self.queries.get(hash) else {
                continue; // removed query: only its dereferencing matters
            };
            let rows = entry.materialization.execute_at(curr)?;
            for flat in rows.iter() {
                for (row_id, version, sub_row) in self.partition(flat)? {
                    let accum = results.entry(row_id).or_insert_with(|| Accum {
                        version: version.clone(),
                        values: Row::new(),
                        columns: BTreeMap::new(),
                    });
                    accum.version = version;
                    for (column, value) in sub_row {
                        accum
                            .columns
                            .entry(column.clone())
                            .or_default()
                            .insert(hash.clone());
                        accum.values.insert(column, value);
                    }
                }
            }
        }

        // Diff: walk every row that was or is referenced.
        let mut touched: BTreeSet<RowId> = before.keys().cloned().collect();
        touched.extend(results.keys().cloned());

        let mut patches = Vec::new();
        for row_id in touched {
            let before_state = before.get(&row_id);
            let accum = results.remove(&row_id);

            let now_unreferenced = if let Some(record) = self.row_index.get_mut(&row_id) {
                match accum {
                    Some(accum) => {
                        record.row_version = accum.version;
                        for (column, queries) in accum.columns {
                            record
                                .queried_columns
                                .entry(column)
                                .or_default()
                                .extend(queries);
                        }
                        emit_for_existing(record, before_state, Some(accum.values), &mut patches);
                    }
                    None => emit_for_existing(record, before_state, None, &mut patches),
                }
                record.is_unreferenced()
            } else if let Some(accum) = accum {
                patches.push(EntityPatchOp::Put {
                    key: row_id.entity_key(),
                    value: accum.values,
                });
                self.row_index.insert(
                    row_id.clone(),
                    RowRecord {
                        id: row_id.clone(),
                        row_version: accum.version,
                        queried_columns: accum.columns,
                    },
                );
                false
            } else {
                // Referenced before the removal pass, fully gone now.
                patches.push(EntityPatchOp::Del {
                    key: row_id.entity_key(),
                });
                continue;
            };
            if now_unreferenced {
                self.row_index.remove(&row_id);
                patches.push(EntityPatchOp::Del {
                    key: row_id.entity_key(),
                });
            }
        }
        Ok(patches)
    }

    /// Splits one flat result row into `(rowID, rowVersion, sub-row)`
    /// triples by alias path. Sub-rows whose key columns are all NULL are
    /// absent left-join children and are skipped. A sub-row without
    /// `_0_version` is a fatal data error.
    fn partition(&self, flat: &FlatRow) -> Result<Vec<(RowId, Watermark, Row)>> {
        let mut grouped: BTreeMap<&str, Row> = BTreeMap::new();
        for (alias, value) in flat {
            let Some((row_alias, column)) = split_alias(alias) else {
                continue;
            };
            grouped
                .entry(row_alias)
                .or_default()
                .insert(column.to_string(), value.clone());
        }

        let mut out = Vec::new();
        for (row_alias, sub_row) in grouped {
            let table = alias_table(row_alias);
            let spec = self.tables.get(table).ok_or_else(|| Error::InvalidQuery {
                reason: format!("result alias references unknown table '{table}'"),
            })?;
            let all_keys_null = spec.primary_key.iter().all(|pk| {
                matches!(sub_row.get(pk), Some(crate::types::SqliteValue::Null) | None)
            });
            if all_keys_null {
                continue;
            }
            let version = sub_row
                .get(ROW_VERSION_COLUMN)
                .and_then(|v| v.as_text())
                .map(Watermark::from)
                .ok_or_else(|| Error::DatabaseInit {
                    reason: format!("row of '{table}' is missing {ROW_VERSION_COLUMN}"),
                })?;
            let key = RowKey::from_row(&sub_row, &spec.primary_key)?;
            out.push((RowId::new(table, &key), version, sub_row));
        }
        Ok(out)
    }
}

/// Emits merge/constrain patches for a row that already had a record.
fn emit_for_existing(
    record: &RowRecord,
    before: Option<&(Watermark, BTreeSet<String>)>,
    new_values: Option<Row>,
    patches: &mut Vec<EntityPatchOp>,
) {
    let Some((before_version, before_columns)) = before else {
        // The row was only referenced by unaffected queries before; the
        // merge above widened it.
        if let Some(values) = new_values {
            patches.push(EntityPatchOp::Merge {
                key: record.id.entity_key(),
                value: values,
            });
        }
        return;
    };
    if record.is_unreferenced() {
        return; // caller emits the del
    }

    let after_columns = record.columns();
    let version_changed = record.row_version != *before_version;
    let grew = after_columns.difference(before_columns).next().is_some();
    let shrank = before_columns.difference(&after_columns).next().is_some();

    if version_changed || grew {
        if let Some(values) = new_values {
            patches.push(EntityPatchOp::Merge {
                key: record.id.entity_key(),
                value: values,
            });
        }
    }
    if shrank {
        patches.push(EntityPatchOp::Constrain {
            key: record.id.entity_key(),
            columns: after_columns.into_iter().collect(),
        });
    }
}

/// Sends one assembled poke to one client, filtered by its base cookie.
#[allow(clippy::too_many_arguments)]
async fn send_one(
    handler: &mut ClientHandler,
    poke_id: &str,
    cookie: &Watermark,
    mutation_ids: &BTreeMap<String, u64>,
    clients_patch: &[ClientsPatchOp],
    desired_patches: &BTreeMap<ClientId, Vec<QueriesPatchOp>>,
    got_patches: &[QueriesPatchOp],
    entities: &[EntityPatchOp],
) -> Result<()> {
    let mut poker = handler.start_poke(poke_id, cookie.clone()).await?;
    if !mutation_ids.is_empty() {
        poker.add_patch(cookie, PatchData::LastMutationIdChanges(mutation_ids.clone()))?;
    }
    if !clients_patch.is_empty() {
        poker.add_patch(cookie, PatchData::Clients(clients_patch.to_vec()))?;
    }
    for (client_id, ops) in desired_patches {
        poker.add_patch(cookie, PatchData::Desired(client_id.clone(), ops.clone()))?;
    }
    if !got_patches.is_empty() {
        poker.add_patch(cookie, PatchData::Got(got_patches.to_vec()))?;
    }
    if !entities.is_empty() {
        poker.add_patch(cookie, PatchData::Entities(entities.to_vec()))?;
    }
    poker.end().await
}

// =============================================================================
// Group Task
// =============================================================================

enum SyncerCommand {
    AddClient {
        client_id: ClientId,
        base_cookie: Watermark,
        resp: oneshot::Sender<mpsc::Receiver<Downstream>>,
    },
    Message {
        client_id: ClientId,
        message: Upstream,
        resp: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        client_id: ClientId,
    },
    Shutdown,
}

/// Handle to a spawned group task.
pub struct ViewSyncerHandle {
    cmd_tx: mpsc::Sender<SyncerCommand>,
    task: JoinHandle<Result<()>>,
}

impl ViewSyncerHandle {
    /// Registers a client and returns its downstream frame stream.
    pub async fn add_client(
        &self,
        client_id: ClientId,
        base_cookie: Watermark,
    ) -> Result<mpsc::Receiver<Downstream>> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(SyncerCommand::AddClient {
                client_id,
                base_cookie,
                resp,
            })
            .await
            .map_err(|_| Error::Closed {
                component: "view syncer",
            })?;
        rx.await.map_err(|_| Error::Closed {
            component: "view syncer",
        })
    }

    /// Forwards an upstream message from a client.
    pub async fn message(&self, client_id: ClientId, message: Upstream) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(SyncerCommand::Message {
                client_id,
                message,
                resp,
            })
            .await
            .map_err(|_| Error::Closed {
                component: "view syncer",
            })?;
        rx.await.map_err(|_| Error::Closed {
            component: "view syncer",
        })?
    }

    /// Disconnects a client.
    pub async fn disconnect(&self, client_id: ClientId) -> Result<()> {
        self.cmd_tx
            .send(SyncerCommand::Disconnect { client_id })
            .await
            .map_err(|_| Error::Closed {
                component: "view syncer",
            })
    }

    /// Stops the group task.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.cmd_tx.send(SyncerCommand::Shutdown).await;
        match self.task.await {
            Ok(result) => result,
            Err(_) => Err(Error::Closed {
                component: "view syncer task",
            }),
        }
    }
}

/// Spawns the group task: commits and client commands interleaved, with
/// commit bursts debounced into one poke.
pub fn spawn_view_syncer(
    mut syncer: ViewSyncer,
    mut commits: broadcast::Receiver<ReplicaChange>,
    debounce: Duration,
) -> ViewSyncerHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel(64);
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(SyncerCommand::Shutdown) => return Ok(()),
                        Some(SyncerCommand::AddClient { client_id, base_cookie, resp }) => {
                            let rx = syncer.add_client(client_id, base_cookie);
                            let _ = resp.send(rx);
                        }
                        Some(SyncerCommand::Message { client_id, message, resp }) => {
                            let result = syncer.handle_upstream(&client_id, message).await;
                            let _ = resp.send(result);
                        }
                        Some(SyncerCommand::Disconnect { client_id }) => {
                            syncer.remove_clients(&[client_id]).await?;
                        }
                    }
                }
                commit = commits.recv() => {
                    match commit {
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "commit channel lagged; full resync");
                            syncer.resync().await?;
                        }
                        Ok(first) => {
                            // Debounce: let a burst of commits settle into
                            // one poke.
                            let mut batch = vec![first];
                            if !debounce.is_zero() {
                                tokio::time::sleep(debounce).await;
                            }
                            loop {
                                match commits.try_recv() {
                                    Ok(change) => batch.push(change),
                                    Err(_) => break,
                                }
                            }
                            syncer.process_batch(&batch).await?;
                        }
                    }
                }
            }
        }
    });
    ViewSyncerHandle { cmd_tx, task }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicator::Replica;
    use crate::types::{Change, ColumnSpec, ColumnType, CommitRecord, SqliteValue};

    fn specs() -> Vec<TableSpec> {
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
        columns.insert(
            "status".to_string(),
            ColumnSpec {
                data_type: ColumnType::Text,
                not_null: false,
                pos: 2,
            },
        );
        vec![TableSpec {
            name: "issues".to_string(),
            columns,
            primary_key: vec!["id".to_string()],
        }]
    }

    fn table_map() -> BTreeMap<String, TableSpec> {
        specs().into_iter().map(|s| (s.name.clone(), s)).collect()
    }

    fn issue(id: i64, title: &str, status: &str) -> Row {
        let mut row = Row::new();
        row.insert("id".to_string(), SqliteValue::Integer(id));
        row.insert("title".to_string(), SqliteValue::Text(title.to_string()));
        row.insert("status".to_string(), SqliteValue::Text(status.to_string()));
        row
    }

    fn wm(v: u64) -> Watermark {
        Watermark::from_u64(v)
    }

    fn apply(replica: &mut Replica, v: u64, changes: Vec<Change>) -> ReplicaChange {
        let prev = replica.version().clone();
        let commit = Arc::new(CommitRecord {
            watermark: wm(v),
            changes,
        });
        replica.apply_commit(&commit).unwrap();
        ReplicaChange {
            prev,
            next: replica.version().clone(),
            commit,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        replica: Replica,
        syncer: ViewSyncer,
    }

    fn fixture() -> Fixture {
        fixture_with(Materializations::with_idle(Duration::from_millis(20)))
    }

    fn fixture_with(materializations: Materializations) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        let replica = Replica::open(&path, &specs()).unwrap();
        let syncer = ViewSyncer::new(
            ClientGroupId::new("g1"),
            "0",
            &path,
            table_map(),
            materializations,
        );
        Fixture {
            _dir: dir,
            replica,
            syncer,
        }
    }

    fn all_issues_op(hash: &str) -> DesiredQueryOp {
        DesiredQueryOp::Put {
            hash: QueryHash::new(hash),
            ast: Query::table("issues"),
        }
    }

    async fn drain_poke(rx: &mut mpsc::Receiver<Downstream>) -> (Watermark, Vec<crate::client::PokePart>) {
        let cookie = match rx.recv().await.unwrap() {
            Downstream::PokeStart(start) => start.cookie,
            other => panic!("expected pokeStart, got {other:?}"),
        };
        let mut parts = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                Downstream::PokePart(part) => parts.push(part),
                Downstream::PokeEnd(_) => return (cookie, parts),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn new_desired_query_pokes_rows_desired_and_got() {
        let mut fx = fixture();
        apply(
            &mut fx.replica,
            1,
            vec![Change::Insert {
                table: "issues".to_string(),
                row: issue(1, "first", "open"),
            }],
        );

        let client = ClientId::new("c1");
        let mut rx = fx.syncer.add_client(client.clone(), Watermark::MIN);
        fx.syncer
            .change_desired_queries(&client, vec![all_issues_op("q1")])
            .await
            .unwrap();

        let (cookie, parts) = drain_poke(&mut rx).await;
        assert_eq!(cookie, wm(1));

        let part = &parts[0];
        assert_eq!(part.clients_patch.as_ref().unwrap().len(), 1);
        assert_eq!(
            part.desired_queries_patches.as_ref().unwrap()[&client].len(),
            1
        );
        assert!(matches!(
            part.got_queries_patch.as_ref().unwrap()[0],
            QueriesPatchOp::Put { .. }
        ));
        let entities = part.entities_patch.as_ref().unwrap();
        assert_eq!(entities.len(), 1);
        match &entities[0] {
            EntityPatchOp::Put { key, value } => {
                assert_eq!(key, r#"issues/{"id":1}"#);
                assert_eq!(
                    value.get("title"),
                    Some(&SqliteValue::Text("first".to_string()))
                );
                assert!(value.contains_key(ROW_VERSION_COLUMN));
            }
            other => panic!("expected put, got {other:?}"),
        }
        assert!(fx.syncer.got().contains(&QueryHash::new("q1")));
    }

    #[tokio::test]
    async fn commit_produces_merge_for_changed_rows() {
        let mut fx = fixture();
        apply(
            &mut fx.replica,
            1,
            vec![Change::Insert {
                table: "issues".to_string(),
                row: issue(1, "first", "open"),
            }],
        );
        let client = ClientId::new("c1");
        let mut rx = fx.syncer.add_client(client.clone(), Watermark::MIN);
        fx.syncer
            .change_desired_queries(&client, vec![all_issues_op("q1")])
            .await
            .unwrap();
        let _ = drain_poke(&mut rx).await;

        let change = apply(
            &mut fx.replica,
            2,
            vec![Change::Update {
                table: "issues".to_string(),
                old_key: None,
                row: issue(1, "renamed", "open"),
            }],
        );
        fx.syncer.process_commit(&change).await.unwrap();

        let (cookie, parts) = drain_poke(&mut rx).await;
        assert_eq!(cookie, wm(2));
        let entities = parts[0].entities_patch.as_ref().unwrap();
        assert_eq!(entities.len(), 1);
        match &entities[0] {
            EntityPatchOp::Merge { key, value } => {
                assert_eq!(key, r#"issues/{"id":1}"#);
                assert_eq!(
                    value.get("title"),
                    Some(&SqliteValue::Text("renamed".to_string()))
                );
            }
            other => panic!("expected merge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deleted_rows_produce_del_patches() {
        let mut fx = fixture();
        apply(
            &mut fx.replica,
            1,
            vec![
                Change::Insert {
                    table: "issues".to_string(),
                    row: issue(1, "a", "open"),
                },
                Change::Insert {
                    table: "issues".to_string(),
                    row: issue(2, "b", "open"),
                },
            ],
        );
        let client = ClientId::new("c1");
        let mut rx = fx.syncer.add_client(client.clone(), Watermark::MIN);
        fx.syncer
            .change_desired_queries(&client, vec![all_issues_op("q1")])
            .await
            .unwrap();
        let _ = drain_poke(&mut rx).await;

        let change = apply(
            &mut fx.replica,
            2,
            vec![Change::Delete {
                table: "issues".to_string(),
                key: RowKey::from_parts([("id".to_string(), SqliteValue::Integer(2))]),
            }],
        );
        fx.syncer.process_commit(&change).await.unwrap();

        let (_, parts) = drain_poke(&mut rx).await;
        let entities = parts[0].entities_patch.as_ref().unwrap();
        assert_eq!(
            entities,
            &vec![EntityPatchOp::Del {
                key: r#"issues/{"id":2}"#.to_string()
            }]
        );
        assert!(fx
            .syncer
            .row_record(&RowId {
                table: "issues".to_string(),
                key: r#"{"id":2}"#.to_string()
            })
            .is_none());
    }

    #[tokio::test]
    async fn row_index_tracks_union_of_query_columns() {
        let mut fx = fixture();
        apply(
            &mut fx.replica,
            1,
            vec![Change::Insert {
                table: "issues".to_string(),
                row: issue(1, "a", "open"),
            }],
        );
        let client = ClientId::new("c1");
        let mut rx = fx.syncer.add_client(client.clone(), Watermark::MIN);

        // q_title selects title; q_status selects status.
        let q_title = DesiredQueryOp::Put {
            hash: QueryHash::new("q_title"),
            ast: Query {
                columns: vec!["title".to_string()],
                ..Query::table("issues")
            },
        };
        let q_status = DesiredQueryOp::Put {
            hash: QueryHash::new("q_status"),
            ast: Query {
                columns: vec!["status".to_string()],
                ..Query::table("issues")
            },
        };
        fx.syncer
            .change_desired_queries(&client, vec![q_title, q_status])
            .await
            .unwrap();
        let _ = drain_poke(&mut rx).await;

        let row_id = RowId {
            table: "issues".to_string(),
            key: r#"{"id":1}"#.to_string(),
        };
        let record = fx.syncer.row_record(&row_id).unwrap();
        let title_refs = &record.queried_columns["title"];
        let status_refs = &record.queried_columns["status"];
        assert!(title_refs.contains(&QueryHash::new("q_title")));
        assert!(!title_refs.contains(&QueryHash::new("q_status")));
        assert!(status_refs.contains(&QueryHash::new("q_status")));
        // Keys and version are referenced by both.
        assert_eq!(record.queried_columns["id"].len(), 2);

        // Dropping q_status narrows the row; the client gets a constrain.
        fx.syncer
            .change_desired_queries(
                &client,
                vec![DesiredQueryOp::Del {
                    hash: QueryHash::new("q_status"),
                }],
            )
            .await
            .unwrap();
        let (_, parts) = drain_poke(&mut rx).await;
        let entities = parts[0].entities_patch.as_ref().unwrap();
        match &entities[0] {
            EntityPatchOp::Constrain { key, columns } => {
                assert_eq!(key, r#"issues/{"id":1}"#);
                assert!(columns.contains(&"title".to_string()));
                assert!(!columns.contains(&"status".to_string()));
            }
            other => panic!("expected constrain, got {other:?}"),
        }
        let record = fx.syncer.row_record(&row_id).unwrap();
        assert!(!record.queried_columns.contains_key("status"));
    }

    #[tokio::test]
    async fn unaffected_queries_are_skipped() {
        let mut fx = fixture();
        let client = ClientId::new("c1");
        let mut rx = fx.syncer.add_client(client.clone(), Watermark::MIN);
        // Filtered query: owner-7 issues only (equality conjunction).
        fx.syncer
            .change_desired_queries(
                &client,
                vec![DesiredQueryOp::Put {
                    hash: QueryHash::new("q1"),
                    ast: Query {
                        where_: Some(crate::ast::Condition::Cmp {
                            field: "status".to_string(),
                            op: crate::ast::CmpOp::Eq,
                            value: SqliteValue::Text("open".to_string()),
                        }),
                        ..Query::table("issues")
                    },
                }],
            )
            .await
            .unwrap();
        let _ = drain_poke(&mut rx).await;

        // An insert that provably fails the filter: poke carries no
        // entities (the query was pruned by invalidation info).
        let change = apply(
            &mut fx.replica,
            1,
            vec![Change::Insert {
                table: "issues".to_string(),
                row: issue(9, "closed one", "closed"),
            }],
        );
        fx.syncer.process_commit(&change).await.unwrap();
        let (cookie, parts) = drain_poke(&mut rx).await;
        assert_eq!(cookie, wm(1));
        assert!(parts.is_empty(), "pruned commit pokes only the cookie");

        // A matching insert does reach the client.
        let change = apply(
            &mut fx.replica,
            2,
            vec![Change::Insert {
                table: "issues".to_string(),
                row: issue(10, "open one", "open"),
            }],
        );
        fx.syncer.process_commit(&change).await.unwrap();
        let (_, parts) = drain_poke(&mut rx).await;
        assert_eq!(parts[0].entities_patch.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_query_is_reported_and_others_survive() {
        let mut fx = fixture();
        let client = ClientId::new("c1");
        let mut rx = fx.syncer.add_client(client.clone(), Watermark::MIN);

        fx.syncer
            .change_desired_queries(
                &client,
                vec![
                    DesiredQueryOp::Put {
                        hash: QueryHash::new("bad"),
                        ast: Query::table("nope"),
                    },
                    all_issues_op("good"),
                ],
            )
            .await
            .unwrap();

        // Error frame first, then the poke for the good query.
        match rx.recv().await.unwrap() {
            Downstream::Error(frame) => assert_eq!(frame.kind, "invalidQuery"),
            other => panic!("expected error frame, got {other:?}"),
        }
        let (_, parts) = drain_poke(&mut rx).await;
        let desired = parts[0].desired_queries_patches.as_ref().unwrap();
        assert_eq!(desired[&client].len(), 1, "only the good query is desired");
        assert!(fx.syncer.got().contains(&QueryHash::new("good")));
        assert!(!fx.syncer.got().contains(&QueryHash::new("bad")));
    }

    #[tokio::test(start_paused = true)]
    async fn materializations_are_shared_and_torn_down_after_idle() {
        let materializations = Materializations::with_idle(Duration::from_millis(50));
        let mut fx_a = fixture_with(materializations.clone());
        // Second group over its own replica, same registry.
        let mut fx_b = fixture_with(materializations.clone());

        let ca = ClientId::new("ca");
        let cb = ClientId::new("cb");
        let _rx_a = fx_a.syncer.add_client(ca.clone(), Watermark::MIN);
        let _rx_b = fx_b.syncer.add_client(cb.clone(), Watermark::MIN);

        // Different client-side hashes, identical canonical queries.
        fx_a.syncer
            .change_desired_queries(&ca, vec![all_issues_op("qa")])
            .await
            .unwrap();
        fx_b.syncer
            .change_desired_queries(&cb, vec![all_issues_op("qb")])
            .await
            .unwrap();
        assert_eq!(materializations.len(), 1, "one materialization per hash");

        // Removing one desire leaves the materialization alive.
        fx_a.syncer
            .change_desired_queries(
                &ca,
                vec![DesiredQueryOp::Del {
                    hash: QueryHash::new("qa"),
                }],
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(materializations.len(), 1);

        // Removing the last reference schedules teardown after the idle
        // timer.
        fx_b.syncer
            .change_desired_queries(
                &cb,
                vec![DesiredQueryOp::Del {
                    hash: QueryHash::new("qb"),
                }],
            )
            .await
            .unwrap();
        assert_eq!(materializations.len(), 1, "still alive inside the idle window");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(materializations.is_empty(), "torn down after idle");
    }

    #[tokio::test]
    async fn schema_change_re_materializes_the_group() {
        let mut fx = fixture();
        apply(
            &mut fx.replica,
            1,
            vec![Change::Insert {
                table: "issues".to_string(),
                row: issue(1, "a", "open"),
            }],
        );
        let client = ClientId::new("c1");
        let mut rx = fx.syncer.add_client(client.clone(), Watermark::MIN);
        fx.syncer
            .change_desired_queries(&client, vec![all_issues_op("q1")])
            .await
            .unwrap();
        let _ = drain_poke(&mut rx).await;

        // A column lands upstream; the replica migrates mid-stream.
        let mut wider = specs();
        wider[0].columns.insert(
            "owner".to_string(),
            ColumnSpec {
                data_type: ColumnType::Text,
                not_null: false,
                pos: 3,
            },
        );
        fx.replica.migrate(&wider).unwrap();
        let change = apply(
            &mut fx.replica,
            2,
            vec![Change::Update {
                table: "issues".to_string(),
                old_key: None,
                row: issue(1, "a2", "open"),
            }],
        );

        // The syncer's spec map is stale by design here; what matters is
        // that the hash mismatch forces del-then-put resync patches.
        fx.syncer.process_commit(&change).await.unwrap();
        let (cookie, parts) = drain_poke(&mut rx).await;
        assert_eq!(cookie, wm(2));
        let entities = parts[0].entities_patch.as_ref().unwrap();
        assert!(matches!(entities[0], EntityPatchOp::Del { .. }));
        assert!(entities
            .iter()
            .any(|op| matches!(op, EntityPatchOp::Put { .. })));
    }

    #[tokio::test]
    async fn group_cookie_advances_by_minor_without_commits() {
        let mut fx = fixture();
        let client = ClientId::new("c1");
        let mut rx = fx.syncer.add_client(client.clone(), Watermark::MIN);
        apply(
            &mut fx.replica,
            1,
            vec![Change::Insert {
                table: "issues".to_string(),
                row: issue(1, "a", "open"),
            }],
        );

        fx.syncer
            .change_desired_queries(&client, vec![all_issues_op("q1")])
            .await
            .unwrap();
        let (first, _) = drain_poke(&mut rx).await;
        assert_eq!(first, wm(1));

        // A second desired-change with no upstream commit: minor bump.
        fx.syncer
            .change_desired_queries(&client, vec![all_issues_op("q2")])
            .await
            .unwrap();
        let (second, _) = drain_poke(&mut rx).await;
        assert!(second > first);
        assert_eq!(second.major(), first.as_str());
    }
}
