//! # Change Streamer (C2)
//!
//! Owns the single writer lease on the durable change log and fans ordered
//! commits out to any number of subscribers with exactly-once, in-order
//! delivery across reconnects.
//!
//! ## The Catch-Up + Live Pattern
//!
//! ```text
//! Subscriber connects at watermark w
//!        │
//!        ▼
//!  ┌──────────────────────────────┐   ┌────────────────────────────────┐
//!  │     Phase 1: Backfilling     │   │         Phase 2: Live          │
//!  │  batched scans of the log    │──►│  bounded in-memory queue fed   │
//!  │  (w, head] via the streamer  │   │  by the ingest loop            │
//!  └──────────────────────────────┘   └────────────────────────────────┘
//! ```
//!
//! The live queue is registered *before* the first scan, so the two phases
//! overlap rather than gap; the subscriber de-duplicates the overlap by
//! watermark. A subscriber whose requested position is still covered by
//! the in-memory ring of recent commits skips phase 1 entirely.
//!
//! ## Backpressure
//!
//! Each subscriber has its own bounded queue. Crossing the high-water mark
//! marks it lagging; crossing the hard cap either cancels it with
//! [`Error::SubscriberBehind`] or, when `demote_on_overflow` is set, drops
//! its buffered commits and sends it back to backfilling from storage.
//! Either way, other subscribers never block.
//!
//! ## Retry
//!
//! Upstream read failures re-subscribe on a jittered exponential backoff
//! bounded by `min_delay_ms`/`max_delay_ms`. An [`Error::AutoReset`] from
//! the source is not retried: the streamer marks the stored replication
//! config reset-required and exits, leaving the supervisor to wipe and
//! re-run initial sync.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::change_log::ChangeLogStore;
use crate::error::{Error, Result};
use crate::source::ChangeSource;
use crate::types::{Change, CommitRecord, Watermark};

// =============================================================================
// Configuration
// =============================================================================

/// Tuning for the streamer and its subscribers.
#[derive(Clone)]
pub struct StreamerConfig {
    /// Commits kept in the in-memory ring for catch-up without storage.
    pub ring_capacity: usize,
    /// Queue depth at which a subscriber is marked lagging.
    pub high_water: usize,
    /// Queue depth at which the overflow policy fires.
    pub hard_cap: usize,
    /// Overflow policy: demote to backfilling instead of cancelling.
    pub demote_on_overflow: bool,
    /// Maximum concurrent subscribers.
    pub max_connections: usize,
    /// Backoff ladder floor.
    pub min_delay_ms: u64,
    /// Backoff ladder ceiling.
    pub max_delay_ms: u64,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 256,
            high_water: 512,
            hard_cap: 2048,
            demote_on_overflow: false,
            max_connections: 128,
            min_delay_ms: 50,
            max_delay_ms: 10_000,
        }
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Bounded exponential backoff with jitter.
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// A ladder from `min_ms` to `max_ms`.
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min: Duration::from_millis(min_ms.max(1)),
            max: Duration::from_millis(max_ms.max(min_ms.max(1))),
            attempt: 0,
        }
    }

    /// The next delay: `min * 2^attempt`, capped at `max`, with up to 25%
    /// added jitter so restarting writers don't stampede.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.min.saturating_mul(1u32 << self.attempt.min(20));
        let base = exp.min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.0..=0.25);
        base.mul_f64(1.0 + jitter).min(self.max.mul_f64(1.25))
    }

    /// Resets the ladder after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// =============================================================================
// Subscription Hooks
// =============================================================================

/// Merges an incoming commit into the queue's tail entry; returns `true`
/// when merged (the incoming commit is then not enqueued separately).
pub type CoalesceHook =
    Arc<dyn Fn(&mut CommitRecord, &CommitRecord) -> bool + Send + Sync>;

/// Receives a cancelled subscriber's still-buffered commits so the
/// consumer can reclaim resources tied to them.
pub type CleanupHook = Box<dyn FnOnce(Vec<Arc<CommitRecord>>) + Send>;

/// Per-subscription hooks. The default coalesces nothing: change records
/// are never merged, only purely idempotent control state should be.
#[derive(Default)]
pub struct SubscriptionHooks {
    /// Optional queue coalescing.
    pub coalesce: Option<CoalesceHook>,
    /// Optional cancellation cleanup.
    pub cleanup: Option<CleanupHook>,
}

// =============================================================================
// Subscriber plumbing
// =============================================================================

struct SubscriberShared {
    queue: Mutex<VecDeque<Arc<CommitRecord>>>,
    notify: Notify,
    lagging: AtomicBool,
    demoted: AtomicBool,
    closed: AtomicBool,
    error: Mutex<Option<Error>>,
    acked: Mutex<Watermark>,
    cleanup: Mutex<Option<CleanupHook>>,
}

impl SubscriberShared {
    fn new(acked: Watermark, cleanup: Option<CleanupHook>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            lagging: AtomicBool::new(false),
            demoted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            error: Mutex::new(None),
            acked: Mutex::new(acked),
            cleanup: Mutex::new(cleanup),
        }
    }

    fn fail(&self, error: Error) {
        let pending: Vec<Arc<CommitRecord>> = {
            let mut queue = self.queue.lock().unwrap();
            queue.drain(..).collect()
        };
        if let Some(cleanup) = self.cleanup.lock().unwrap().take() {
            cleanup(pending);
        }
        *self.error.lock().unwrap() = Some(error);
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

struct Subscriber {
    shared: Arc<SubscriberShared>,
    coalesce: Option<CoalesceHook>,
}

// =============================================================================
// Commands
// =============================================================================

enum Command {
    Subscribe {
        from: Watermark,
        hooks: SubscriptionHooks,
        resp: oneshot::Sender<Result<ChangeStream>>,
    },
    Scan {
        from: Watermark,
        limit: usize,
        resp: oneshot::Sender<Result<Vec<Arc<CommitRecord>>>>,
    },
    Compact {
        floor: Watermark,
        resp: oneshot::Sender<Result<usize>>,
    },
    Head {
        resp: oneshot::Sender<Watermark>,
    },
    Shutdown,
}

/// Commits fetched per backfill request.
const BACKFILL_BATCH: usize = 128;

// =============================================================================
// Change Streamer
// =============================================================================

/// Handle to the streamer task.
pub struct ChangeStreamer {
    cmd_tx: mpsc::Sender<Command>,
    task: JoinHandle<Result<()>>,
}

impl ChangeStreamer {
    /// Spawns the streamer over an opened store and an upstream source.
    pub fn spawn(
        store: ChangeLogStore,
        source: Box<dyn ChangeSource>,
        config: StreamerConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let ring_base = store.last_watermark().clone();
        let task = StreamerTask {
            store,
            source,
            config,
            cmd_rx,
            ring: VecDeque::new(),
            ring_base,
            subscribers: Vec::new(),
            cmd_tx_for_subscribers: cmd_tx.clone(),
        };
        let task = tokio::spawn(task.run());
        Self { cmd_tx, task }
    }

    /// Subscribes from (exclusive) `from` with default hooks.
    pub async fn subscribe(&self, from: Watermark) -> Result<ChangeStream> {
        self.subscribe_with_hooks(from, SubscriptionHooks::default())
            .await
    }

    /// Subscribes with explicit `coalesce`/`cleanup` hooks.
    pub async fn subscribe_with_hooks(
        &self,
        from: Watermark,
        hooks: SubscriptionHooks,
    ) -> Result<ChangeStream> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe { from, hooks, resp })
            .await
            .map_err(|_| Error::Closed {
                component: "change streamer",
            })?;
        rx.await.map_err(|_| Error::Closed {
            component: "change streamer",
        })?
    }

    /// Compacts the log below `min(floor, every subscriber's ack)`.
    /// `floor` is the oldest position anyone outside the streamer (e.g. a
    /// pinned snapshot) still needs.
    pub async fn compact(&self, floor: Watermark) -> Result<usize> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Compact { floor, resp })
            .await
            .map_err(|_| Error::Closed {
                component: "change streamer",
            })?;
        rx.await.map_err(|_| Error::Closed {
            component: "change streamer",
        })?
    }

    /// The log's head watermark.
    pub async fn head(&self) -> Result<Watermark> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Head { resp })
            .await
            .map_err(|_| Error::Closed {
                component: "change streamer",
            })?;
        rx.await.map_err(|_| Error::Closed {
            component: "change streamer",
        })
    }

    /// Stops the task and returns its final result. An `AutoReset` here
    /// means the supervisor must wipe the replica and re-run initial sync.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        match self.task.await {
            Ok(result) => result,
            Err(_) => Err(Error::Closed {
                component: "change streamer task",
            }),
        }
    }
}

// =============================================================================
// Streamer Task
// =============================================================================

struct StreamerTask {
    store: ChangeLogStore,
    source: Box<dyn ChangeSource>,
    config: StreamerConfig,
    cmd_rx: mpsc::Receiver<Command>,
    /// Most recent commits, oldest first.
    ring: VecDeque<Arc<CommitRecord>>,
    /// Watermark of the last commit evicted from (or never admitted to)
    /// the ring: a subscriber at or past this needs no backfill.
    ring_base: Watermark,
    subscribers: Vec<Subscriber>,
    cmd_tx_for_subscribers: mpsc::Sender<Command>,
}

enum Flow {
    Continue,
    Stop,
}

impl StreamerTask {
    async fn run(mut self) -> Result<()> {
        let result = self.run_inner().await;
        for sub in &self.subscribers {
            sub.shared.close();
        }
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        let mut backoff = Backoff::new(self.config.min_delay_ms, self.config.max_delay_ms);
        'resubscribe: loop {
            let from = self.store.last_watermark().clone();
            let mut subscription = match self.source.subscribe(&from) {
                Ok(sub) => sub,
                Err(err @ Error::AutoReset { .. }) => {
                    let _ = self.store.mark_reset_required();
                    return Err(err);
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(%err, ?delay, "upstream subscribe failed; retrying");
                    if self.idle(delay).await {
                        return Ok(());
                    }
                    continue 'resubscribe;
                }
            };
            info!(from = %from, "streaming from upstream");

            // Row ops of the transaction currently being assembled. A
            // reconnect discards any partial transaction: re-subscription
            // starts over from the last committed watermark.
            let mut pending: Vec<Change> = Vec::new();

            loop {
                tokio::select! {
                    cmd = self.cmd_rx.recv() => {
                        match cmd {
                            None => return Ok(()),
                            Some(cmd) => {
                                if matches!(self.handle_command(cmd), Flow::Stop) {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    item = subscription.recv() => {
                        match item {
                            None => {
                                let delay = backoff.next_delay();
                                warn!(?delay, "upstream feed ended; reconnecting");
                                if self.idle(delay).await {
                                    return Ok(());
                                }
                                continue 'resubscribe;
                            }
                            Some(Err(err @ Error::AutoReset { .. })) => {
                                let _ = self.store.mark_reset_required();
                                return Err(err);
                            }
                            Some(Err(err)) => {
                                let delay = backoff.next_delay();
                                warn!(%err, ?delay, "upstream read failed; reconnecting");
                                if self.idle(delay).await {
                                    return Ok(());
                                }
                                continue 'resubscribe;
                            }
                            Some(Ok(versioned)) => {
                                backoff.reset();
                                self.ingest(versioned.change, &mut pending)?;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Sleeps a backoff delay while still serving commands. Returns `true`
    /// when a shutdown arrived during the wait.
    async fn idle(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None => return true,
                        Some(cmd) => {
                            if matches!(self.handle_command(cmd), Flow::Stop) {
                                return true;
                            }
                        }
                    }
                }
            }
        }
    }

    fn ingest(&mut self, change: Change, pending: &mut Vec<Change>) -> Result<()> {
        match change {
            Change::Begin => {
                pending.clear();
            }
            Change::Commit { watermark } => {
                let changes = std::mem::take(pending);
                self.commit(watermark, changes)?;
            }
            row_op => pending.push(row_op),
        }
        Ok(())
    }

    fn commit(&mut self, watermark: Watermark, changes: Vec<Change>) -> Result<()> {
        if watermark <= *self.store.last_watermark() {
            // An upstream reconnect may replay the commit straddling the
            // resume point; the log already has it.
            debug!(%watermark, "skipping replayed commit");
            return Ok(());
        }
        self.store.append(&watermark, &changes)?;
        let commit = Arc::new(CommitRecord { watermark, changes });

        if self.ring.len() == self.config.ring_capacity {
            if let Some(evicted) = self.ring.pop_front() {
                self.ring_base = evicted.watermark.clone();
            }
        }
        self.ring.push_back(Arc::clone(&commit));

        self.fan_out(&commit);
        Ok(())
    }

    fn fan_out(&mut self, commit: &Arc<CommitRecord>) {
        let high_water = self.config.high_water;
        let hard_cap = self.config.hard_cap;
        let demote = self.config.demote_on_overflow;

        for sub in &mut self.subscribers {
            let shared = &sub.shared;
            if shared.closed.load(Ordering::SeqCst) {
                continue;
            }
            let mut queue = shared.queue.lock().unwrap();

            if let (Some(hook), Some(tail)) = (&sub.coalesce, queue.back_mut()) {
                // Arc::make_mut clones only when a consumer still holds
                // the tail; queued-but-unread entries mutate in place.
                if hook(Arc::make_mut(tail), commit.as_ref()) {
                    drop(queue);
                    shared.notify.notify_waiters();
                    continue;
                }
            }

            queue.push_back(Arc::clone(commit));
            let depth = queue.len();

            if depth > hard_cap {
                if demote {
                    queue.clear();
                    drop(queue);
                    shared.demoted.store(true, Ordering::SeqCst);
                    shared.lagging.store(false, Ordering::SeqCst);
                    debug!("subscriber overflowed; demoted to backfilling");
                    shared.notify.notify_waiters();
                    continue;
                }
                drop(queue);
                warn!(depth, hard_cap, "subscriber overflowed; cancelling");
                shared.fail(Error::SubscriberBehind {
                    buffered: depth,
                    cap: hard_cap,
                });
                continue;
            }

            if depth > high_water && !shared.lagging.swap(true, Ordering::SeqCst) {
                debug!(depth, high_water, "subscriber is lagging");
            } else if depth <= high_water / 2 {
                shared.lagging.store(false, Ordering::SeqCst);
            }
            drop(queue);
            shared.notify.notify_waiters();
        }

        // Consumers hold their own Arc; a closed or failed subscriber can
        // be dropped from the fan-out list immediately.
        self.subscribers
            .retain(|sub| !sub.shared.closed.load(Ordering::SeqCst));
    }

    fn handle_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Subscribe { from, hooks, resp } => {
                let _ = resp.send(self.handle_subscribe(from, hooks));
                Flow::Continue
            }
            Command::Scan { from, limit, resp } => {
                let result = self
                    .store
                    .scan_batch(&from, limit)
                    .map(|commits| commits.into_iter().map(Arc::new).collect());
                let _ = resp.send(result);
                Flow::Continue
            }
            Command::Compact { floor, resp } => {
                let _ = resp.send(self.handle_compact(floor));
                Flow::Continue
            }
            Command::Head { resp } => {
                let _ = resp.send(self.store.last_watermark().clone());
                Flow::Continue
            }
            Command::Shutdown => Flow::Stop,
        }
    }

    fn handle_subscribe(&mut self, from: Watermark, hooks: SubscriptionHooks) -> Result<ChangeStream> {
        self.subscribers
            .retain(|sub| !sub.shared.closed.load(Ordering::SeqCst));
        if self.subscribers.len() >= self.config.max_connections {
            return Err(Error::Config {
                reason: format!(
                    "subscriber limit reached (maxConnections = {})",
                    self.config.max_connections
                ),
            });
        }

        let shared = Arc::new(SubscriberShared::new(from.clone(), hooks.cleanup));

        // Register the live queue before deciding the phase, so nothing
        // committed from here on can be missed.
        let state = if from >= self.ring_base {
            let mut queue = shared.queue.lock().unwrap();
            for commit in &self.ring {
                if commit.watermark > from {
                    queue.push_back(Arc::clone(commit));
                }
            }
            drop(queue);
            StreamState::Live
        } else {
            StreamState::Backfilling
        };
        debug!(
            from = %from,
            backfill = matches!(state, StreamState::Backfilling),
            "subscriber connected"
        );

        self.subscribers.push(Subscriber {
            shared: Arc::clone(&shared),
            coalesce: hooks.coalesce,
        });

        Ok(ChangeStream {
            shared,
            state,
            cursor: from,
            buffer: VecDeque::new(),
            cmd_tx: self.cmd_tx_for_subscribers.clone(),
            error_delivered: false,
        })
    }

    fn handle_compact(&mut self, floor: Watermark) -> Result<usize> {
        let mut cut = floor;
        for sub in &self.subscribers {
            if sub.shared.closed.load(Ordering::SeqCst) {
                continue;
            }
            let acked = sub.shared.acked.lock().unwrap().clone();
            if acked < cut {
                cut = acked;
            }
        }
        self.store.truncate_below(&cut)
    }
}

// =============================================================================
// Change Stream
// =============================================================================

enum StreamState {
    Backfilling,
    Live,
}

/// A subscriber's receiving end: ordered, exactly-once commits from the
/// requested watermark to the head and onward.
pub struct ChangeStream {
    shared: Arc<SubscriberShared>,
    state: StreamState,
    /// Watermark of the last commit yielded; doubles as the ack position
    /// that gates compaction.
    cursor: Watermark,
    buffer: VecDeque<Arc<CommitRecord>>,
    cmd_tx: mpsc::Sender<Command>,
    error_delivered: bool,
}

impl ChangeStream {
    /// The next commit. `Err` is delivered at most once (e.g.
    /// [`Error::SubscriberBehind`]); after that, `Ok(None)`.
    pub async fn next(&mut self) -> Result<Option<Arc<CommitRecord>>> {
        loop {
            if let Some(commit) = self.pop_buffered() {
                return Ok(Some(commit));
            }
            if let Some(err) = self.take_error() {
                return Err(err);
            }
            if self.shared.demoted.swap(false, Ordering::SeqCst) {
                debug!(cursor = %self.cursor, "re-backfilling after overflow demotion");
                self.state = StreamState::Backfilling;
            }

            match self.state {
                StreamState::Backfilling => {
                    let (resp, rx) = oneshot::channel();
                    let sent = self
                        .cmd_tx
                        .send(Command::Scan {
                            from: self.cursor.clone(),
                            limit: BACKFILL_BATCH,
                            resp,
                        })
                        .await;
                    if sent.is_err() {
                        return Ok(None);
                    }
                    let batch = match rx.await {
                        Ok(batch) => batch?,
                        Err(_) => return Ok(None),
                    };
                    if batch.is_empty() {
                        // Caught up to the stored head; the live queue has
                        // been filling since subscribe. The cursor check in
                        // pop_buffered drops the overlap.
                        self.state = StreamState::Live;
                        continue;
                    }
                    self.buffer.extend(batch);
                }
                StreamState::Live => {
                    {
                        let mut queue = self.shared.queue.lock().unwrap();
                        self.buffer.extend(queue.drain(..));
                    }
                    if !self.buffer.is_empty() {
                        continue;
                    }
                    if self.shared.closed.load(Ordering::SeqCst) {
                        if let Some(err) = self.take_error() {
                            return Err(err);
                        }
                        return Ok(None);
                    }
                    let notified = self.shared.notify.notified();
                    // Re-check after arming the waiter: a push between the
                    // drain above and here must not be slept through.
                    if self.shared.queue.lock().unwrap().is_empty()
                        && !self.shared.closed.load(Ordering::SeqCst)
                        && !self.shared.demoted.load(Ordering::SeqCst)
                    {
                        notified.await;
                    }
                }
            }
        }
    }

    fn pop_buffered(&mut self) -> Option<Arc<CommitRecord>> {
        while let Some(commit) = self.buffer.pop_front() {
            // Exactly-once: drop anything at or below the cursor (the
            // backfill/live overlap, or replays after a reconnect).
            if commit.watermark <= self.cursor {
                continue;
            }
            self.cursor = commit.watermark.clone();
            *self.shared.acked.lock().unwrap() = commit.watermark.clone();
            return Some(commit);
        }
        None
    }

    fn take_error(&mut self) -> Option<Error> {
        if self.error_delivered {
            return None;
        }
        let err = self.shared.error.lock().unwrap().take();
        if err.is_some() {
            self.error_delivered = true;
        }
        err
    }

    /// True while the streamer considers this subscriber slow.
    pub fn is_lagging(&self) -> bool {
        self.shared.lagging.load(Ordering::SeqCst)
    }

    /// Watermark of the last commit yielded.
    pub fn position(&self) -> &Watermark {
        &self.cursor
    }

    /// Cancels the subscription; buffered commits go to the cleanup hook.
    pub fn cancel(self) {
        self.shared.fail(Error::Closed {
            component: "subscription",
        });
        self.shared.close();
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.shared.close();
    }
}

// =============================================================================
// Tests
// =============================================================================
