//! # viewsync - Realtime Relational View Synchronization
//!
//! viewsync is the view-synchronization core of a realtime relational sync
//! engine. Browser clients subscribe to parameterized queries over a
//! shared dataset; whenever rows satisfying any live query change
//! upstream, the engine streams a minimal, ordered set of row deltas to
//! exactly the clients that need them, preserving each client's causal
//! position in the change history.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                     Upstream CDC feed (source)                    │
//! └───────────────────────────────┬───────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Change Streamer (streamer)  ──────►  ChangeLog store (change_log)│
//! │  writer lease · commit ring · catch-up/live subscribers           │
//! └───────────────────────────────┬───────────────────────────────────┘
//!                                 │ ordered, exactly-once commits
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Replicator (replicator) ──► SQLite replica + cross-table         │
//! │  ChangeLog · _0_version per row · Snapshotter (snapshotter) diffs │
//! └───────────────────────────────┬───────────────────────────────────┘
//!                                 │ applied-commit broadcast
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  View Syncer per client group (view_syncer)                       │
//! │  desired/got sets · shared materializations (transform) ·         │
//! │  row index diffing ──► pokes via Client Handlers (client)         │
//! └───────────────────────────────┬───────────────────────────────────┘
//!                                 │ pokeStart / pokePart / pokeEnd
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Client Poke Handler (poke): assemble · merge · apply on tick     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. Every client observes a strictly monotonic version stream.
//! 2. No client receives a patch whose base it has not acknowledged.
//! 3. Every row visible to a client's desired queries converges to the
//!    authoritative replica.
//! 4. No committed upstream change is lost across restarts.

/// Error types for all failure modes.
pub mod error;

/// Domain types: watermarks, changes, rows, row identities, table specs.
pub mod types;

/// SQLite DDL and store initialization.
pub mod schema;

/// Recognized configuration keys and defaults.
pub mod config;

/// The durable, watermark-keyed change log with its writer lease.
pub mod change_log;

/// Upstream change-source adapters.
pub mod source;

/// The change streamer: fan-out with backpressure and catch-up.
pub mod streamer;

/// The replicator: commits onto the local replica.
pub mod replicator;

/// Pinned snapshot pairs and version-ordered diffs.
pub mod snapshotter;

/// The tagged-variant query AST.
pub mod ast;

/// Query canonicalization, hashing, invalidation, and execution.
pub mod transform;

/// Per-group view synchronization.
pub mod view_syncer;

/// Per-client poke framing.
pub mod client;

/// Client-side poke assembly, merging, and tick-aligned apply.
pub mod poke;

/// Pipeline wiring and supervision.
pub mod engine;

pub use config::Config;
pub use engine::{Engine, Pipeline};
pub use error::{Error, Result};
pub use types::Watermark;
