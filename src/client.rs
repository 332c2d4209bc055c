//! # Client Handler (C7)
//!
//! The per-connected-client outbound side: poke framing, per-patch
//! base-cookie filtering, and the numeric-safety gate.
//!
//! ## Framing
//!
//! ```text
//! pokeStart {pokeID, baseCookie, cookie}
//! pokePart  {pokeID, lastMutationIDChanges?, clientsPatch?,
//!            desiredQueriesPatches?, gotQueriesPatch?, entitiesPatch?}
//! ...
//! pokeEnd   {pokeID}
//! ```
//!
//! All part fields are optional; an empty part is legal on the wire but is
//! elided here. A single server-computed poke serves clients at different
//! baselines because [`Poker::add_patch`] drops any patch whose
//! `to_version` the client has already acknowledged.
//!
//! Outbound integers beyond the safe range of IEEE 754 doubles fail the
//! poke with [`Error::UnsafeInteger`] instead of silently truncating on
//! the client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::ast::Query;
use crate::error::{Error, Result};
use crate::types::{ClientId, QueryHash, Row, SqliteValue, Watermark, MAX_SAFE_INTEGER};

/// Outbound frame queue depth per client.
const OUTBOUND_CAPACITY: usize = 256;

// =============================================================================
// Downstream Frames
// =============================================================================

/// Opens a poke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeStart {
    /// Unique id chaining this poke's frames together.
    pub poke_id: String,
    /// The cookie this poke patches forward from.
    pub base_cookie: Watermark,
    /// The cookie the client holds after applying.
    pub cookie: Watermark,
}

/// A batch of patches within a poke. Every field optional.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokePart {
    /// The open poke this part belongs to.
    pub poke_id: String,
    /// Per-client last-mutation-id advances.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_mutation_id_changes: Option<BTreeMap<String, u64>>,
    /// Client-set membership changes for the group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clients_patch: Option<Vec<ClientsPatchOp>>,
    /// Per-client desired-query changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_queries_patches: Option<BTreeMap<ClientId, Vec<QueriesPatchOp>>>,
    /// Got-set changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub got_queries_patch: Option<Vec<QueriesPatchOp>>,
    /// Row changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities_patch: Option<Vec<EntityPatchOp>>,
}

impl PokePart {
    /// True when no field carries anything.
    pub fn is_empty(&self) -> bool {
        self.last_mutation_id_changes.is_none()
            && self.clients_patch.is_none()
            && self.desired_queries_patches.is_none()
            && self.got_queries_patch.is_none()
            && self.entities_patch.is_none()
    }
}

/// Closes a poke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeEnd {
    /// The poke being closed.
    pub poke_id: String,
}

/// A protocol-level error surfaced to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    /// Machine-readable kind (see `Error::kind`).
    pub kind: String,
    /// Human-readable detail.
    pub message: String,
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Downstream {
    /// Poke open.
    PokeStart(PokeStart),
    /// Poke payload.
    PokePart(PokePart),
    /// Poke close.
    PokeEnd(PokeEnd),
    /// Error.
    Error(ErrorFrame),
}

// =============================================================================
// Patch Ops
// =============================================================================

/// Client-set membership ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ClientsPatchOp {
    /// A client joined the group.
    #[serde(rename_all = "camelCase")]
    Put {
        /// The client.
        client_id: ClientId,
    },
    /// A client left the group.
    #[serde(rename_all = "camelCase")]
    Del {
        /// The client.
        client_id: ClientId,
    },
}

/// Desired/got query-set ops. `ast` travels only on desired puts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum QueriesPatchOp {
    /// A query entered the set.
    #[serde(rename_all = "camelCase")]
    Put {
        /// The query's hash.
        hash: QueryHash,
        /// The AST, when relevant to the receiver.
        #[serde(skip_serializing_if = "Option::is_none")]
        ast: Option<Query>,
    },
    /// A query left the set.
    #[serde(rename_all = "camelCase")]
    Del {
        /// The query's hash.
        hash: QueryHash,
    },
}

/// Row-level ops addressed by entity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum EntityPatchOp {
    /// Full row value (newly referenced, or newly widened column set).
    #[serde(rename_all = "camelCase")]
    Put {
        /// Entity key.
        key: String,
        /// All referenced columns.
        value: Row,
    },
    /// Changed column values for an already-held row.
    #[serde(rename_all = "camelCase")]
    Merge {
        /// Entity key.
        key: String,
        /// Referenced columns at their current values.
        value: Row,
    },
    /// The set of columns still referenced; the client drops the rest.
    #[serde(rename_all = "camelCase")]
    Constrain {
        /// Entity key.
        key: String,
        /// Union of currently-referenced columns.
        columns: Vec<String>,
    },
    /// The row is no longer referenced by any query.
    #[serde(rename_all = "camelCase")]
    Del {
        /// Entity key.
        key: String,
    },
}

// =============================================================================
// Upstream Messages
// =============================================================================

/// Desired-query changes sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum DesiredQueryOp {
    /// Start desiring a query.
    #[serde(rename_all = "camelCase")]
    Put {
        /// Client-assigned query hash.
        hash: QueryHash,
        /// The query.
        ast: Query,
    },
    /// Stop desiring a query.
    #[serde(rename_all = "camelCase")]
    Del {
        /// Client-assigned query hash.
        hash: QueryHash,
    },
}

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Upstream {
    /// Change the sending client's desired-query set.
    #[serde(rename_all = "camelCase")]
    ChangeDesiredQueries {
        /// The ops to apply.
        desired_queries_patch: Vec<DesiredQueryOp>,
    },
    /// Remove clients (e.g. closed tabs) from the group.
    #[serde(rename_all = "camelCase")]
    DeleteClients {
        /// The clients to remove.
        client_ids: Vec<ClientId>,
    },
}

// =============================================================================
// Client Handler
// =============================================================================

/// Per-client outbound handle. One poke may be open at a time; frames for
/// one client are strictly ordered by the bounded queue.
#[derive(Debug)]
pub struct ClientHandler {
    client_id: ClientId,
    base_cookie: Watermark,
    tx: mpsc::Sender<Downstream>,
    poke_open: bool,
}

impl ClientHandler {
    /// Creates a handler and the frame stream the transport consumes.
    pub fn channel(
        client_id: ClientId,
        base_cookie: Watermark,
    ) -> (Self, mpsc::Receiver<Downstream>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        (
            Self {
                client_id,
                base_cookie,
                tx,
                poke_open: false,
            },
            rx,
        )
    }

    /// The client this handler feeds.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The highest cookie delivered to (and tracked for) this client.
    pub fn base_cookie(&self) -> &Watermark {
        &self.base_cookie
    }

    /// Opens a poke to `cookie`. Rejects when an earlier poke has not yet
    /// ended, or when the cookie would move backwards.
    pub async fn start_poke(&mut self, poke_id: impl Into<String>, cookie: Watermark) -> Result<Poker<'_>> {
        if self.poke_open {
            return Err(Error::protocol(format!(
                "poke overlaps an unfinished poke for client {}",
                self.client_id
            )));
        }
        if cookie < self.base_cookie {
            return Err(Error::protocol(format!(
                "poke cookie {cookie} is behind client {} at {}",
                self.client_id, self.base_cookie
            )));
        }
        let poke_id = poke_id.into();
        self.send(Downstream::PokeStart(PokeStart {
            poke_id: poke_id.clone(),
            base_cookie: self.base_cookie.clone(),
            cookie: cookie.clone(),
        }))
        .await?;
        self.poke_open = true;
        Ok(Poker {
            handler: self,
            poke_id,
            cookie,
            part: PokePart::default(),
        })
    }

    /// Sends an error frame.
    pub async fn send_error(&mut self, error: &Error) -> Result<()> {
        self.send(Downstream::Error(ErrorFrame {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }))
        .await
    }

    async fn send(&mut self, frame: Downstream) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| Error::Closed {
            component: "client connection",
        })
    }
}

// =============================================================================
// Poker
// =============================================================================

/// Patch payload kinds accepted by [`Poker::add_patch`].
#[derive(Debug, Clone)]
pub enum PatchData {
    /// Last-mutation-id advances.
    LastMutationIdChanges(BTreeMap<String, u64>),
    /// Client-set changes.
    Clients(Vec<ClientsPatchOp>),
    /// Desired-query changes of one client.
    Desired(ClientId, Vec<QueriesPatchOp>),
    /// Got-set changes.
    Got(Vec<QueriesPatchOp>),
    /// Row changes.
    Entities(Vec<EntityPatchOp>),
}

/// An open poke. Accumulates patches into parts; `end` flushes and
/// advances the client's tracked cookie. A poker dropped without `end`
/// leaves the handler marked mid-poke, so the next start is rejected and
/// the connection layer resets the client.
#[derive(Debug)]
pub struct Poker<'a> {
    handler: &'a mut ClientHandler,
    poke_id: String,
    cookie: Watermark,
    part: PokePart,
}

impl Poker<'_> {
    /// Adds a patch bound for `to_version`. Dropped silently when the
    /// client's base cookie already covers it; failed with
    /// [`Error::UnsafeInteger`] when a value cannot survive the client's
    /// numeric domain.
    pub fn add_patch(&mut self, to_version: &Watermark, patch: PatchData) -> Result<()> {
        if *to_version <= self.handler.base_cookie {
            return Ok(());
        }
        check_safe(&patch)?;
        match patch {
            PatchData::LastMutationIdChanges(changes) => {
                let slot = self.part.last_mutation_id_changes.get_or_insert_with(BTreeMap::new);
                for (client, id) in changes {
                    let entry = slot.entry(client).or_insert(0);
                    *entry = (*entry).max(id);
                }
            }
            PatchData::Clients(ops) => {
                self.part
                    .clients_patch
                    .get_or_insert_with(Vec::new)
                    .extend(ops);
            }
            PatchData::Desired(client_id, ops) => {
                self.part
                    .desired_queries_patches
                    .get_or_insert_with(BTreeMap::new)
                    .entry(client_id)
                    .or_default()
                    .extend(ops);
            }
            PatchData::Got(ops) => {
                self.part
                    .got_queries_patch
                    .get_or_insert_with(Vec::new)
                    .extend(ops);
            }
            PatchData::Entities(ops) => {
                self.part
                    .entities_patch
                    .get_or_insert_with(Vec::new)
                    .extend(ops);
            }
        }
        Ok(())
    }

    /// Flushes the accumulated part as one `pokePart` frame; empty parts
    /// are elided.
    pub async fn flush(&mut self) -> Result<()> {
        if self.part.is_empty() {
            return Ok(());
        }
        let mut part = std::mem::take(&mut self.part);
        part.poke_id = self.poke_id.clone();
        self.handler.send(Downstream::PokePart(part)).await
    }

    /// Ends the poke: flushes, emits `pokeEnd`, and atomically advances
    /// the client's tracked cookie.
    pub async fn end(mut self) -> Result<()> {
        self.flush().await?;
        self.handler
            .send(Downstream::PokeEnd(PokeEnd {
                poke_id: self.poke_id.clone(),
            }))
            .await?;
        self.handler.base_cookie = self.cookie.clone();
        self.handler.poke_open = false;
        Ok(())
    }
}

// =============================================================================
// Safe-Integer Gate
// =============================================================================

fn check_safe(patch: &PatchData) -> Result<()> {
    match patch {
        PatchData::LastMutationIdChanges(changes) => {
            for &id in changes.values() {
                if id > MAX_SAFE_INTEGER as u64 {
                    return Err(Error::UnsafeInteger { value: id as i64 });
                }
            }
        }
        PatchData::Entities(ops) => {
            for op in ops {
                let row = match op {
                    EntityPatchOp::Put { value, .. } | EntityPatchOp::Merge { value, .. } => value,
                    EntityPatchOp::Constrain { .. } | EntityPatchOp::Del { .. } => continue,
                };
                for value in row.values() {
                    if let SqliteValue::Integer(v) = value {
                        if v.abs() > MAX_SAFE_INTEGER {
                            return Err(Error::UnsafeInteger { value: *v });
                        }
                    }
                }
            }
        }
        PatchData::Clients(_) | PatchData::Desired(..) | PatchData::Got(_) => {}
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
