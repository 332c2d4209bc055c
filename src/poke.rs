//! # Client Poke Handler (C8)
//!
//! The receiving side of the poke protocol: assembles `pokeStart` /
//! `pokePart` / `pokeEnd` frames into whole pokes, merges pokes that
//! accumulate between display ticks, and applies them atomically on the
//! next tick.
//!
//! ## State machine
//!
//! ```text
//!            pokeStart                pokeEnd
//!   idle ───────────────► assembling ─────────► pending (FIFO)
//!    ▲                                              │ tick
//!    │            orphan frame / cookie gap /       ▼
//!    └── reset ◄── apply failure: onPokeError,   applying
//!                  clear all state                   │
//!                                                    ▼
//!                                               downstream applier
//! ```
//!
//! Merging is pure ([`merge_pokes`]) and associative: base cookies must
//! chain, `lastMutationIDChanges` merge by per-client max, and patches
//! concatenate in order after being rewritten into namespaced keys
//! (`c/<id>`, `d/<clientID>/<hash>`, `g/<hash>`, `e/<key>`), giving the
//! downstream applier one flat, order-preserving sequence to replay.
//!
//! Any protocol violation fires the error hook, clears all poke state,
//! and leaves the handler dropping complete pokes until the connection
//! layer reconnects ([`PokeHandler::handle_disconnect`] resets it).

use std::collections::BTreeMap;

use serde_json::json;

use crate::client::{
    ClientsPatchOp, Downstream, EntityPatchOp, PokeEnd, PokePart, PokeStart, QueriesPatchOp,
};
use crate::error::{Error, Result};
use crate::types::Watermark;

// =============================================================================
// Poke
// =============================================================================

/// One fully-assembled server poke.
#[derive(Debug, Clone, PartialEq)]
pub struct Poke {
    /// The poke's id.
    pub poke_id: String,
    /// Cookie this poke patches forward from.
    pub base_cookie: Watermark,
    /// Cookie the client holds after applying.
    pub cookie: Watermark,
    /// The parts, in arrival order.
    pub parts: Vec<PokePart>,
}

/// One namespaced, order-preserving patch operation.
#[derive(Debug, Clone, PartialEq)]
pub enum MergedOp {
    /// Full value for a key.
    Put {
        /// Namespaced key.
        key: String,
        /// The value.
        value: serde_json::Value,
    },
    /// Partial value for an existing key.
    Merge {
        /// Namespaced key.
        key: String,
        /// The changed fields.
        value: serde_json::Value,
    },
    /// Restrict a key's value to these fields.
    Constrain {
        /// Namespaced key.
        key: String,
        /// Fields to keep.
        columns: Vec<String>,
    },
    /// Remove a key.
    Del {
        /// Namespaced key.
        key: String,
    },
}

/// The result of merging one or more pokes: what the downstream applier
/// receives, atomically, on a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedPoke {
    /// Base cookie of the first poke.
    pub base_cookie: Watermark,
    /// Cookie of the last poke.
    pub cookie: Watermark,
    /// Per-client max of all mutation-id changes.
    pub last_mutation_id_changes: BTreeMap<String, u64>,
    /// Namespaced patches, within-poke then cross-poke order preserved.
    pub patch: Vec<MergedOp>,
}

// =============================================================================
// Merge
// =============================================================================

/// Merges consecutive pokes into one applier payload.
///
/// Returns `None` for an empty list. Base cookies must chain
/// (`P2.base == P1.cookie`); a gap is a fatal merge error. Duplicate keys
/// are not de-duplicated: applying `put` then `put` to the same key is
/// idempotent-by-last-write at the receiver. The merge is associative.
pub fn merge_pokes(pokes: &[Poke]) -> Result<Option<MergedPoke>> {
    let Some(first) = pokes.first() else {
        return Ok(None);
    };

    let mut merged = MergedPoke {
        base_cookie: first.base_cookie.clone(),
        cookie: first.cookie.clone(),
        last_mutation_id_changes: BTreeMap::new(),
        patch: Vec::new(),
    };
    let mut expected_base = first.base_cookie.clone();

    for poke in pokes {
        if poke.base_cookie != expected_base {
            return Err(Error::protocol(format!(
                "poke {} has base cookie '{}', expected '{}'",
                poke.poke_id, poke.base_cookie, expected_base
            )));
        }
        for part in &poke.parts {
            if let Some(changes) = &part.last_mutation_id_changes {
                for (client, &id) in changes {
                    let entry = merged
                        .last_mutation_id_changes
                        .entry(client.clone())
                        .or_insert(0);
                    *entry = (*entry).max(id);
                }
            }
            flatten_part(part, &mut merged.patch);
        }
        merged.cookie = poke.cookie.clone();
        expected_base = poke.cookie.clone();
    }
    Ok(Some(merged))
}

/// Rewrites one part's patches into the flat namespaced sequence.
fn flatten_part(part: &PokePart, out: &mut Vec<MergedOp>) {
    if let Some(ops) = &part.clients_patch {
        for op in ops {
            match op {
                ClientsPatchOp::Put { client_id } => out.push(MergedOp::Put {
                    key: format!("c/{client_id}"),
                    value: json!(true),
                }),
                ClientsPatchOp::Del { client_id } => out.push(MergedOp::Del {
                    key: format!("c/{client_id}"),
                }),
            }
        }
    }
    if let Some(patches) = &part.desired_queries_patches {
        for (client_id, ops) in patches {
            for op in ops {
                match op {
                    QueriesPatchOp::Put { hash, ast } => out.push(MergedOp::Put {
                        key: format!("d/{client_id}/{hash}"),
                        value: ast
                            .as_ref()
                            .and_then(|a| serde_json::to_value(a).ok())
                            .unwrap_or(json!(true)),
                    }),
                    QueriesPatchOp::Del { hash } => out.push(MergedOp::Del {
                        key: format!("d/{client_id}/{hash}"),
                    }),
                }
            }
        }
    }
    if let Some(ops) = &part.got_queries_patch {
        for op in ops {
            match op {
                QueriesPatchOp::Put { hash, .. } => out.push(MergedOp::Put {
                    key: format!("g/{hash}"),
                    value: json!(true),
                }),
                QueriesPatchOp::Del { hash } => out.push(MergedOp::Del {
                    key: format!("g/{hash}"),
                }),
            }
        }
    }
    if let Some(ops) = &part.entities_patch {
        for op in ops {
            match op {
                EntityPatchOp::Put { key, value } => out.push(MergedOp::Put {
                    key: format!("e/{key}"),
                    value: serde_json::to_value(value).unwrap_or(json!(null)),
                }),
                EntityPatchOp::Merge { key, value } => out.push(MergedOp::Merge {
                    key: format!("e/{key}"),
                    value: serde_json::to_value(value).unwrap_or(json!(null)),
                }),
                EntityPatchOp::Constrain { key, columns } => out.push(MergedOp::Constrain {
                    key: format!("e/{key}"),
                    columns: columns.clone(),
                }),
                EntityPatchOp::Del { key } => out.push(MergedOp::Del {
                    key: format!("e/{key}"),
                }),
            }
        }
    }
}

// =============================================================================
// Poke Handler
// =============================================================================

struct OpenPoke {
    poke_id: String,
    base_cookie: Watermark,
    cookie: Watermark,
    parts: Vec<PokePart>,
}

/// Assembles frames into pokes and hands merged pokes to the applier on
/// tick boundaries. Single-threaded by design, synchronized with whatever
/// tick source drives [`PokeHandler::start_apply`].
pub struct PokeHandler {
    open: Option<OpenPoke>,
    pending: Vec<Poke>,
    /// Cookie of the most recent completed poke; the next start must
    /// chain from it.
    last_cookie: Option<Watermark>,
    applying: bool,
    /// Set after an error: complete pokes are dropped until reconnect.
    poisoned: bool,
    /// Poke id being silently dropped while poisoned, so its parts and
    /// end are not misread as orphans.
    ignoring: Option<String>,
    on_error: Box<dyn FnMut(Error) + Send>,
}

impl PokeHandler {
    /// A handler with an error hook; the hook's firing should make the
    /// connection layer reconnect.
    pub fn new(on_error: impl FnMut(Error) + Send + 'static) -> Self {
        Self {
            open: None,
            pending: Vec::new(),
            last_cookie: None,
            applying: false,
            poisoned: false,
            ignoring: None,
            on_error: Box::new(on_error),
        }
    }

    /// True while a started poke has not yet ended.
    pub fn mid_poke(&self) -> bool {
        self.open.is_some()
    }

    /// Completed pokes waiting for the next tick.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// True after an unrecovered error.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Dispatches one downstream frame.
    pub fn handle_frame(&mut self, frame: Downstream) {
        match frame {
            Downstream::PokeStart(start) => self.handle_poke_start(start),
            Downstream::PokePart(part) => self.handle_poke_part(part),
            Downstream::PokeEnd(end) => self.handle_poke_end(end),
            Downstream::Error(err) => {
                self.fail(Error::protocol(format!("{}: {}", err.kind, err.message)));
            }
        }
    }

    /// Opens a poke. The base cookie must equal the previous completed
    /// poke's cookie; a gap is fatal.
    pub fn handle_poke_start(&mut self, start: PokeStart) {
        if self.poisoned {
            self.ignoring = Some(start.poke_id);
            return;
        }
        if let Some(open) = &self.open {
            let reason = format!(
                "pokeStart '{}' while poke '{}' is still open",
                start.poke_id, open.poke_id
            );
            self.fail(Error::protocol(reason));
            return;
        }
        if let Some(last) = &self.last_cookie {
            if start.base_cookie != *last {
                let reason = format!(
                    "pokeStart '{}' has base cookie '{}', client is at '{}'",
                    start.poke_id, start.base_cookie, last
                );
                self.fail(Error::protocol(reason));
                return;
            }
        }
        self.open = Some(OpenPoke {
            poke_id: start.poke_id,
            base_cookie: start.base_cookie,
            cookie: start.cookie,
            parts: Vec::new(),
        });
    }

    /// Appends a part to the open poke. A part with no matching open
    /// `pokeStart` fires the error hook, once per orphan frame.
    pub fn handle_poke_part(&mut self, part: PokePart) {
        if self.ignoring.as_deref() == Some(part.poke_id.as_str()) {
            return;
        }
        match &mut self.open {
            Some(open) if open.poke_id == part.poke_id => open.parts.push(part),
            _ => {
                let reason = format!("pokePart '{}' with no matching pokeStart", part.poke_id);
                self.fail(Error::protocol(reason));
            }
        }
    }

    /// Closes the open poke, queueing it for the next tick.
    pub fn handle_poke_end(&mut self, end: PokeEnd) {
        if self.ignoring.as_deref() == Some(end.poke_id.as_str()) {
            self.ignoring = None;
            return;
        }
        match self.open.take() {
            Some(open) if open.poke_id == end.poke_id => {
                self.last_cookie = Some(open.cookie.clone());
                self.pending.push(Poke {
                    poke_id: open.poke_id,
                    base_cookie: open.base_cookie,
                    cookie: open.cookie,
                    parts: open.parts,
                });
            }
            other => {
                self.open = other;
                let reason = format!("pokeEnd '{}' with no matching pokeStart", end.poke_id);
                self.fail(Error::protocol(reason));
            }
        }
    }

    /// Clears all poke state. Scheduled applies become no-ops; the
    /// handler is ready for a fresh connection.
    pub fn handle_disconnect(&mut self) {
        self.open = None;
        self.pending.clear();
        self.last_cookie = None;
        self.applying = false;
        self.poisoned = false;
        self.ignoring = None;
    }

    // =========================================================================
    // Apply Scheduling
    // =========================================================================

    /// Called on a tick: merges everything pending into one payload and
    /// marks the apply in flight. `None` when there is nothing to do or
    /// an apply is already running.
    pub fn start_apply(&mut self) -> Option<MergedPoke> {
        if self.applying || self.pending.is_empty() {
            return None;
        }
        let pending = std::mem::take(&mut self.pending);
        match merge_pokes(&pending) {
            Ok(merged) => {
                self.applying = merged.is_some();
                merged
            }
            Err(err) => {
                self.fail(err);
                None
            }
        }
    }

    /// Completes an apply started by [`PokeHandler::start_apply`]. A
    /// downstream failure fires the error hook and clears every pending
    /// poke, so the next tick makes no applier call.
    pub fn finish_apply(&mut self, result: Result<()>) {
        self.applying = false;
        if let Err(err) = result {
            self.fail(err);
        }
    }

    /// One synchronous tick: merge, apply, complete. Returns `true` when
    /// the applier ran successfully.
    pub fn tick<F>(&mut self, apply: F) -> bool
    where
        F: FnOnce(&mut Self, &MergedPoke) -> Result<()>,
    {
        let Some(merged) = self.start_apply() else {
            return false;
        };
        let result = apply(self, &merged);
        let ok = result.is_ok();
        self.finish_apply(result);
        ok
    }

    fn fail(&mut self, err: Error) {
        (self.on_error)(err);
        self.open = None;
        self.pending.clear();
        self.poisoned = true;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Row;
    use crate::types::SqliteValue;
    use std::sync::{Arc, Mutex};

    fn wm(v: u64) -> Watermark {
        Watermark::from_u64(v)
    }

    fn entity_part(poke_id: &str, entries: &[(&str, &str)]) -> PokePart {
        let ops = entries
            .iter()
            .map(|(key, title)| {
                let mut row = Row::new();
                row.insert(
                    "title".to_string(),
                    SqliteValue::Text(title.to_string()),
                );
                EntityPatchOp::Put {
                    key: key.to_string(),
                    value: row,
                }
            })
            .collect();
        PokePart {
            poke_id: poke_id.to_string(),
            entities_patch: Some(ops),
            ..PokePart::default()
        }
    }

    fn poke(id: &str, base: u64, cookie: u64, parts: Vec<PokePart>) -> Poke {
        Poke {
            poke_id: id.to_string(),
            base_cookie: wm(base),
            cookie: wm(cookie),
            parts,
        }
    }

    #[test]
    fn empty_merge_is_none() {
        assert!(merge_pokes(&[]).unwrap().is_none());
    }

    #[test]
    fn merge_chains_cookies_and_concatenates_patches() {
        let p1 = poke(
            "p1",
            1,
            2,
            vec![entity_part("p1", &[("foo", "foo1"), ("foo", "foo2"), ("bar", "bar1")])],
        );
        let p2 = poke("p2", 2, 3, vec![entity_part("p2", &[("baz", "baz1"), ("bar", "bar2")])]);

        let merged = merge_pokes(&[p1, p2]).unwrap().unwrap();
        assert_eq!(merged.base_cookie, wm(1));
        assert_eq!(merged.cookie, wm(3));
        let keys: Vec<&str> = merged
            .patch
            .iter()
            .map(|op| match op {
                MergedOp::Put { key, .. } => key.as_str(),
                other => panic!("unexpected op {other:?}"),
            })
            .collect();
        // No dedup: order preserved within and across pokes.
        assert_eq!(keys, vec!["e/foo", "e/foo", "e/bar", "e/baz", "e/bar"]);
    }

    #[test]
    fn merge_takes_per_client_max_of_mutation_ids() {
        let part1 = PokePart {
            poke_id: "p1".to_string(),
            last_mutation_id_changes: Some(BTreeMap::from([
                ("c1".to_string(), 3),
                ("c2".to_string(), 7),
            ])),
            ..PokePart::default()
        };
        let part2 = PokePart {
            poke_id: "p2".to_string(),
            last_mutation_id_changes: Some(BTreeMap::from([
                ("c1".to_string(), 5),
                ("c2".to_string(), 6),
            ])),
            ..PokePart::default()
        };
        let merged = merge_pokes(&[poke("p1", 1, 2, vec![part1]), poke("p2", 2, 3, vec![part2])])
            .unwrap()
            .unwrap();
        assert_eq!(merged.last_mutation_id_changes["c1"], 5);
        assert_eq!(merged.last_mutation_id_changes["c2"], 7);
    }

    #[test]
    fn merge_is_associative() {
        let a = poke("a", 1, 2, vec![entity_part("a", &[("x", "x1")])]);
        let b = poke("b", 2, 3, vec![entity_part("b", &[("y", "y1"), ("x", "x2")])]);
        let c = poke("c", 3, 4, vec![entity_part("c", &[("z", "z1")])]);

        let whole = merge_pokes(&[a.clone(), b.clone(), c.clone()]).unwrap().unwrap();

        // Left grouping: (a ++ b) ++ c.
        let ab = merge_pokes(&[a.clone(), b.clone()]).unwrap().unwrap();
        let just_c = merge_pokes(std::slice::from_ref(&c)).unwrap().unwrap();
        let mut left_patch = ab.patch.clone();
        left_patch.extend(just_c.patch.clone());

        // Right grouping: a ++ (b ++ c).
        let just_a = merge_pokes(std::slice::from_ref(&a)).unwrap().unwrap();
        let bc = merge_pokes(&[b, c]).unwrap().unwrap();
        let mut right_patch = just_a.patch.clone();
        right_patch.extend(bc.patch.clone());

        assert_eq!(whole.patch, left_patch);
        assert_eq!(whole.patch, right_patch);
        assert_eq!(whole.base_cookie, ab.base_cookie);
        assert_eq!(whole.cookie, bc.cookie);
    }

    #[test]
    fn cookie_gap_is_a_merge_error() {
        let p1 = poke("p1", 1, 2, vec![]);
        let p2 = poke("p2", 3, 4, vec![]);
        let err = merge_pokes(&[p1, p2]).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    fn counting_handler() -> (PokeHandler, Arc<Mutex<Vec<String>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let handler = PokeHandler::new(move |err| {
            sink.lock().unwrap().push(err.to_string());
        });
        (handler, errors)
    }

    #[test]
    fn orphan_part_fires_error_once_per_frame() {
        let (mut handler, errors) = counting_handler();
        handler.handle_poke_part(PokePart {
            poke_id: "ghost".to_string(),
            ..PokePart::default()
        });
        assert_eq!(errors.lock().unwrap().len(), 1);
        handler.handle_poke_end(PokeEnd {
            poke_id: "ghost".to_string(),
        });
        assert_eq!(errors.lock().unwrap().len(), 2);
        assert!(handler.is_poisoned());
    }

    #[test]
    fn poisoned_handler_drops_complete_pokes_silently() {
        let (mut handler, errors) = counting_handler();
        handler.handle_poke_part(PokePart {
            poke_id: "ghost".to_string(),
            ..PokePart::default()
        });
        assert_eq!(errors.lock().unwrap().len(), 1);

        // A complete poke arrives before the reconnect: dropped, no new
        // errors, nothing pending.
        handler.handle_poke_start(PokeStart {
            poke_id: "p1".to_string(),
            base_cookie: wm(1),
            cookie: wm(2),
        });
        handler.handle_poke_part(entity_part("p1", &[("foo", "foo1")]));
        handler.handle_poke_end(PokeEnd {
            poke_id: "p1".to_string(),
        });
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(handler.pending_count(), 0);
        assert!(handler.start_apply().is_none());

        // Reconnect resets the handler.
        handler.handle_disconnect();
        assert!(!handler.is_poisoned());
    }

    #[test]
    fn disconnect_discards_pending_without_applying() {
        let (mut handler, _errors) = counting_handler();
        handler.handle_poke_start(PokeStart {
            poke_id: "p1".to_string(),
            base_cookie: wm(1),
            cookie: wm(2),
        });
        handler.handle_poke_end(PokeEnd {
            poke_id: "p1".to_string(),
        });
        assert_eq!(handler.pending_count(), 1);

        handler.handle_disconnect();
        let applied = handler.tick(|_, _| panic!("applier must not run"));
        assert!(!applied);
    }

    #[test]
    fn base_cookie_must_chain_across_pokes() {
        let (mut handler, errors) = counting_handler();
        handler.handle_poke_start(PokeStart {
            poke_id: "p1".to_string(),
            base_cookie: wm(1),
            cookie: wm(2),
        });
        handler.handle_poke_end(PokeEnd {
            poke_id: "p1".to_string(),
        });

        handler.handle_poke_start(PokeStart {
            poke_id: "p2".to_string(),
            base_cookie: wm(3), // gap: client is at 2
            cookie: wm(4),
        });
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(handler.pending_count(), 0, "all pending pokes cleared");
    }
}
