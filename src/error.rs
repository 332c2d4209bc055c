//! # Error Handling
//!
//! A single [`Error`] enum covers every failure mode in the engine, with a
//! [`Result`] alias used throughout. Variants are grouped by how callers are
//! expected to react:
//!
//! | Category | Variants | Typical response |
//! |----------|----------|------------------|
//! | Protocol | `Protocol`, `UnsafeInteger` | clear connection state, reconnect |
//! | Query | `InvalidQuery` | drop the offending query, keep the rest |
//! | Cached state | `SchemaChange`, `InvalidDiff` | discard and rebuild view state |
//! | Persistent state | `AutoReset`, `DatabaseInit` | supervisor wipes/rebuilds or exits |
//! | Backpressure | `SubscriberBehind` | cancel the subscriber, let it resume |
//! | Ownership | `LeaseLost`, `WatermarkOutOfOrder` | abort the writer |
//! | Internal | `Sqlite`, `Serde`, `Closed`, `Config` | log and propagate |

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in viewsync operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Protocol errors (recovered locally; the client reconnects)
    // =========================================================================
    /// Malformed or out-of-order frame: an orphan `pokePart`/`pokeEnd`, a
    /// base-cookie gap, an unknown pokeID, or an overlapping poke.
    #[error("protocol error: {reason}")]
    Protocol {
        /// What the peer did wrong.
        reason: String,
    },

    /// An outbound value exceeds the safe-integer range of IEEE 754 doubles
    /// and cannot be represented in the client's numeric domain.
    #[error("unsafe integer {value} in outbound poke (exceeds ±(2^53 - 1))")]
    UnsafeInteger {
        /// The offending value.
        value: i64,
    },

    // =========================================================================
    // Query errors (reported to the originating client only)
    // =========================================================================
    /// A query AST references an unknown table or column. The query is
    /// dropped from its client's desired set; other queries are unaffected.
    #[error("invalid query: {reason}")]
    InvalidQuery {
        /// Which reference failed to resolve.
        reason: String,
    },

    // =========================================================================
    // Cached-state errors (nearest owner discards and rebuilds)
    // =========================================================================
    /// A snapshot diff spans a schema change. The caller must discard cached
    /// view state and re-materialize from scratch at the newer version.
    #[error("schema changed between version {prev} and {curr}")]
    SchemaChange {
        /// Version of the older snapshot.
        prev: String,
        /// Version of the newer snapshot.
        curr: String,
    },

    /// Diff iteration was attempted against a snapshot whose replica has
    /// already advanced. The caller must obtain a fresh snapshot pair.
    #[error("invalid diff: snapshot expected version {expected}, replica is at {actual}")]
    InvalidDiff {
        /// The version the caller pinned.
        expected: String,
        /// The version the replica is actually at.
        actual: String,
    },

    // =========================================================================
    // Persistent-state errors (propagate to the supervisor)
    // =========================================================================
    /// The upstream source reports that its position is no longer compatible
    /// with the replica. The supervisor wipes the replica and re-runs
    /// initial sync.
    #[error("auto-reset required: {reason}")]
    AutoReset {
        /// Why the upstream position is unusable.
        reason: String,
    },

    /// The replica file cannot be opened or initialized. Fatal; the process
    /// exits non-zero.
    #[error("database init failed: {reason}")]
    DatabaseInit {
        /// What failed during open/init.
        reason: String,
    },

    // =========================================================================
    // Backpressure
    // =========================================================================
    /// A streamer subscriber exceeded its outbound high-water mark and was
    /// cancelled. Its client reconnects and resumes from its last
    /// acknowledged watermark.
    #[error("subscriber behind: buffered {buffered} commits, cap is {cap}")]
    SubscriberBehind {
        /// Commits buffered at cancellation time.
        buffered: usize,
        /// The configured hard cap.
        cap: usize,
    },

    // =========================================================================
    // Writer ownership
    // =========================================================================
    /// The change-log writer lease was acquired by another owner. This
    /// writer must stop appending immediately.
    #[error("writer lease lost: held '{held}', current owner is '{current}'")]
    LeaseLost {
        /// The token this writer holds.
        held: String,
        /// The token currently persisted.
        current: String,
    },

    /// An append presented a watermark that does not advance the log.
    #[error("watermark '{watermark}' does not advance the log (last is '{last}')")]
    WatermarkOutOfOrder {
        /// The rejected watermark.
        watermark: String,
        /// The log's current last watermark.
        last: String,
    },

    // =========================================================================
    // Internal errors
    // =========================================================================
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON (de)serialization failed.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A channel or component was already shut down.
    #[error("{component} is closed")]
    Closed {
        /// Which component refused the operation.
        component: &'static str,
    },

    /// Configuration is malformed or inconsistent.
    #[error("config error: {reason}")]
    Config {
        /// Which key or combination is invalid.
        reason: String,
    },
}

impl Error {
    /// Shorthand for a [`Error::Protocol`] with a formatted reason.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Error::Protocol {
            reason: reason.into(),
        }
    }

    /// Wire-level error kind, used for the downstream `error` frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Protocol { .. } => "protocol",
            Error::UnsafeInteger { .. } => "unsafeInteger",
            Error::InvalidQuery { .. } => "invalidQuery",
            Error::SchemaChange { .. } => "schemaChange",
            Error::InvalidDiff { .. } => "invalidDiff",
            Error::AutoReset { .. } => "autoReset",
            Error::DatabaseInit { .. } => "databaseInit",
            Error::SubscriberBehind { .. } => "subscriberBehind",
            Error::LeaseLost { .. } => "leaseLost",
            Error::WatermarkOutOfOrder { .. } => "watermarkOutOfOrder",
            Error::Sqlite(_) => "internal",
            Error::Serde(_) => "internal",
            Error::Closed { .. } => "closed",
            Error::Config { .. } => "config",
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages appear in logs and downstream `error` frames; keep
    /// them readable and complete.
    #[test]
    fn test_error_display() {
        let behind = Error::SubscriberBehind {
            buffered: 2048,
            cap: 1024,
        };
        assert_eq!(
            behind.to_string(),
            "subscriber behind: buffered 2048 commits, cap is 1024"
        );

        let gap = Error::WatermarkOutOfOrder {
            watermark: "a5".to_string(),
            last: "a7".to_string(),
        };
        assert_eq!(
            gap.to_string(),
            "watermark 'a5' does not advance the log (last is 'a7')"
        );

        let diff = Error::InvalidDiff {
            expected: "a3".to_string(),
            actual: "a9".to_string(),
        };
        assert!(diff.to_string().contains("expected version a3"));
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();
        assert!(matches!(our_err, Error::Sqlite(_)));
        assert_eq!(our_err.kind(), "internal");
    }

    #[test]
    fn test_wire_kinds() {
        assert_eq!(Error::protocol("orphan pokeEnd").kind(), "protocol");
        assert_eq!(Error::UnsafeInteger { value: 1 << 60 }.kind(), "unsafeInteger");
        assert_eq!(
            Error::AutoReset {
                reason: "slot dropped".to_string()
            }
            .kind(),
            "autoReset"
        );
    }
}
