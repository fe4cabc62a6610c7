//! Closed error taxonomy shared by every module in this crate.
//!
//! Modeled as tagged variants rather than an inheritance hierarchy, per
//! the propagation policy: write-path failures roll back their enclosing
//! transaction, apply-path failures abort only the offending entry (except
//! [`Error::ClockDrift`], which also aborts the current sync round).

use thiserror::Error;

/// Errors produced by any operation in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// An operation requiring the HLC was invoked before `init`.
    #[error("clock not initialized")]
    ClockNotInitialized,

    /// Local or remote physical time differs from the system clock by more
    /// than the configured drift budget.
    #[error("clock drift exceeds budget: {detail}")]
    ClockDrift { detail: String },

    /// The logical counter would exceed `max_counter` within one millisecond.
    #[error("HLC counter overflow")]
    CounterOverflow,

    /// A remote entry or timestamp carried the local node id.
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    /// An `OpLogEntry` failed structural or semantic validation.
    #[error("invalid oplog entry: {0}")]
    InvalidEntry(String),

    /// The target record store uses a nested key path or autoincrement.
    #[error("unsupported record store: {0}")]
    UnsupportedStore(String),

    /// The host database aborted the combined write+oplog transaction.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// A loaded or received Merkle snapshot failed validation.
    #[error("invalid merkle snapshot: {0}")]
    InvalidMerkle(String),

    /// An error surfaced by a transport plugin, passed through opaquely.
    #[error("transport error: {0}")]
    TransportError(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
