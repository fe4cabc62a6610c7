//! Client-side, offline-first data sync core.
//!
//! Every write is intercepted at the record store boundary
//! ([`store::RecordStoreAdapter`]) and appended to an oplog
//! ([`oplog::OplogStore`]) tagged with a Hybrid Logical Clock
//! ([`hlc::ClockService`]). A ternary Merkle tree over each entry's physical
//! time ([`merkle::MerkleTree`]) lets a [`sync::SyncDriver`] find where two
//! clients' histories diverge without transferring the whole oplog, and an
//! [`apply::ApplyEngine`] merges what comes back under last-writer-wins.
//!
//! The host supplies the actual storage and network layers by implementing
//! [`store::KeyValueStore`] and [`transport::Transport`]; this crate owns
//! only the clock, the oplog, the Merkle tree, and the algorithms that tie
//! them together.

pub mod apply;
pub mod config;
pub mod error;
pub mod hlc;
pub mod merkle;
pub mod oplog;
pub mod settings;
pub mod store;
pub mod sync;
pub mod transport;

pub use error::{Error, Result};
pub use hlc::{ClockService, Hlc};
pub use settings::Settings;
pub use sync::{SyncDriver, TransportRoundOutcome};
