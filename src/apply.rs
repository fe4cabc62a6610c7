//! Apply engine: merges a single candidate [`OpLogEntry`] — whether freshly
//! ticked locally or received from a transport — into local state under LWW
//! semantics, and keeps the oplog, record store, and Merkle tree consistent.

use std::sync::{Arc, Mutex as StdMutex};

use crate::error::{Error, Result};
use crate::hlc::{ClockService, Hlc};
use crate::merkle::MerkleTree;
use crate::oplog::{OpLogEntry, OplogStore};
use crate::store::{record_from_key_and_prop, KeyPath, KeyValueStore, ObjectKey, StoreSchema};

use std::collections::HashMap;
use std::str::FromStr;

/// What happened to a candidate entry once it reached the apply engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The candidate won LWW and was merged into the record store.
    Applied,
    /// A more recent entry already existed for this field; the candidate
    /// was still persisted to the oplog (so future Merkle comparisons
    /// converge) but the record store was left untouched.
    Superseded,
}

/// Validates, orders, and merges oplog entries into the local record store.
///
/// Owns the same clock, oplog, and Merkle tree handles as the
/// [`crate::store::RecordStoreAdapter`] that intercepts local writes, so the
/// two paths converge on one consistent state.
pub struct ApplyEngine<S: KeyValueStore> {
    store: S,
    clock: Arc<ClockService>,
    oplog: Arc<OplogStore<S>>,
    merkle: Arc<StdMutex<MerkleTree>>,
    schemas: HashMap<String, StoreSchema>,
}

impl<S: KeyValueStore> ApplyEngine<S> {
    pub fn new(
        store: S,
        clock: Arc<ClockService>,
        oplog: Arc<OplogStore<S>>,
        merkle: Arc<StdMutex<MerkleTree>>,
    ) -> Self {
        ApplyEngine {
            store,
            clock,
            oplog,
            merkle,
            schemas: HashMap::new(),
        }
    }

    pub fn register_store(&mut self, name: impl Into<String>, schema: StoreSchema) {
        self.schemas.insert(name.into(), schema);
    }

    fn validate(&self, candidate: &OpLogEntry) -> Result<Hlc> {
        let hlc = Hlc::from_str(&candidate.hlc_time)
            .map_err(|_| Error::InvalidEntry(format!("unparseable hlc_time '{}'", candidate.hlc_time)))?;

        let schema = self
            .schemas
            .get(&candidate.store)
            .ok_or_else(|| Error::UnsupportedStore(format!("unknown store '{}'", candidate.store)))?;

        let expected_arity = match &schema.key_path {
            KeyPath::None => candidate.object_key.arity(),
            KeyPath::Single(_) => 1,
            KeyPath::Composite(props) => props.len(),
            KeyPath::AutoIncrement => {
                return Err(Error::UnsupportedStore(format!(
                    "store '{}' uses autoincrementing keys",
                    candidate.store
                )))
            }
        };
        if candidate.object_key.arity() != expected_arity {
            return Err(Error::InvalidEntry(format!(
                "object_key arity {} does not match store '{}' key-path arity {}",
                candidate.object_key.arity(),
                candidate.store,
                expected_arity
            )));
        }
        Ok(hlc)
    }

    /// Runs the §4.6 algorithm for one candidate entry.
    pub async fn apply(&self, candidate: OpLogEntry) -> Result<ApplyOutcome> {
        let candidate_hlc = self.validate(&candidate)?;

        let current = self.clock.time()?;
        if candidate_hlc > current {
            self.clock.tick_past(&candidate_hlc)?;
        }

        let existing_entry = self
            .oplog
            .most_recent_entry(&candidate.store, &candidate.object_key, &candidate.prop)
            .await?;

        if let Some(existing) = &existing_entry {
            if existing.hlc_time == candidate.hlc_time {
                if existing != &candidate {
                    // Same HLC time but different content: two entries from
                    // the same node claiming the same timestamp is
                    // impossible by construction (the node component is
                    // unique per clock), so this can only mean corrupted
                    // input.
                    return Err(Error::InvalidEntry(format!(
                        "two distinct entries claim the same hlc_time '{}'",
                        candidate.hlc_time
                    )));
                }
                // Re-applying the exact entry already recorded as most
                // recent: a no-op. Returning early keeps the Merkle insert
                // idempotent (re-inserting the same (time, hash) would XOR
                // it back out, per the tree's commutativity contract).
                log::debug!(
                    "duplicate candidate for store='{}' key={:?} prop='{}' at {}",
                    candidate.store, candidate.object_key, candidate.prop, candidate.hlc_time
                );
                return Ok(ApplyOutcome::Superseded);
            }
            if existing.hlc_time > candidate.hlc_time {
                self.oplog.insert(&candidate).await?;
                self.insert_into_merkle(&candidate_hlc)?;
                log::debug!(
                    "superseded candidate for store='{}' key={:?} prop='{}': existing hlc {} > candidate {}",
                    candidate.store, candidate.object_key, candidate.prop, existing.hlc_time, candidate.hlc_time
                );
                return Ok(ApplyOutcome::Superseded);
            }
        }

        self.oplog.insert(&candidate).await?;

        let schema = self
            .schemas
            .get(&candidate.store)
            .expect("validated above");
        let key_path = schema.key_path.clone();

        let existing_record = self
            .store
            .get(&candidate.store, &candidate.object_key.sort_key())
            .await
            .map_err(Error::TransportError)?;

        let new_record = if candidate.prop.is_empty() {
            candidate.value.clone()
        } else {
            match existing_record {
                Some(serde_json::Value::Object(mut map)) => {
                    map.insert(candidate.prop.clone(), candidate.value.clone());
                    serde_json::Value::Object(map)
                }
                Some(other) => other,
                None => record_from_key_and_prop(
                    &key_path,
                    &candidate.object_key,
                    &candidate.prop,
                    &candidate.value,
                ),
            }
        };

        self.store
            .put(&candidate.store, &candidate.object_key.sort_key(), new_record)
            .await
            .map_err(Error::TransportError)?;

        self.insert_into_merkle(&candidate_hlc)?;

        log::debug!(
            "applied candidate for store='{}' key={:?} prop='{}' at {}",
            candidate.store, candidate.object_key, candidate.prop, candidate.hlc_time
        );
        Ok(ApplyOutcome::Applied)
    }

    fn insert_into_merkle(&self, hlc: &Hlc) -> Result<()> {
        self.merkle.lock().unwrap().insert(hlc, hlc.hash())
    }
}
