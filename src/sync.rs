//! Sync driver (§4.7): orchestrates one round per registered transport —
//! rebuild/refresh the local Merkle tree, diff it against the transport's
//! view of this client, upload what the transport is missing, then diff
//! against every other known client and download and apply what this
//! client is missing.

use std::sync::{Arc, Mutex as StdMutex};

use crate::apply::{ApplyEngine, ApplyOutcome};
use crate::error::{Error, Result};
use crate::hlc::floor_hlc_time_at;
use crate::merkle::{path_to_millis, MerkleTree};
use crate::oplog::OplogStore;
use crate::settings::{Settings, MERKLE_CACHE_KEY, SETTINGS_NAMESPACE};
use crate::store::KeyValueStore;
use crate::transport::{RemoteEntry, Transport};

/// What happened when this driver ran one transport's round.
#[derive(Debug)]
pub enum TransportRoundOutcome {
    Success { uploaded: usize, downloaded: usize },
    Failure { error: Error },
}

/// Runs sync rounds for one client against its registered transports.
///
/// Shares the same clock, oplog, and Merkle tree handles as the
/// [`crate::store::RecordStoreAdapter`] that intercepts this client's local
/// writes and the [`ApplyEngine`] that merges what comes back, so a round's
/// view of "local state" is always current.
pub struct SyncDriver<S: KeyValueStore> {
    store: S,
    oplog: Arc<OplogStore<S>>,
    merkle: Arc<StdMutex<MerkleTree>>,
    apply_engine: ApplyEngine<S>,
    settings: Settings,
    transports: Vec<Box<dyn Transport>>,
}

impl<S: KeyValueStore + Clone> SyncDriver<S> {
    pub fn new(
        store: S,
        oplog: Arc<OplogStore<S>>,
        merkle: Arc<StdMutex<MerkleTree>>,
        apply_engine: ApplyEngine<S>,
        settings: Settings,
    ) -> Self {
        SyncDriver {
            store,
            oplog,
            merkle,
            apply_engine,
            settings,
            transports: Vec::new(),
        }
    }

    pub fn register_transport(&mut self, transport: Box<dyn Transport>) {
        self.transports.push(transport);
    }

    /// Runs one round against every registered transport, sequentially.
    /// A transport's failure doesn't abort the others' rounds.
    pub async fn run(&self) -> Vec<TransportRoundOutcome> {
        let mut outcomes = Vec::with_capacity(self.transports.len());
        for transport in &self.transports {
            let outcome = match self.run_one(transport.as_ref()).await {
                Ok((uploaded, downloaded)) => TransportRoundOutcome::Success { uploaded, downloaded },
                Err(error) => {
                    log::error!("sync round failed for transport '{}': {error}", transport.plugin_id());
                    TransportRoundOutcome::Failure { error }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Step 1: load the cached Merkle snapshot, deleting the cache entry
    /// immediately so a crash mid-round forces a full rebuild next time
    /// rather than resuming from a tree that might not reflect what was
    /// actually persisted.
    async fn load_local_merkle(&self) -> Result<()> {
        let cached = self
            .store
            .get(SETTINGS_NAMESPACE, MERKLE_CACHE_KEY)
            .await
            .map_err(Error::TransportError)?;
        self.store
            .delete(SETTINGS_NAMESPACE, MERKLE_CACHE_KEY)
            .await
            .map_err(Error::TransportError)?;

        let loaded = match cached {
            Some(v) => {
                let tree: MerkleTree = serde_json::from_value(v)
                    .map_err(|e| Error::InvalidMerkle(format!("corrupt merkle cache: {e}")))?;
                match tree.validate() {
                    Ok(()) => tree,
                    Err(err) => {
                        log::warn!("merkle cache failed shape validation, treating as empty: {err}");
                        MerkleTree::default()
                    }
                }
            }
            None => {
                log::debug!("no merkle cache found; rebuilding from the oplog");
                MerkleTree::default()
            }
        };
        log::debug!("invalidated merkle cache for this round");
        *self.merkle.lock().expect("merkle mutex poisoned") = loaded;
        Ok(())
    }

    async fn save_local_merkle(&self) -> Result<()> {
        let tree = self.merkle.lock().expect("merkle mutex poisoned").clone();
        let encoded = serde_json::to_value(&tree)
            .map_err(|e| Error::InvalidMerkle(format!("merkle not encodable: {e}")))?;
        self.store
            .put(SETTINGS_NAMESPACE, MERKLE_CACHE_KEY, encoded)
            .await
            .map_err(Error::TransportError)
    }

    /// Step 2: bring the in-memory Merkle tree up to date with every oplog
    /// entry since its newest known leaf. Whether the tree just came out
    /// of the cache or was rebuilt empty in step 1, the approximate
    /// `path_to_newest_leaf` boundary is a safe lower bound: an empty tree
    /// reports millis 0, so this naturally walks the whole oplog.
    async fn catch_up_local_merkle(&self) -> Result<()> {
        let newest_path = self.merkle.lock().expect("merkle mutex poisoned").path_to_newest_leaf();
        let newest_millis = if newest_path.is_empty() {
            0
        } else {
            path_to_millis(&newest_path)?
        };
        let cursor = floor_hlc_time_at(newest_millis);
        let entries = self.oplog.get_entries_after(Some(cursor)).collect_all().await?;
        let mut merkle = self.merkle.lock().expect("merkle mutex poisoned");
        for entry in &entries {
            let hlc = entry.hlc()?;
            merkle.insert(&hlc, hlc.hash())?;
        }
        Ok(())
    }

    async fn run_one(&self, transport: &dyn Transport) -> Result<(usize, usize)> {
        log::info!("sync round starting for transport '{}'", transport.plugin_id());
        self.load_local_merkle().await?;
        self.catch_up_local_merkle().await?;

        let client_id = self.settings.node_id.clone();
        let uploaded = self.upload_phase(transport, &client_id).await?;
        let downloaded = self.download_phase(transport, &client_id).await?;
        log::info!(
            "sync round finished for transport '{}': uploaded {uploaded}, downloaded {downloaded}",
            transport.plugin_id()
        );
        Ok((uploaded, downloaded))
    }

    /// Step 3-4: diff the transport's record of this client against the
    /// local tree and upload whatever the transport is missing.
    async fn upload_phase(&self, transport: &dyn Transport, client_id: &str) -> Result<usize> {
        let remote_snapshots = transport
            .get_remote_merkles(Some(std::slice::from_ref(&client_id.to_string())), None)
            .await?;
        if remote_snapshots.len() > 1 {
            log::warn!(
                "transport '{}' holds {} snapshots for client '{}'; treating as empty",
                transport.plugin_id(),
                remote_snapshots.len(),
                client_id
            );
        }

        let local_snapshot = self.merkle.lock().expect("merkle mutex poisoned").clone();
        let remote_tree = if remote_snapshots.len() == 1 {
            match remote_snapshots[0].tree.validate() {
                Ok(()) => remote_snapshots[0].tree.clone(),
                Err(err) => {
                    log::warn!(
                        "transport '{}' holds a malformed snapshot for client '{}', treating as empty: {err}",
                        transport.plugin_id(),
                        client_id
                    );
                    MerkleTree::default()
                }
            }
        } else {
            MerkleTree::default()
        };

        let diff_path = remote_tree.find_diff(&local_snapshot);
        let cursor = match diff_path {
            Some(path) => Some(floor_hlc_time_at(path_to_millis(&path)?)),
            None => return Ok(0),
        };

        let to_upload = self.oplog.get_entries_after(cursor).collect_all().await?;
        for entry in &to_upload {
            transport
                .save_remote_entry(RemoteEntry {
                    time: entry.hlc_time.clone(),
                    counter: entry.hlc()?.counter,
                    client_id: client_id.to_string(),
                    entry: entry.clone(),
                })
                .await?;
        }
        if !to_upload.is_empty() {
            transport
                .save_remote_merkle(client_id, local_snapshot)
                .await?;
            self.save_local_merkle().await?;
        }
        Ok(to_upload.len())
    }

    /// Step 5: for every other known client, diff its published snapshot
    /// against the local tree and apply what this client is missing.
    /// `ClockDrift` aborts the whole round; any other apply error aborts
    /// only that entry.
    async fn download_phase(&self, transport: &dyn Transport, client_id: &str) -> Result<usize> {
        let remote_snapshots = transport
            .get_remote_merkles(None, Some(std::slice::from_ref(&client_id.to_string())))
            .await?;

        let mut downloaded = 0;
        let mut applied_any = false;
        for remote in remote_snapshots {
            let remote_tree = match remote.tree.validate() {
                Ok(()) => remote.tree.clone(),
                Err(err) => {
                    log::warn!(
                        "malformed snapshot from client '{}', treating as empty: {err}",
                        remote.client_id
                    );
                    MerkleTree::default()
                }
            };
            let local_snapshot = self.merkle.lock().expect("merkle mutex poisoned").clone();
            let diff_path = remote_tree.find_diff(&local_snapshot);
            let Some(path) = diff_path else { continue };
            let cursor = Some(floor_hlc_time_at(path_to_millis(&path)?));

            let entries = transport.get_remote_entries(&remote.client_id, cursor).await?;
            for entry in entries {
                match self.apply_engine.apply(entry).await {
                    Ok(ApplyOutcome::Applied) => {
                        downloaded += 1;
                        applied_any = true;
                    }
                    Ok(ApplyOutcome::Superseded) => {}
                    Err(err @ Error::ClockDrift { .. }) => {
                        log::error!("aborting sync round: {err}");
                        return Err(err);
                    }
                    Err(err) => {
                        log::warn!("dropping entry from client '{}': {err}", remote.client_id);
                    }
                }
            }
        }

        if applied_any {
            let refreshed = self.merkle.lock().expect("merkle mutex poisoned").clone();
            transport.save_remote_merkle(client_id, refreshed).await?;
            self.save_local_merkle().await?;
        }
        Ok(downloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::ClockService;
    use crate::oplog::OplogStore;
    use crate::settings::Settings;
    use crate::store::memory::InMemoryStore;
    use crate::store::{KeyPath, ObjectKey, RecordStoreAdapter, StoreSchema};
    use crate::transport::testing::{InMemoryRemote, InMemoryTransport};

    fn notes_schema() -> StoreSchema {
        StoreSchema {
            key_path: KeyPath::Single("id".to_string()),
        }
    }

    async fn build_client(
        node_id: &str,
        store: InMemoryStore,
    ) -> (
        RecordStoreAdapter<InMemoryStore>,
        SyncDriver<InMemoryStore>,
        Arc<StdMutex<MerkleTree>>,
    ) {
        let clock = Arc::new(ClockService::new());
        clock.init(node_id);
        let oplog = Arc::new(OplogStore::new(store.clone()));
        let merkle = Arc::new(StdMutex::new(MerkleTree::default()));

        let mut adapter = RecordStoreAdapter::new(store.clone(), clock.clone(), oplog.clone(), merkle.clone());
        adapter.register_store("notes", notes_schema());

        let mut apply_engine = ApplyEngine::new(store.clone(), clock.clone(), oplog.clone(), merkle.clone());
        apply_engine.register_store("notes", notes_schema());

        let settings = Settings {
            node_id: node_id.to_string(),
            sync_profiles: Default::default(),
        };
        let driver = SyncDriver::new(store, oplog, merkle.clone(), apply_engine, settings);
        (adapter, driver, merkle)
    }

    #[tokio::test]
    async fn two_clients_converge_on_each_others_writes() {
        let _ = env_logger::try_init();
        let backend = InMemoryRemote::new();

        let (adapter_a, mut driver_a, _) = build_client("clienta000000000", InMemoryStore::new()).await;
        let (adapter_b, mut driver_b, _) = build_client("clientb000000000", InMemoryStore::new()).await;

        driver_a.register_transport(Box::new(InMemoryTransport::new("clienta000000000", backend.clone())));
        driver_b.register_transport(Box::new(InMemoryTransport::new("clientb000000000", backend.clone())));

        adapter_a
            .put(
                "notes",
                serde_json::json!({"id": "n1", "title": "from A"}),
                None,
            )
            .await
            .unwrap();
        adapter_b
            .put(
                "notes",
                serde_json::json!({"id": "n2", "title": "from B"}),
                None,
            )
            .await
            .unwrap();

        // Each two-field record ("id", "title") is decomposed into two oplog
        // entries (§4.5), so a single `put` uploads/downloads 2, not 1.
        let outcomes_a = driver_a.run().await;
        assert!(matches!(outcomes_a[0], TransportRoundOutcome::Success { uploaded: 2, .. }));

        let outcomes_b = driver_b.run().await;
        assert!(matches!(outcomes_b[0], TransportRoundOutcome::Success { downloaded: 2, .. }));

        let n1_on_b = adapter_b.get("notes", &ObjectKey::Scalar(serde_json::json!("n1"))).await.unwrap();
        assert_eq!(n1_on_b.unwrap()["title"], "from A");
    }

    #[tokio::test]
    async fn second_round_with_no_new_writes_is_a_no_op() {
        let _ = env_logger::try_init();
        let backend = InMemoryRemote::new();
        let (adapter_a, mut driver_a, _) = build_client("clienta111111111", InMemoryStore::new()).await;
        driver_a.register_transport(Box::new(InMemoryTransport::new("clienta111111111", backend)));

        adapter_a
            .put("notes", serde_json::json!({"id": "n1", "title": "v1"}), None)
            .await
            .unwrap();

        let first = driver_a.run().await;
        assert!(matches!(first[0], TransportRoundOutcome::Success { uploaded: 2, .. }));

        let second = driver_a.run().await;
        assert!(matches!(second[0], TransportRoundOutcome::Success { uploaded: 0, downloaded: 0 }));
    }
}
