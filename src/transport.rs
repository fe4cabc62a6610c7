//! The transport boundary (§4.8): the pluggable collaborator that moves
//! oplog entries and Merkle snapshots between this client and whatever
//! central or peer-to-peer service the host wires up. No concrete
//! implementation lives here — only the trait and an in-memory double for
//! exercising [`crate::sync::SyncDriver`] without a real backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::merkle::MerkleTree;
use crate::oplog::OpLogEntry;

/// Whatever the host's identity provider says about the signed-in user.
/// Opaque to the sync engine; carried through unexamined.
pub type UserProfile = serde_json::Value;

/// An oplog entry as it travels over a transport, tagged with the
/// uploading client's identity so a remote service can group entries by
/// origin without inspecting the entry's own `hlc_time` node component.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub time: String,
    pub counter: u16,
    pub client_id: String,
    pub entry: OpLogEntry,
}

/// A remote client's published Merkle snapshot, along with whose it is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteMerkle {
    pub client_id: String,
    pub tree: MerkleTree,
}

/// The external collaborator a [`crate::sync::SyncDriver`] round talks to.
///
/// Implementations own whatever session/auth state the concrete backend
/// needs; this trait only describes the operations a sync round performs.
/// **Users must implement this trait** against their own backend; the
/// [`testing`] module's double exists purely to exercise the sync driver.
#[async_trait]
pub trait Transport: Send + Sync {
    /// A stable identifier for this transport, used as the key under which
    /// [`crate::settings::Settings::sync_profiles`] stores this transport's
    /// opaque per-client state.
    fn plugin_id(&self) -> &str;

    /// Performs whatever one-time setup a fresh session needs (e.g.
    /// restoring a saved auth token) before any other method is called.
    async fn load(&self) -> Result<()>;

    async fn sign_in(&self) -> Result<()>;
    async fn sign_out(&self) -> Result<()>;
    async fn is_signed_in(&self) -> Result<bool>;
    async fn user_profile(&self) -> Result<Option<UserProfile>>;

    /// Registers a callback invoked whenever sign-in state changes.
    /// Most transports never need to call back; the default is a no-op.
    fn add_sign_in_change_listener(&self, _listener: Box<dyn Fn(bool) + Send + Sync>) {}

    async fn get_settings(&self) -> Result<Option<serde_json::Value>>;
    async fn set_settings(&self, settings: serde_json::Value) -> Result<()>;

    /// Publishes one oplog entry, already tagged with the uploading
    /// client's identity.
    async fn save_remote_entry(&self, entry: RemoteEntry) -> Result<()>;

    /// Fetches `client_id`'s published entries, optionally only those
    /// whose `time` sorts strictly after `after_time`.
    async fn get_remote_entries(
        &self,
        client_id: &str,
        after_time: Option<String>,
    ) -> Result<Vec<OpLogEntry>>;

    /// Publishes this client's Merkle snapshot, replacing any previous one
    /// under the same `client_id`.
    async fn save_remote_merkle(&self, client_id: &str, tree: MerkleTree) -> Result<()>;

    /// Fetches published Merkle snapshots, restricted to `include` (when
    /// given) and/or omitting `exclude` (when given). Both filters may be
    /// applied; an absent filter imposes no restriction.
    async fn get_remote_merkles(
        &self,
        include: Option<&[String]>,
        exclude: Option<&[String]>,
    ) -> Result<Vec<RemoteMerkle>>;
}

/// An in-memory stand-in for a real transport, for tests and examples.
///
/// [`testing::InMemoryRemote`] is the shared backend a whole sync topology
/// publishes to and reads from; [`testing::InMemoryTransport`] is one
/// client's handle into it, analogous to how a real transport would hold a
/// session against one shared backend service.
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::Arc;

    /// Shared state visible to every [`InMemoryTransport`] built on top of
    /// it, simulating a central sync service all clients publish to.
    #[derive(Default)]
    struct Backend {
        entries: HashMap<String, Vec<OpLogEntry>>,
        merkles: HashMap<String, MerkleTree>,
        settings: Option<serde_json::Value>,
        signed_in: bool,
    }

    #[derive(Clone, Default)]
    pub struct InMemoryRemote {
        inner: Arc<StdMutex<Backend>>,
    }

    impl InMemoryRemote {
        pub fn new() -> Self {
            InMemoryRemote::default()
        }

        /// Seeds `client_id`'s entries directly, bypassing `save_remote_entry`.
        /// Useful for setting up a scenario where "another client" has
        /// already published history before the test's `SyncDriver` runs.
        pub fn set_remote_entries_for_client(&self, client_id: &str, entries: Vec<OpLogEntry>) {
            self.inner
                .lock()
                .expect("backend mutex poisoned")
                .entries
                .insert(client_id.to_string(), entries);
        }
    }

    /// One client's handle onto a shared [`InMemoryRemote`].
    pub struct InMemoryTransport {
        plugin_id: String,
        client_id: String,
        backend: InMemoryRemote,
    }

    impl InMemoryTransport {
        pub fn new(client_id: impl Into<String>, backend: InMemoryRemote) -> Self {
            InMemoryTransport {
                plugin_id: "in-memory".to_string(),
                client_id: client_id.into(),
                backend,
            }
        }
    }

    #[async_trait]
    impl Transport for InMemoryTransport {
        fn plugin_id(&self) -> &str {
            &self.plugin_id
        }

        async fn load(&self) -> Result<()> {
            Ok(())
        }

        async fn sign_in(&self) -> Result<()> {
            self.backend.inner.lock().expect("backend mutex poisoned").signed_in = true;
            Ok(())
        }

        async fn sign_out(&self) -> Result<()> {
            self.backend.inner.lock().expect("backend mutex poisoned").signed_in = false;
            Ok(())
        }

        async fn is_signed_in(&self) -> Result<bool> {
            Ok(self.backend.inner.lock().expect("backend mutex poisoned").signed_in)
        }

        async fn user_profile(&self) -> Result<Option<UserProfile>> {
            Ok(None)
        }

        async fn get_settings(&self) -> Result<Option<serde_json::Value>> {
            Ok(self.backend.inner.lock().expect("backend mutex poisoned").settings.clone())
        }

        async fn set_settings(&self, settings: serde_json::Value) -> Result<()> {
            self.backend.inner.lock().expect("backend mutex poisoned").settings = Some(settings);
            Ok(())
        }

        async fn save_remote_entry(&self, entry: RemoteEntry) -> Result<()> {
            let mut backend = self.backend.inner.lock().expect("backend mutex poisoned");
            let bucket = backend.entries.entry(entry.client_id.clone()).or_default();
            if bucket.iter().any(|e| e.hlc_time == entry.entry.hlc_time) {
                // Idempotent: the same (client_id, hlc_time) was already published.
                return Ok(());
            }
            bucket.push(entry.entry);
            Ok(())
        }

        async fn get_remote_entries(
            &self,
            client_id: &str,
            after_time: Option<String>,
        ) -> Result<Vec<OpLogEntry>> {
            let backend = self.backend.inner.lock().expect("backend mutex poisoned");
            let mut entries = backend
                .entries
                .get(client_id)
                .cloned()
                .unwrap_or_default();
            if let Some(after) = after_time {
                entries.retain(|e| e.hlc_time.as_str() > after.as_str());
            }
            entries.sort_by(|a, b| a.hlc_time.cmp(&b.hlc_time));
            Ok(entries)
        }

        async fn save_remote_merkle(&self, client_id: &str, tree: MerkleTree) -> Result<()> {
            self.backend
                .inner
                .lock()
                .expect("backend mutex poisoned")
                .merkles
                .insert(client_id.to_string(), tree);
            Ok(())
        }

        async fn get_remote_merkles(
            &self,
            include: Option<&[String]>,
            exclude: Option<&[String]>,
        ) -> Result<Vec<RemoteMerkle>> {
            let backend = self.backend.inner.lock().expect("backend mutex poisoned");
            let out = backend
                .merkles
                .iter()
                .filter(|(id, _)| include.map_or(true, |ids| ids.iter().any(|i| i == *id)))
                .filter(|(id, _)| exclude.map_or(true, |ids| !ids.iter().any(|i| i == *id)))
                .map(|(id, tree)| RemoteMerkle {
                    client_id: id.clone(),
                    tree: tree.clone(),
                })
                .collect();
            Ok(out)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::hlc::Hlc;
        use crate::store::ObjectKey;

        fn entry(hlc: &str) -> OpLogEntry {
            OpLogEntry {
                hlc_time: hlc.to_string(),
                store: "notes".to_string(),
                object_key: ObjectKey::Scalar(serde_json::json!("n1")),
                prop: "title".to_string(),
                value: serde_json::json!("hello"),
            }
        }

        #[tokio::test]
        async fn save_and_fetch_round_trips() {
            let backend = InMemoryRemote::new();
            let transport = InMemoryTransport::new("clientA", backend);
            let hlc = Hlc::new(1_000, 0, "clienta0000000000".chars().take(16).collect::<String>());
            transport
                .save_remote_entry(RemoteEntry {
                    time: hlc.to_string(),
                    counter: 0,
                    client_id: "clientA".to_string(),
                    entry: entry(&hlc.to_string()),
                })
                .await
                .unwrap();

            let fetched = transport.get_remote_entries("clientA", None).await.unwrap();
            assert_eq!(fetched.len(), 1);
        }

        #[tokio::test]
        async fn after_time_filter_excludes_boundary_and_earlier() {
            let backend = InMemoryRemote::new();
            backend.set_remote_entries_for_client(
                "clientB",
                vec![entry("a"), entry("b"), entry("c")],
            );
            let transport = InMemoryTransport::new("clientB", backend);
            let fetched = transport
                .get_remote_entries("clientB", Some("b".to_string()))
                .await
                .unwrap();
            assert_eq!(fetched.len(), 1);
            assert_eq!(fetched[0].hlc_time, "c");
        }

        #[tokio::test]
        async fn merkle_filters_compose() {
            let backend = InMemoryRemote::new();
            let a = InMemoryTransport::new("a", backend.clone());
            let b = InMemoryTransport::new("b", backend.clone());
            a.save_remote_merkle("a", MerkleTree::default()).await.unwrap();
            b.save_remote_merkle("b", MerkleTree::default()).await.unwrap();

            let only_a = a
                .get_remote_merkles(Some(&["a".to_string()]), None)
                .await
                .unwrap();
            assert_eq!(only_a.len(), 1);
            assert_eq!(only_a[0].client_id, "a");

            let not_a = a.get_remote_merkles(None, Some(&["a".to_string()])).await.unwrap();
            assert_eq!(not_a.len(), 1);
            assert_eq!(not_a[0].client_id, "b");
        }
    }
}
