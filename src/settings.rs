//! Persisted, non-synchronized per-client settings: the permanent `node_id`
//! and the opaque per-transport `sync_profiles`. Stored as a single record
//! keyed by the constant `"settings"` in the reserved settings namespace so
//! it never collides with a host-defined record store.
//!
//! The Merkle cache (§6 "Persistent state layout") lives alongside settings
//! under its own reserved key, `"oplogMerkle"`; see [`crate::sync`] for the
//! read/delete/write cycle that makes a crashed sync round force a rebuild.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::KeyValueStore;

/// Reserved namespace for settings and the Merkle cache; prefixed so it
/// cannot collide with a host-registered record store name.
pub const SETTINGS_NAMESPACE: &str = "__sync_settings";
/// The single settings record's key.
pub const SETTINGS_KEY: &str = "settings";
/// The Merkle cache's key, in the same namespace as settings.
pub const MERKLE_CACHE_KEY: &str = "oplogMerkle";

/// `(node_id, sync_profiles)`, created once on first run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// The 16-character client identifier, the third component of every
    /// HLC this client produces. Permanent once minted.
    pub node_id: String,
    /// Opaque per-transport state, keyed by `plugin_id`.
    #[serde(default)]
    pub sync_profiles: HashMap<String, Value>,
}

impl Settings {
    /// Loads settings from `store`, minting and persisting a fresh
    /// `node_id` on first run. Idempotent: calling this again on an
    /// already-initialized store returns the same `node_id`.
    pub async fn load_or_init<S: KeyValueStore>(store: &S) -> Result<Settings> {
        match store
            .get(SETTINGS_NAMESPACE, SETTINGS_KEY)
            .await
            .map_err(Error::TransportError)?
        {
            Some(v) => {
                let settings: Settings = serde_json::from_value(v).map_err(|e| {
                    Error::InvalidEntry(format!("corrupt settings record: {e}"))
                })?;
                Ok(settings)
            }
            None => {
                let settings = Settings {
                    node_id: mint_node_id(),
                    sync_profiles: HashMap::new(),
                };
                settings.save(store).await?;
                log::info!("minted new node_id '{}' on first run", settings.node_id);
                Ok(settings)
            }
        }
    }

    pub async fn save<S: KeyValueStore>(&self, store: &S) -> Result<()> {
        let payload = serde_json::to_value(self)
            .map_err(|e| Error::InvalidEntry(format!("settings not encodable: {e}")))?;
        store
            .put(SETTINGS_NAMESPACE, SETTINGS_KEY, payload)
            .await
            .map_err(Error::TransportError)
    }
}

/// The last 16 characters of a hyphen-free version-4 UUID.
fn mint_node_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple[simple.len() - 16..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    #[tokio::test]
    async fn first_run_mints_and_persists_node_id() {
        let store = InMemoryStore::new();
        let settings = Settings::load_or_init(&store).await.unwrap();
        assert_eq!(settings.node_id.len(), 16);

        let reloaded = Settings::load_or_init(&store).await.unwrap();
        assert_eq!(reloaded.node_id, settings.node_id);
    }

    #[tokio::test]
    async fn node_id_is_lowercase_hex() {
        let store = InMemoryStore::new();
        let settings = Settings::load_or_init(&store).await.unwrap();
        assert!(settings.node_id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
