//! The record-store boundary: a generic key/value object store abstraction
//! (the embedded database itself is an external collaborator, out of
//! scope) plus the write-interception decorator that turns a caller's
//! `put` into a record mutation and N oplog entries inside one atomic unit.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::hlc::ClockService;
use crate::merkle::MerkleTree;
use crate::oplog::{OpLogEntry, OplogStore};

/// The key of a record: a scalar, or an ordered sequence of scalars for a
/// composite key path. Matches the target store's key-path arity.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum ObjectKey {
    Scalar(Value),
    Composite(Vec<Value>),
}

impl ObjectKey {
    pub fn arity(&self) -> usize {
        match self {
            ObjectKey::Scalar(_) => 1,
            ObjectKey::Composite(parts) => parts.len(),
        }
    }

    /// A byte-lexicographic, injective string encoding used as the
    /// `object_key` component of the oplog's secondary index.
    pub fn sort_key(&self) -> String {
        match self {
            ObjectKey::Scalar(v) => canonical_scalar(v),
            ObjectKey::Composite(parts) => parts
                .iter()
                .map(canonical_scalar)
                .collect::<Vec<_>>()
                .join("\u{1}"),
        }
    }
}

fn canonical_scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// How a store's keys are derived from a record's fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyPath {
    /// Keys are supplied explicitly by the caller.
    None,
    /// A single property on the record value is the key.
    Single(String),
    /// An ordered list of properties forms a composite key.
    Composite(Vec<String>),
    /// Server-side autoincrement: rejected with `UnsupportedStore`.
    AutoIncrement,
}

/// Per-store metadata the write interceptor needs: its key path, and
/// whether any property name in that path contains a `.` (nested paths are
/// unsupported).
#[derive(Clone, Debug)]
pub struct StoreSchema {
    pub key_path: KeyPath,
}

impl StoreSchema {
    pub fn validate(&self) -> Result<()> {
        let nested = match &self.key_path {
            KeyPath::Single(p) => p.contains('.'),
            KeyPath::Composite(ps) => ps.iter().any(|p| p.contains('.')),
            KeyPath::None | KeyPath::AutoIncrement => false,
        };
        if nested {
            return Err(Error::UnsupportedStore(
                "nested key paths are not supported".into(),
            ));
        }
        if matches!(self.key_path, KeyPath::AutoIncrement) {
            return Err(Error::UnsupportedStore(
                "server-side autoincrementing keys are not supported".into(),
            ));
        }
        Ok(())
    }
}

/// A generic, namespaced key/value object store. One instance backs every
/// named record store, the reserved oplog store, its index, and the
/// reserved settings store. Keys are ordered byte-lexicographically within
/// a namespace so that [`KeyValueStore::range`] can serve the oplog index's
/// reverse-cursor lookups.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<Option<Value>>;
    async fn put(&self, namespace: &str, key: &str, value: Value) -> anyhow::Result<()>;
    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()>;

    /// Ascending-ordered entries with `lower <= key < upper`.
    async fn range(
        &self,
        namespace: &str,
        lower: &str,
        upper: &str,
    ) -> anyhow::Result<Vec<(String, Value)>>;

    /// Up to `limit` ascending-ordered entries starting at `cursor`
    /// (exclusive of `cursor` itself when `exclusive` is set, used to resume
    /// a paginated scan without repeating the last row of the prior page).
    async fn range_paginated(
        &self,
        namespace: &str,
        cursor: &str,
        exclusive: bool,
        limit: usize,
    ) -> anyhow::Result<Vec<(String, Value)>>;
}

/// Write-intercepting wrapper around a [`KeyValueStore`] record namespace.
///
/// This is the "decorator at the store boundary" re-architected as a thin,
/// explicit wrapper object rather than language-level property
/// interception: callers must route every write through
/// [`RecordStoreAdapter::put`] for it to be captured as oplog entries.
pub struct RecordStoreAdapter<S: KeyValueStore> {
    store: S,
    clock: std::sync::Arc<ClockService>,
    oplog: std::sync::Arc<OplogStore<S>>,
    merkle: std::sync::Arc<StdMutex<MerkleTree>>,
    schemas: HashMap<String, StoreSchema>,
}

impl<S: KeyValueStore + Clone> RecordStoreAdapter<S> {
    pub fn new(
        store: S,
        clock: std::sync::Arc<ClockService>,
        oplog: std::sync::Arc<OplogStore<S>>,
        merkle: std::sync::Arc<StdMutex<MerkleTree>>,
    ) -> Self {
        RecordStoreAdapter {
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

    fn schema(&self, store: &str) -> Result<&StoreSchema> {
        self.schemas
            .get(store)
            .ok_or_else(|| Error::UnsupportedStore(format!("unregistered store '{store}'")))
    }

    fn resolve_key(
        &self,
        store: &str,
        value: &Value,
        explicit_key: Option<ObjectKey>,
    ) -> Result<ObjectKey> {
        let schema = self.schema(store)?;
        schema.validate()?;
        match &schema.key_path {
            KeyPath::None => explicit_key.ok_or_else(|| {
                Error::InvalidEntry(format!("store '{store}' requires a caller-supplied key"))
            }),
            KeyPath::Single(prop) => {
                let obj = value.as_object().ok_or_else(|| {
                    Error::InvalidEntry("keyed store requires an object value".into())
                })?;
                let v = obj.get(prop).cloned().ok_or_else(|| {
                    Error::InvalidEntry(format!("value missing key-path property '{prop}'"))
                })?;
                Ok(ObjectKey::Scalar(v))
            }
            KeyPath::Composite(props) => {
                let obj = value.as_object().ok_or_else(|| {
                    Error::InvalidEntry("keyed store requires an object value".into())
                })?;
                let mut parts = Vec::with_capacity(props.len());
                for p in props {
                    let v = obj.get(p).cloned().ok_or_else(|| {
                        Error::InvalidEntry(format!("value missing key-path property '{p}'"))
                    })?;
                    parts.push(v);
                }
                Ok(ObjectKey::Composite(parts))
            }
            KeyPath::AutoIncrement => unreachable!("rejected by schema.validate()"),
        }
    }

    /// Translates `put(value, key?)` into a record mutation plus N oplog
    /// entries, all within one logical unit (§4.5 write interception).
    pub async fn put(
        &self,
        store: &str,
        value: Value,
        explicit_key: Option<ObjectKey>,
    ) -> Result<()> {
        let object_key = self.resolve_key(store, &value, explicit_key)?;

        let existing = self
            .store
            .get(store, &object_key.sort_key())
            .await
            .map_err(Error::TransportError)?;

        let merged = merge_record(existing, &value);

        let mut entries = Vec::new();
        match &value {
            Value::Object(map) => {
                for (prop, prop_value) in map {
                    let hlc = self.clock.tick()?;
                    entries.push(OpLogEntry {
                        hlc_time: hlc.to_string(),
                        store: store.to_string(),
                        object_key: object_key.clone(),
                        prop: prop.clone(),
                        value: prop_value.clone(),
                    });
                }
            }
            primitive => {
                let hlc = self.clock.tick()?;
                entries.push(OpLogEntry {
                    hlc_time: hlc.to_string(),
                    store: store.to_string(),
                    object_key: object_key.clone(),
                    prop: String::new(),
                    value: primitive.clone(),
                });
            }
        }

        for entry in &entries {
            self.oplog.insert(entry).await?;
            let hlc = entry.hlc()?;
            self.merkle
                .lock()
                .unwrap()
                .insert(&hlc, hlc.hash())
                .map_err(|e| Error::TransactionAborted(e.to_string()))?;
        }

        self.store
            .put(store, &object_key.sort_key(), merged)
            .await
            .map_err(Error::TransportError)?;

        log::debug!(
            "wrote {} oplog entr{} for store='{store}' key={:?}",
            entries.len(),
            if entries.len() == 1 { "y" } else { "ies" },
            object_key
        );
        Ok(())
    }

    pub async fn get(&self, store: &str, key: &ObjectKey) -> Result<Option<Value>> {
        self.store
            .get(store, &key.sort_key())
            .await
            .map_err(Error::TransportError)
    }

    pub fn underlying(&self) -> &S {
        &self.store
    }
}

/// `existing ∪ value`: new fields overwrite same-named existing fields.
fn merge_record(existing: Option<Value>, value: &Value) -> Value {
    match (existing, value) {
        (Some(Value::Object(mut old)), Value::Object(new)) => {
            for (k, v) in new {
                old.insert(k.clone(), v.clone());
            }
            Value::Object(old)
        }
        (_, v) => v.clone(),
    }
}

/// Builds a fresh record from key-path-derived fields plus one property,
/// used by the apply engine (§4.6 step 6) when no existing record is found.
pub fn record_from_key_and_prop(
    key_path: &KeyPath,
    object_key: &ObjectKey,
    prop: &str,
    value: &Value,
) -> Value {
    let mut map = Map::new();
    match (key_path, object_key) {
        (KeyPath::Single(p), ObjectKey::Scalar(v)) => {
            map.insert(p.clone(), v.clone());
        }
        (KeyPath::Composite(props), ObjectKey::Composite(parts)) => {
            for (p, v) in props.iter().zip(parts.iter()) {
                map.insert(p.clone(), v.clone());
            }
        }
        _ => {}
    }
    if !prop.is_empty() {
        map.insert(prop.to_string(), value.clone());
    }
    Value::Object(map)
}

pub mod memory {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    /// In-memory [`KeyValueStore`] over nested `BTreeMap`s, kept ordered per
    /// namespace so range scans behave like the real thing. Used by this
    /// crate's own tests and offered to hosts as a reference/testing
    /// implementation; not meant for production persistence.
    #[derive(Clone, Default)]
    pub struct InMemoryStore {
        namespaces: Arc<StdMutex<HashMap<String, BTreeMap<String, Value>>>>,
    }

    impl InMemoryStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl KeyValueStore for InMemoryStore {
        async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<Option<Value>> {
            Ok(self
                .namespaces
                .lock()
                .unwrap()
                .get(namespace)
                .and_then(|ns| ns.get(key).cloned()))
        }

        async fn put(&self, namespace: &str, key: &str, value: Value) -> anyhow::Result<()> {
            self.namespaces
                .lock()
                .unwrap()
                .entry(namespace.to_string())
                .or_default()
                .insert(key.to_string(), value);
            Ok(())
        }

        async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
            if let Some(ns) = self.namespaces.lock().unwrap().get_mut(namespace) {
                ns.remove(key);
            }
            Ok(())
        }

        async fn range(
            &self,
            namespace: &str,
            lower: &str,
            upper: &str,
        ) -> anyhow::Result<Vec<(String, Value)>> {
            let guard = self.namespaces.lock().unwrap();
            let Some(ns) = guard.get(namespace) else {
                return Ok(Vec::new());
            };
            Ok(ns
                .range(lower.to_string()..upper.to_string())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }

        async fn range_paginated(
            &self,
            namespace: &str,
            cursor: &str,
            exclusive: bool,
            limit: usize,
        ) -> anyhow::Result<Vec<(String, Value)>> {
            let guard = self.namespaces.lock().unwrap();
            let Some(ns) = guard.get(namespace) else {
                return Ok(Vec::new());
            };
            let iter = ns.range(cursor.to_string()..);
            Ok(iter
                .filter(|(k, _)| !(exclusive && k.as_str() == cursor))
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn adapter() -> RecordStoreAdapter<InMemoryStore> {
        let store = InMemoryStore::new();
        let clock = Arc::new(ClockService::with_clock_fn(|| 1_700_000_000_000));
        clock.init("a".repeat(16));
        let oplog = Arc::new(OplogStore::new(store.clone()));
        let merkle = Arc::new(StdMutex::new(MerkleTree::new()));
        let mut adapter = RecordStoreAdapter::new(store, clock, oplog, merkle);
        adapter.register_store("todo", StoreSchema { key_path: KeyPath::Single("id".into()) });
        adapter
    }

    #[tokio::test]
    async fn put_merges_and_emits_one_entry_per_property() {
        let adapter = adapter();
        adapter
            .put("todo", json!({"id": 1, "name": "buy milk"}), None)
            .await
            .unwrap();
        let stored = adapter
            .get("todo", &ObjectKey::Scalar(json!(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, json!({"id": 1, "name": "buy milk"}));

        adapter
            .put("todo", json!({"id": 1, "done": true}), None)
            .await
            .unwrap();
        let stored = adapter
            .get("todo", &ObjectKey::Scalar(json!(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, json!({"id": 1, "name": "buy milk", "done": true}));
    }

    #[tokio::test]
    async fn nested_key_path_is_rejected() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ClockService::with_clock_fn(|| 0));
        clock.init("a".repeat(16));
        let oplog = Arc::new(OplogStore::new(store.clone()));
        let merkle = Arc::new(StdMutex::new(MerkleTree::new()));
        let mut adapter = RecordStoreAdapter::new(store, clock, oplog, merkle);
        adapter.register_store(
            "bad",
            StoreSchema {
                key_path: KeyPath::Single("a.b".into()),
            },
        );
        let result = adapter.put("bad", json!({"a.b": 1}), None).await;
        assert!(matches!(result, Err(Error::UnsupportedStore(_))));
    }
}
