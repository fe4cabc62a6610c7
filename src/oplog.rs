//! Append-only oplog storage: every accepted write, local or remote, is
//! durably recorded here keyed by its HLC string so forward iteration is
//! strict temporal order, plus a secondary index for "most recent entry for
//! this field" lookups.
//!
//! The oplog is specified purely in terms of the ordered key/value object
//! store the host provides (see [`crate::store`]); there is no embedded
//! database here, only the key layout and the paginated cursor contract.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::hlc::Hlc;
use crate::store::{KeyValueStore, ObjectKey};

/// Default page size for [`OplogStore::get_entries_after`]; bounds how long
/// any single transaction against the host store stays open.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Sentinel strictly greater than every legal HLC string, used as the
/// exclusive upper bound when scanning the `(store, object_key, prop, *)`
/// index for the most recent entry.
const INDEX_UPPER_SENTINEL: &str = "~";

/// An immutable, timestamped record that a specific property of a specific
/// object in a specific store was set to a specific value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpLogEntry {
    pub hlc_time: String,
    pub store: String,
    pub object_key: ObjectKey,
    pub prop: String,
    pub value: Value,
}

impl OpLogEntry {
    pub fn hlc(&self) -> Result<Hlc> {
        Hlc::from_str(&self.hlc_time)
    }

    fn index_key(&self) -> String {
        index_key(&self.store, &self.object_key, &self.prop, &self.hlc_time)
    }
}

fn index_key(store: &str, object_key: &ObjectKey, prop: &str, hlc_time: &str) -> String {
    format!(
        "{store}\u{1}{}\u{1}{prop}\u{1}{hlc_time}",
        object_key.sort_key()
    )
}

/// Append-only oplog store plus its `(store, object_key, prop, hlc_time)`
/// index, both persisted as ordinary keyed records in the reserved `oplog`
/// key/value store namespace (see external interfaces: persistent state
/// layout).
pub struct OplogStore<S: KeyValueStore> {
    store: S,
    page_size: usize,
}

const OPLOG_NAMESPACE: &str = "__sync_oplog";
const OPLOG_INDEX_NAMESPACE: &str = "__sync_oplog_index";

impl<S: KeyValueStore> OplogStore<S> {
    pub fn new(store: S) -> Self {
        OplogStore {
            store,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Persists `entry`, keyed by its own `hlc_time`, and updates the
    /// secondary index. May be called inside the same transaction as a
    /// record-store write by callers that need both to commit atomically.
    pub async fn insert(&self, entry: &OpLogEntry) -> Result<()> {
        let payload = serde_json::to_value(entry)
            .map_err(|e| Error::InvalidEntry(format!("entry not encodable: {e}")))?;
        self.store
            .put(OPLOG_NAMESPACE, &entry.hlc_time, payload)
            .await
            .map_err(Error::TransportError)?;
        self.store
            .put(
                OPLOG_INDEX_NAMESPACE,
                &entry.index_key(),
                Value::String(entry.hlc_time.clone()),
            )
            .await
            .map_err(Error::TransportError)?;
        Ok(())
    }

    /// The entry with the greatest `hlc_time` for `(store, object_key,
    /// prop)`, found by scanning the index in reverse over
    /// `[(s,k,p,""), (s,k,p,"~"))`.
    pub async fn most_recent_entry(
        &self,
        store: &str,
        object_key: &ObjectKey,
        prop: &str,
    ) -> Result<Option<OpLogEntry>> {
        let lower = index_key(store, object_key, prop, "");
        let upper = index_key(store, object_key, prop, INDEX_UPPER_SENTINEL);
        let mut hits = self
            .store
            .range(OPLOG_INDEX_NAMESPACE, &lower, &upper)
            .await
            .map_err(Error::TransportError)?;
        // range is ascending; the most recent entry is the last element.
        match hits.pop() {
            None => Ok(None),
            Some((_, v)) => {
                let hlc_time = v
                    .as_str()
                    .ok_or_else(|| Error::InvalidMerkle("corrupt oplog index entry".into()))?
                    .to_string();
                self.get(&hlc_time).await
            }
        }
    }

    pub async fn get(&self, hlc_time: &str) -> Result<Option<OpLogEntry>> {
        match self
            .store
            .get(OPLOG_NAMESPACE, hlc_time)
            .await
            .map_err(Error::TransportError)?
        {
            None => Ok(None),
            Some(v) => {
                let entry: OpLogEntry = serde_json::from_value(v)
                    .map_err(|e| Error::InvalidEntry(format!("corrupt oplog record: {e}")))?;
                Ok(Some(entry))
            }
        }
    }

    /// Returns every entry with `hlc_time` strictly greater than
    /// `after_time`, fetched one page at a time so that a transaction never
    /// stays open across an `await` point the caller introduces between
    /// pages. Pass `None` to read from the beginning of the oplog.
    pub fn get_entries_after(&self, after_time: Option<String>) -> EntryCursor<'_, S> {
        EntryCursor {
            store: self,
            cursor: after_time,
            page_size: self.page_size,
            done: false,
        }
    }
}

/// A paginated, externally-driven cursor over oplog entries in ascending
/// HLC order. Each call to [`EntryCursor::next_page`] opens and closes its
/// own short-lived transaction against the host store.
pub struct EntryCursor<'a, S: KeyValueStore> {
    store: &'a OplogStore<S>,
    cursor: Option<String>,
    page_size: usize,
    done: bool,
}

impl<'a, S: KeyValueStore> EntryCursor<'a, S> {
    pub async fn next_page(&mut self) -> Result<Vec<OpLogEntry>> {
        if self.done {
            return Ok(Vec::new());
        }
        let lower = self.cursor.clone().unwrap_or_default();
        let rows = self
            .store
            .store
            .range_paginated(OPLOG_NAMESPACE, &lower, self.cursor.is_some(), self.page_size)
            .await
            .map_err(Error::TransportError)?;

        if rows.len() < self.page_size {
            self.done = true;
        }
        let mut entries = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let entry: OpLogEntry = serde_json::from_value(value)
                .map_err(|e| Error::InvalidEntry(format!("corrupt oplog record: {e}")))?;
            self.cursor = Some(key);
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Drains the whole cursor into one vector. Convenient for tests and for
    /// the sync driver's "incorporate recent local entries" step, which
    /// needs every entry regardless of page boundaries.
    pub async fn collect_all(mut self) -> Result<Vec<OpLogEntry>> {
        let mut all = Vec::new();
        loop {
            let page = self.next_page().await?;
            if page.is_empty() {
                break;
            }
            all.extend(page);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use serde_json::json;

    fn entry(hlc_time: &str, store: &str, key: i64, prop: &str, value: Value) -> OpLogEntry {
        OpLogEntry {
            hlc_time: hlc_time.to_string(),
            store: store.to_string(),
            object_key: ObjectKey::Scalar(json!(key)),
            prop: prop.to_string(),
            value,
        }
    }

    #[tokio::test]
    async fn most_recent_entry_picks_greatest_hlc() {
        let oplog = OplogStore::new(InMemoryStore::new());
        let e1 = entry("2024-01-01T00:00:00.000Z_0000_aaaaaaaaaaaaaaaa", "todo", 1, "name", json!("old"));
        let e2 = entry("2024-01-01T00:00:00.001Z_0000_aaaaaaaaaaaaaaaa", "todo", 1, "name", json!("new"));
        oplog.insert(&e1).await.unwrap();
        oplog.insert(&e2).await.unwrap();

        let most_recent = oplog
            .most_recent_entry("todo", &ObjectKey::Scalar(json!(1)), "name")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(most_recent.hlc_time, e2.hlc_time);
    }

    #[tokio::test]
    async fn pagination_covers_every_entry_in_order() {
        let oplog = OplogStore::new(InMemoryStore::new()).with_page_size(3);
        for i in 0..10u32 {
            let hlc_time = format!("2024-01-01T00:00:{:02}.000Z_0000_aaaaaaaaaaaaaaaa", i);
            oplog
                .insert(&entry(&hlc_time, "todo", 1, "n", json!(i)))
                .await
                .unwrap();
        }
        let all = oplog.get_entries_after(None).collect_all().await.unwrap();
        assert_eq!(all.len(), 10);
        for w in all.windows(2) {
            assert!(w[0].hlc_time < w[1].hlc_time);
        }
    }

    #[tokio::test]
    async fn get_entries_after_excludes_the_boundary() {
        let oplog = OplogStore::new(InMemoryStore::new());
        let e1 = entry("2024-01-01T00:00:00.000Z_0000_aaaaaaaaaaaaaaaa", "todo", 1, "n", json!(1));
        let e2 = entry("2024-01-01T00:00:00.001Z_0000_aaaaaaaaaaaaaaaa", "todo", 1, "n", json!(2));
        oplog.insert(&e1).await.unwrap();
        oplog.insert(&e2).await.unwrap();

        let after = oplog
            .get_entries_after(Some(e1.hlc_time.clone()))
            .collect_all()
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].hlc_time, e2.hlc_time);
    }
}
