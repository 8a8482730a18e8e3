//! In-memory document storage for one replica-set member.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use super::oplog::{OpKind, OplogEntry};
use crate::error::{Error, Result};
use crate::keys::{ChunkRange, Document, ShardKey, ShardKeyPattern, Value};
use crate::types::Namespace;

type Collection = BTreeMap<Value, Document>;

/// Documents of every collection on one member, keyed by `_id`.
#[derive(Default)]
pub struct Storage {
    collections: RwLock<HashMap<Namespace, Collection>>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document. Fails if it has no `_id`.
    pub fn upsert(&self, ns: &Namespace, doc: Document) -> Result<()> {
        let id = doc
            .id()
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("document {} has no _id", doc)))?;
        self.collections
            .write()
            .entry(ns.clone())
            .or_default()
            .insert(id, doc);
        Ok(())
    }

    /// Remove a document by `_id`, returning it if present.
    pub fn delete(&self, ns: &Namespace, id: &Value) -> Option<Document> {
        self.collections
            .write()
            .get_mut(ns)
            .and_then(|coll| coll.remove(id))
    }

    /// Apply a replicated entry.
    pub fn apply(&self, entry: &OplogEntry) -> Result<()> {
        match &entry.kind {
            OpKind::Upsert(doc) => self.upsert(&entry.ns, doc.clone()),
            OpKind::Delete(id) => {
                self.delete(&entry.ns, id);
                Ok(())
            }
        }
    }

    pub fn get(&self, ns: &Namespace, id: &Value) -> Option<Document> {
        self.collections
            .read()
            .get(ns)
            .and_then(|coll| coll.get(id).cloned())
    }

    /// Number of documents in a collection.
    pub fn count(&self, ns: &Namespace) -> usize {
        self.collections.read().get(ns).map(|c| c.len()).unwrap_or(0)
    }

    /// All documents of a collection in `_id` order.
    pub fn documents(&self, ns: &Namespace) -> Vec<Document> {
        self.collections
            .read()
            .get(ns)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Documents whose shard key lies in `range`, sorted by shard key.
    pub fn scan_range(
        &self,
        ns: &Namespace,
        pattern: &ShardKeyPattern,
        range: &ChunkRange,
    ) -> Vec<(ShardKey, Document)> {
        let collections = self.collections.read();
        let Some(coll) = collections.get(ns) else {
            return Vec::new();
        };
        let mut found: Vec<(ShardKey, Document)> = coll
            .values()
            .filter_map(|doc| {
                let key = pattern.extract_key(doc);
                range.contains(&key).then(|| (key, doc.clone()))
            })
            .collect();
        drop(collections);
        found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id().cmp(&b.1.id())));
        found
    }

    /// Number of documents whose shard key lies in `range`.
    pub fn count_in_range(&self, ns: &Namespace, pattern: &ShardKeyPattern, range: &ChunkRange) -> usize {
        self.collections
            .read()
            .get(ns)
            .map(|coll| {
                coll.values()
                    .filter(|doc| range.contains(&pattern.extract_key(doc)))
                    .count()
            })
            .unwrap_or(0)
    }
}
