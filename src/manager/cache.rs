//! Bounded node cache keyed by (chain id, node id).

use std::collections::HashMap;

use tracing::trace;

use crate::graph::ThoughtNode;

struct CacheEntry {
    node: ThoughtNode,
    access_count: u64,
}

/// Least-frequently-used cache of recently read nodes.
///
/// Eviction removes the entry with the lowest access count once the
/// capacity is exceeded. A capacity of zero disables caching entirely.
pub struct NodeCache {
    capacity: usize,
    entries: HashMap<(String, String), CacheEntry>,
}

impl NodeCache {
    /// Create a cache holding at most `capacity` nodes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
        }
    }

    /// Number of cached nodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace a node, evicting the least-used entry if full.
    pub fn insert(&mut self, chain_id: &str, node: ThoughtNode) {
        if self.capacity == 0 {
            return;
        }
        let key = (chain_id.to_string(), node.id.clone());
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_one();
        }
        self.entries.insert(
            key,
            CacheEntry {
                node,
                access_count: 1,
            },
        );
    }

    /// Fetch a cached node, bumping its access count.
    pub fn get(&mut self, chain_id: &str, node_id: &str) -> Option<&ThoughtNode> {
        let key = (chain_id.to_string(), node_id.to_string());
        let entry = self.entries.get_mut(&key)?;
        entry.access_count += 1;
        Some(&entry.node)
    }

    /// Drop a single cached node.
    pub fn remove(&mut self, chain_id: &str, node_id: &str) {
        self.entries
            .remove(&(chain_id.to_string(), node_id.to_string()));
    }

    /// Drop every cached node belonging to a chain.
    pub fn remove_chain(&mut self, chain_id: &str) {
        self.entries.retain(|(cid, _), _| cid != chain_id);
    }

    fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(key, entry)| (entry.access_count, key.0.clone(), key.1.clone()))
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            trace!(chain_id = %key.0, node_id = %key.1, "Evicting cached node");
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ThoughtKind;
    use serde_json::json;

    fn node(id: &str) -> ThoughtNode {
        ThoughtNode::new(ThoughtKind::Observation, json!({"text": id}), "agent-1")
            .unwrap()
            .with_id(id)
    }

    #[test]
    fn test_insert_and_get() {
        let mut cache = NodeCache::new(4);
        cache.insert("c1", node("n1"));
        assert_eq!(cache.get("c1", "n1").unwrap().id, "n1");
        assert!(cache.get("c2", "n1").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_prefers_least_accessed() {
        let mut cache = NodeCache::new(2);
        cache.insert("c1", node("hot"));
        cache.insert("c1", node("cold"));
        // Touch the hot entry a few times.
        cache.get("c1", "hot");
        cache.get("c1", "hot");

        cache.insert("c1", node("new"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("c1", "hot").is_some());
        assert!(cache.get("c1", "cold").is_none());
    }

    #[test]
    fn test_zero_capacity_disables_caching() {
        let mut cache = NodeCache::new(0);
        cache.insert("c1", node("n1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_chain_drops_only_that_chain() {
        let mut cache = NodeCache::new(8);
        cache.insert("c1", node("n1"));
        cache.insert("c1", node("n2"));
        cache.insert("c2", node("n1"));

        cache.remove_chain("c1");
        assert_eq!(cache.len(), 1);
        assert!(cache.get("c2", "n1").is_some());
    }
}
