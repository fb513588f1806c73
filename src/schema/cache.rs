// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process cache of entity mappings.
//!
//! Loading a mapping costs a metadata query, and every sync page and
//! webhook event needs one. Entries expire after a TTL and are dropped
//! explicitly whenever the entity's schema is refreshed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use super::EntityMapping;

#[derive(Debug)]
pub struct MappingCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, (Arc<EntityMapping>, Instant)>>,
}

impl MappingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// A live entry, or `None` if absent or expired.
    pub fn get(&self, entity_key: &str) -> Option<Arc<EntityMapping>> {
        let hit = self
            .entries
            .read()
            .get(entity_key)
            .filter(|(_, stored_at)| stored_at.elapsed() < self.ttl)
            .map(|(mapping, _)| Arc::clone(mapping));
        crate::metrics::record_mapping_cache(hit.is_some());
        hit
    }

    pub fn insert(&self, mapping: Arc<EntityMapping>) {
        let key = mapping.entity.entity_key.clone();
        self.entries.write().insert(key, (mapping, Instant::now()));
    }

    pub fn invalidate(&self, entity_key: &str) {
        self.entries.write().remove(entity_key);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityDefinition;

    fn mapping(key: &str) -> Arc<EntityMapping> {
        Arc::new(EntityMapping {
            entity: EntityDefinition::from_key(key).unwrap(),
            fields: Vec::new(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = MappingCache::new(Duration::from_secs(300));
        cache.insert(mapping("deal"));
        assert!(cache.get("deal").is_some());

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(cache.get("deal").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("deal").is_none());
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = MappingCache::new(Duration::from_secs(300));
        cache.insert(mapping("deal"));
        cache.insert(mapping("dyn:1114"));
        assert_eq!(cache.len(), 2);

        cache.invalidate("deal");
        assert!(cache.get("deal").is_none());
        assert!(cache.get("dyn:1114").is_some());

        cache.clear();
        assert!(cache.is_empty());
    }
}
