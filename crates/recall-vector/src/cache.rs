use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

/// Cached embedding keyed by `(content_hash, embedder_id)`.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub content_hash: String,
    pub embedder_id: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Default)]
struct Inner {
    map: HashMap<(String, String), Vec<f32>>,
    order: VecDeque<(String, String)>,
}

/// Bounded embedding cache consulted before calling a provider and written
/// through on misses. Oldest entries are evicted first.
#[derive(Debug)]
pub struct EmbeddingCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, inner: Mutex::new(Inner::default()) }
    }

    pub async fn get_many(
        &self,
        embedder_id: &str,
        hashes: &[String],
    ) -> HashMap<String, Vec<f32>> {
        let inner = self.inner.lock().await;
        let mut out = HashMap::new();
        for h in hashes {
            if let Some(v) = inner.map.get(&(h.clone(), embedder_id.to_string())) {
                out.insert(h.clone(), v.clone());
            }
        }
        out
    }

    pub async fn put_many(&self, entries: Vec<CacheEntry>) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock().await;
        for e in entries {
            let key = (e.content_hash, e.embedder_id);
            if inner.map.insert(key.clone(), e.vector).is_none() {
                inner.order.push_back(key);
            }
            while inner.map.len() > self.capacity {
                let Some(oldest) = inner.order.pop_front() else { break };
                inner.map.remove(&oldest);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(h: &str, id: &str) -> CacheEntry {
        CacheEntry { content_hash: h.into(), embedder_id: id.into(), vector: vec![1.0] }
    }

    #[tokio::test]
    async fn keyed_by_hash_and_embedder() {
        let cache = EmbeddingCache::new(10);
        cache.put_many(vec![entry("h1", "hash:d1")]).await;
        assert_eq!(cache.get_many("hash:d1", &["h1".into()]).await.len(), 1);
        assert!(cache.get_many("other", &["h1".into()]).await.is_empty());
    }

    #[tokio::test]
    async fn evicts_oldest_beyond_capacity() {
        let cache = EmbeddingCache::new(2);
        cache.put_many(vec![entry("a", "e"), entry("b", "e"), entry("c", "e")]).await;
        assert_eq!(cache.len().await, 2);
        assert!(cache.get_many("e", &["a".into()]).await.is_empty());
        assert_eq!(cache.get_many("e", &["b".into(), "c".into()]).await.len(), 2);
    }
}
