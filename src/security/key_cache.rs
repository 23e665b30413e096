// src/security/key_cache.rs

use std::collections::HashMap;
use std::sync::Mutex;
use zeroize::Zeroizing;

/// Unwrapped content keys held for the life of the process.
///
/// Keys are zeroized when replaced, removed or dropped and are never written
/// anywhere. A later `store` for the same id replaces the earlier key.
#[derive(Default)]
pub struct KeyCache {
    keys: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl KeyCache {
    /// Creates an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the key stored under `id`
    pub fn get(&self, id: &str) -> Option<Zeroizing<Vec<u8>>> {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.get(id).cloned()
    }

    /// Stores `key` under `id`, replacing any previous key
    pub fn store(&self, id: &str, key: &[u8]) {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.insert(id.to_string(), Zeroizing::new(key.to_vec()));
    }

    /// Forgets the key stored under `id`
    pub fn remove(&self, id: &str) -> bool {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.remove(id).is_some()
    }

    /// Number of cached keys
    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache").field("entries", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_store_wins() {
        let cache = KeyCache::new();
        assert!(cache.get("img-1").is_none());

        cache.store("img-1", &[1u8; 32]);
        cache.store("img-1", &[2u8; 32]);

        assert_eq!(cache.get("img-1").unwrap().as_slice(), &[2u8; 32]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remove_forgets_key() {
        let cache = KeyCache::new();
        cache.store("img-1", b"secret");
        assert!(cache.remove("img-1"));
        assert!(!cache.remove("img-1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn debug_output_hides_key_material() {
        let cache = KeyCache::new();
        cache.store("img-1", b"top-secret");
        let rendered = format!("{:?}", cache);
        assert!(!rendered.contains("top-secret"));
        assert!(rendered.contains("entries: 1"));
    }
}
