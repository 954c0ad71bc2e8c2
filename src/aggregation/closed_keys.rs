//! Set of correlation keys that no longer accept items

use super::types::CorrelationKey;
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;

/// Closed-key set, either unbounded or a recency-evicting cache
pub enum ClosedKeys {
    Unbounded(HashSet<CorrelationKey>),
    Bounded(LruCache<CorrelationKey, ()>),
}

impl ClosedKeys {
    /// `capacity == 0` selects the unbounded set
    pub fn with_capacity(capacity: usize) -> Self {
        match NonZeroUsize::new(capacity) {
            Some(cap) => Self::Bounded(LruCache::new(cap)),
            None => Self::Unbounded(HashSet::new()),
        }
    }

    pub fn insert(&mut self, key: CorrelationKey) {
        match self {
            Self::Unbounded(keys) => {
                keys.insert(key);
            }
            Self::Bounded(cache) => {
                if let Some((evicted, _)) = cache.push(key.clone(), ()) {
                    if evicted != key {
                        log::debug!("Closed key {} evicted from bounded cache", evicted);
                    }
                }
            }
        }
    }

    /// Membership test; a hit refreshes recency in the bounded form
    pub fn contains(&mut self, key: &CorrelationKey) -> bool {
        match self {
            Self::Unbounded(keys) => keys.contains(key),
            Self::Bounded(cache) => cache.get(key).is_some(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Unbounded(keys) => keys.len(),
            Self::Bounded(cache) => cache.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        match self {
            Self::Unbounded(keys) => keys.clear(),
            Self::Bounded(cache) => cache.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_keeps_everything() {
        let mut keys = ClosedKeys::with_capacity(0);
        for i in 0..100 {
            keys.insert(CorrelationKey::Integer(i));
        }
        assert_eq!(keys.len(), 100);
        assert!(keys.contains(&CorrelationKey::Integer(0)));
    }

    #[test]
    fn test_bounded_evicts_least_recent() {
        let mut keys = ClosedKeys::with_capacity(2);
        keys.insert("a".into());
        keys.insert("b".into());

        // Touch "a" so "b" becomes the eviction candidate
        assert!(keys.contains(&"a".into()));
        keys.insert("c".into());

        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"a".into()));
        assert!(!keys.contains(&"b".into()));
        assert!(keys.contains(&"c".into()));
    }

    #[test]
    fn test_clear() {
        let mut keys = ClosedKeys::with_capacity(4);
        keys.insert("a".into());
        keys.clear();
        assert!(keys.is_empty());
    }
}
