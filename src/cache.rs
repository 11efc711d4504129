//! # Key Cache
//!
//! Tokens already known to this process, keyed by core-only fingerprint.
//! Validation consults the cache to detect impersonation: a node token whose
//! fingerprint matches a known handshake token must carry the same key.
//!
//! The cache is bounded; [`MemoryKeyCache`] evicts least-recently-used entries
//! when full.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;
use tracing::trace;

use crate::identity::Fingerprint;
use crate::token::Token;

/// Default capacity of [`MemoryKeyCache`].
pub const KEY_CACHE_MAX_ENTRIES: usize = 4096;

/// Read access to known tokens, as needed by validation.
pub trait KeyCache: Send + Sync {
    fn lookup(&self, fingerprint: &Fingerprint) -> Option<Arc<Token>>;
}

/// Cache that knows nothing. Validation runs without the impersonation
/// cross-check.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeyCache;

impl KeyCache for NoKeyCache {
    fn lookup(&self, _fingerprint: &Fingerprint) -> Option<Arc<Token>> {
        None
    }
}

pub struct MemoryKeyCache {
    entries: Mutex<LruCache<Fingerprint, Arc<Token>>>,
}

impl Default for MemoryKeyCache {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(KEY_CACHE_MAX_ENTRIES).unwrap_or(NonZeroUsize::MIN))
    }
}

impl MemoryKeyCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Store `token` under an explicit fingerprint. Returns the entry it
    /// replaced, if any.
    pub fn insert(&self, fingerprint: Fingerprint, token: Arc<Token>) -> Option<Arc<Token>> {
        trace!(fingerprint = ?fingerprint, uuid = %token.uuid(), "caching token");
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.put(fingerprint, token)
    }

    /// Store `token` under its own core-only fingerprint.
    pub fn insert_token(&self, token: Arc<Token>) -> Fingerprint {
        let fingerprint = token.fingerprint(false);
        self.insert(fingerprint, token);
        fingerprint
    }

    pub fn remove(&self, fingerprint: &Fingerprint) -> Option<Arc<Token>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.pop(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyCache for MemoryKeyCache {
    fn lookup(&self, fingerprint: &Fingerprint) -> Option<Arc<Token>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(fingerprint).cloned()
    }
}

impl std::fmt::Debug for MemoryKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyCache")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn token() -> Arc<Token> {
        Arc::new(Token::handshake(Keypair::generate(), "node").unwrap())
    }

    #[test]
    fn insert_and_lookup() {
        let cache = MemoryKeyCache::default();
        let t = token();
        let fp = cache.insert_token(t.clone());

        let found = cache.lookup(&fp).unwrap();
        assert!(Arc::ptr_eq(&found, &t));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = MemoryKeyCache::new(NonZeroUsize::new(2).unwrap());
        let a = cache.insert_token(token());
        let b = cache.insert_token(token());

        // Touch `a` so `b` becomes the eviction candidate.
        assert!(cache.lookup(&a).is_some());
        let c = cache.insert_token(token());

        assert!(cache.lookup(&a).is_some());
        assert!(cache.lookup(&b).is_none());
        assert!(cache.lookup(&c).is_some());
    }

    #[test]
    fn remove_entry() {
        let cache = MemoryKeyCache::default();
        let fp = cache.insert_token(token());

        assert!(cache.remove(&fp).is_some());
        assert!(cache.is_empty());
    }

    #[test]
    fn no_cache_never_finds() {
        assert!(NoKeyCache.lookup(&Fingerprint::from_bytes([0u8; 32])).is_none());
    }
}
