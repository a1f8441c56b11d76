//! Content-addressed artifact cache
//!
//! Lookups go straight to a `DashMap` and only touch the shard holding the
//! key; hit and miss counts are plain atomics. Stores and evictions are serialized by a separate lock so capacity
//! accounting stays exact without blocking readers. Entries are handed out as
//! `Arc`s: evicting an artifact never invalidates a context still running it.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::artifact::LoadedArtifact;

/// Evictions of artifacts at least this large are logged as warnings
const LARGE_ARTIFACT_BYTES: usize = 16 * 1024 * 1024;

/// Identity of a compiled artifact: the bytecode plus the engine fingerprint
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Hash `bytecode` together with the fingerprint of the engine that
    /// compiles it, so artifacts never outlive a codegen change
    pub fn new(bytecode: &[u8], engine_fingerprint: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((engine_fingerprint.len() as u64).to_le_bytes());
        hasher.update(engine_fingerprint.as_bytes());
        hasher.update(bytecode);
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({self})")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Lock-free counters behind [`CacheStats`]
#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheCounters {
    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

struct CacheEntry {
    artifact: Arc<LoadedArtifact>,
    size: usize,
    last_used: AtomicU64,
}

pub struct ArtifactCache {
    entries: DashMap<CacheKey, CacheEntry>,
    config: CacheConfig,
    /// Logical clock ordering uses for LRU
    clock: AtomicU64,
    total_bytes: AtomicUsize,
    stats: CacheCounters,
    store_lock: Mutex<()>,
}

impl ArtifactCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            clock: AtomicU64::new(0),
            total_bytes: AtomicUsize::new(0),
            stats: CacheCounters::default(),
            store_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<LoadedArtifact>> {
        let found = self.entries.get(key).map(|entry| {
            entry.last_used.store(self.tick(), Ordering::Relaxed);
            Arc::clone(&entry.artifact)
        });
        match found {
            Some(_) => {
                debug!(%key, "artifact cache hit");
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                debug!(%key, "artifact cache miss");
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        found
    }

    /// Insert `artifact` under `key`.
    ///
    /// Storing a key that is already present is a no-op: the cached artifact
    /// is kept and returned, so concurrent compilations of the same code all
    /// end up sharing one artifact.
    pub fn store(&self, key: CacheKey, artifact: Arc<LoadedArtifact>) -> Arc<LoadedArtifact> {
        let _guard = self
            .store_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = self.entries.get(&key) {
            existing.last_used.store(self.tick(), Ordering::Relaxed);
            return Arc::clone(&existing.artifact);
        }

        let size = artifact.size_bytes();
        self.entries.insert(
            key,
            CacheEntry {
                artifact: Arc::clone(&artifact),
                size,
                last_used: AtomicU64::new(self.tick()),
            },
        );
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        debug!(%key, size, "stored artifact");

        self.evict_over_capacity(&key);
        artifact
    }

    /// Evict least recently used entries until within capacity, never
    /// evicting `keep`
    fn evict_over_capacity(&self, keep: &CacheKey) {
        while self.entries.len() > self.config.max_entries
            || self.total_bytes.load(Ordering::Relaxed) > self.config.max_bytes
        {
            let victim = self
                .entries
                .iter()
                .filter(|entry| entry.key() != keep)
                .min_by_key(|entry| entry.last_used.load(Ordering::Relaxed))
                .map(|entry| *entry.key());
            let Some(victim) = victim else {
                break;
            };
            if let Some((key, entry)) = self.entries.remove(&victim) {
                self.total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                if entry.size >= LARGE_ARTIFACT_BYTES {
                    warn!(%key, size = entry.size, "evicted large artifact");
                } else {
                    debug!(%key, size = entry.size, "evicted artifact");
                }
            }
        }
    }

    /// Drop `key` from the cache; contexts holding the artifact keep it alive
    pub fn remove(&self, key: &CacheKey) -> Option<Arc<LoadedArtifact>> {
        let _guard = self
            .store_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (_, entry) = self.entries.remove(key)?;
        self.total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
        Some(entry.artifact)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }
}

impl Default for ArtifactCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use sysvm_cranelift::{CodegenConfig, compile_module};

    use super::*;

    fn artifact(text: &str) -> Arc<LoadedArtifact> {
        let bytes = wat::parse_str(text).unwrap();
        let module = sysvm_core::decode_module(&bytes).unwrap();
        let compiled = compile_module(&module, CodegenConfig::default(), 16).unwrap();
        Arc::new(LoadedArtifact::new(compiled).unwrap())
    }

    fn key(n: u8) -> CacheKey {
        CacheKey::new(&[n], "test")
    }

    #[test]
    fn test_key_depends_on_fingerprint() {
        let code = b"\0asm";
        assert_eq!(CacheKey::new(code, "v1"), CacheKey::new(code, "v1"));
        assert_ne!(CacheKey::new(code, "v1"), CacheKey::new(code, "v2"));
        assert_eq!(CacheKey::new(code, "v1").to_string().len(), 64);
    }

    #[test]
    fn test_store_then_lookup() {
        let cache = ArtifactCache::default();
        let stored = cache.store(key(1), artifact("(module (func))"));
        let found = cache.lookup(&key(1)).unwrap();
        assert!(Arc::ptr_eq(&stored, &found));
        assert!(cache.lookup(&key(2)).is_none());
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                evictions: 0
            }
        );
    }

    #[test]
    fn test_concurrent_lookups_are_all_counted() {
        let cache = ArtifactCache::default();
        cache.store(key(1), artifact("(module (func))"));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for n in 0..100 {
                        let hit = cache.lookup(&key(n % 2 + 1));
                        assert_eq!(hit.is_some(), n % 2 == 0);
                    }
                });
            }
        });

        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 400,
                misses: 400,
                evictions: 0
            }
        );
    }

    #[test]
    fn test_second_store_keeps_first_artifact() {
        let cache = ArtifactCache::default();
        let first = cache.store(key(1), artifact("(module (func))"));
        let second = cache.store(key(1), artifact("(module (func))"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), first.size_bytes());
    }

    #[test]
    fn test_least_recently_used_is_evicted() {
        let cache = ArtifactCache::new(CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        });
        cache.store(key(1), artifact("(module (func))"));
        cache.store(key(2), artifact("(module (func))"));
        cache.lookup(&key(1));
        cache.store(key(3), artifact("(module (func))"));

        assert!(cache.contains(&key(1)));
        assert!(!cache.contains(&key(2)));
        assert!(cache.contains(&key(3)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_oversized_artifact_is_kept_alone() {
        let cache = ArtifactCache::new(CacheConfig {
            max_entries: 8,
            max_bytes: 1,
        });
        cache.store(key(1), artifact("(module (func))"));
        cache.store(key(2), artifact("(module (func))"));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&key(2)));
    }

    #[test]
    fn test_eviction_keeps_handed_out_artifact_alive() {
        let cache = ArtifactCache::new(CacheConfig {
            max_entries: 1,
            ..CacheConfig::default()
        });
        let held = cache.store(key(1), artifact("(module (func))"));
        cache.store(key(2), artifact("(module (func))"));
        assert!(!cache.contains(&key(1)));
        assert!(!held.code().is_empty());
        assert_eq!(Arc::strong_count(&held), 1);
    }
}
