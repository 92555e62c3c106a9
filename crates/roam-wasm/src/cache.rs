//! Reference-counted store of loaded behavior modules.
//!
//! The cache keeps one entry per module name: the validated module (bytes
//! plus lazily compiled form) and a reference count of the resident agents
//! using it. When the count drops to zero the entry is not evicted
//! immediately but scheduled for removal after a grace delay, so an agent
//! that migrates away and back quickly finds its code still warm.

use crate::error::WasmError;
use crate::module::BehaviorModule;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use wasmtime::Engine;

struct CacheEntry {
    module: BehaviorModule,
    refs: usize,
}

/// Reference-counted store of behavior modules and their byte form
#[derive(Clone)]
pub struct CodeCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    search_paths: Arc<Vec<PathBuf>>,
    grace: Duration,
}

impl CodeCache {
    /// Create a cache searching `search_paths` (in order) for module files
    /// named `<name>.wasm`, with the given eviction grace delay.
    pub fn new(search_paths: Vec<PathBuf>, grace: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            search_paths: Arc::new(search_paths),
            grace,
        }
    }

    /// Resolve a module for a new resident instance.
    ///
    /// A cache hit returns the same cached unit and increments its
    /// reference count. On a miss the local search paths are tried; a disk
    /// hit is defined into the cache with a count of one. Returns `None`
    /// when the module is known nowhere locally.
    pub fn resolve(&self, name: &str, engine: &Engine) -> Result<Option<BehaviorModule>, WasmError> {
        {
            let mut entries = self.entries.lock().expect("code cache lock poisoned");
            if let Some(entry) = entries.get_mut(name) {
                entry.module.get_compiled(engine)?;
                entry.refs += 1;
                debug!(module = name, refs = entry.refs, "code cache hit");
                return Ok(Some(entry.module.clone()));
            }
        }

        match self.disk_bytes(name) {
            Some(bytes) => self.define(name, bytes, engine).map(Some),
            None => Ok(None),
        }
    }

    /// Define a module from bytes and acquire one reference to it.
    ///
    /// If an entry already exists (a concurrent define won the race), the
    /// existing unit is kept and its count incremented.
    pub fn define(
        &self,
        name: &str,
        bytes: Vec<u8>,
        engine: &Engine,
    ) -> Result<BehaviorModule, WasmError> {
        let mut module = BehaviorModule::from_bytes(bytes)?;
        module.get_compiled(engine)?;

        let mut entries = self.entries.lock().expect("code cache lock poisoned");
        let entry = entries.entry(name.to_string()).or_insert(CacheEntry {
            module,
            refs: 0,
        });
        entry.refs += 1;
        debug!(module = name, refs = entry.refs, "module defined");
        Ok(entry.module.clone())
    }

    /// Release one reference to a module.
    ///
    /// At zero the entry is scheduled for eviction after the grace delay;
    /// a re-acquire before the delay elapses cancels the eviction.
    pub fn release(&self, name: &str) {
        let mut entries = self.entries.lock().expect("code cache lock poisoned");
        match entries.get_mut(name) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                debug!(module = name, refs = entry.refs, "module released");
                if entry.refs == 0 {
                    self.schedule_eviction(name.to_string());
                }
            }
            None => warn!(module = name, "release of unknown module"),
        }
    }

    fn schedule_eviction(&self, name: String) {
        let entries = Arc::clone(&self.entries);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut entries = entries.lock().expect("code cache lock poisoned");
            if let Some(entry) = entries.get(&name) {
                if entry.refs == 0 {
                    entries.remove(&name);
                    debug!(module = %name, "module evicted");
                }
            }
        });
    }

    /// The byte form of a module, for serving GET_CLASS requests.
    ///
    /// Looks in the cache first, then in the search paths; a disk hit is
    /// memoized (with a zero count) so concurrent requests converge on
    /// exactly one entry. Does not touch reference counts.
    pub fn bytes(&self, name: &str) -> Option<Vec<u8>> {
        {
            let entries = self.entries.lock().expect("code cache lock poisoned");
            if let Some(entry) = entries.get(name) {
                return Some(entry.module.bytes.clone());
            }
        }

        let bytes = self.disk_bytes(name)?;
        let module = match BehaviorModule::from_bytes(bytes) {
            Ok(module) => module,
            Err(e) => {
                warn!(module = name, "module file on disk is invalid: {}", e);
                return None;
            }
        };

        let mut entries = self.entries.lock().expect("code cache lock poisoned");
        let entry = entries
            .entry(name.to_string())
            .or_insert(CacheEntry { module, refs: 0 });
        Some(entry.module.bytes.clone())
    }

    /// Whether an entry for `name` currently exists
    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .lock()
            .expect("code cache lock poisoned")
            .contains_key(name)
    }

    /// Current reference count of `name`, if present
    pub fn refs(&self, name: &str) -> Option<usize> {
        self.entries
            .lock()
            .expect("code cache lock poisoned")
            .get(name)
            .map(|e| e.refs)
    }

    fn disk_bytes(&self, name: &str) -> Option<Vec<u8>> {
        for dir in self.search_paths.iter() {
            let candidate = dir.join(format!("{}.wasm", name));
            if candidate.exists() {
                match std::fs::read(&candidate) {
                    Ok(bytes) => {
                        debug!(module = name, path = %candidate.display(), "module loaded from disk");
                        return Some(bytes);
                    }
                    Err(e) => {
                        warn!(module = name, path = %candidate.display(), "module file unreadable: {}", e);
                        return None;
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_modules::idle_agent_wasm;
    use tempfile::TempDir;
    use tokio::time::{sleep, Duration};

    fn module_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("demo.idle.wasm"), idle_agent_wasm()).unwrap();
        dir
    }

    fn cache(dir: &TempDir, grace: Duration) -> CodeCache {
        CodeCache::new(vec![dir.path().to_path_buf()], grace)
    }

    #[tokio::test]
    async fn test_resolve_twice_returns_same_unit_with_growing_refcount() {
        let dir = module_dir();
        let cache = cache(&dir, Duration::from_secs(10));
        let engine = Engine::default();

        let first = cache.resolve("demo.idle", &engine).unwrap().unwrap();
        assert_eq!(cache.refs("demo.idle"), Some(1));

        let second = cache.resolve("demo.idle", &engine).unwrap().unwrap();
        assert_eq!(cache.refs("demo.idle"), Some(2));

        assert_eq!(first.hash(), second.hash());
    }

    #[tokio::test]
    async fn test_resolve_unknown_module_is_none() {
        let dir = module_dir();
        let cache = cache(&dir, Duration::from_secs(10));
        let engine = Engine::default();

        assert!(cache.resolve("demo.missing", &engine).unwrap().is_none());
        assert!(!cache.contains("demo.missing"));
    }

    #[tokio::test]
    async fn test_entry_survives_within_grace_delay() {
        let dir = module_dir();
        let cache = cache(&dir, Duration::from_millis(150));
        let engine = Engine::default();

        cache.resolve("demo.idle", &engine).unwrap().unwrap();
        cache.release("demo.idle");
        assert_eq!(cache.refs("demo.idle"), Some(0));

        sleep(Duration::from_millis(30)).await;
        assert!(cache.contains("demo.idle"));
        assert!(cache.bytes("demo.idle").is_some());

        sleep(Duration::from_millis(300)).await;
        assert!(!cache.contains("demo.idle"));
    }

    #[tokio::test]
    async fn test_reacquire_cancels_eviction() {
        let dir = module_dir();
        let cache = cache(&dir, Duration::from_millis(100));
        let engine = Engine::default();

        cache.resolve("demo.idle", &engine).unwrap().unwrap();
        cache.release("demo.idle");

        // back before the grace delay elapses
        cache.resolve("demo.idle", &engine).unwrap().unwrap();
        assert_eq!(cache.refs("demo.idle"), Some(1));

        sleep(Duration::from_millis(300)).await;
        assert!(cache.contains("demo.idle"));
        assert_eq!(cache.refs("demo.idle"), Some(1));
    }

    #[tokio::test]
    async fn test_concurrent_byte_requests_converge_on_one_entry() {
        let dir = module_dir();
        let cache = cache(&dir, Duration::from_secs(10));

        let c1 = cache.clone();
        let c2 = cache.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { c1.bytes("demo.idle") }),
            tokio::spawn(async move { c2.bytes("demo.idle") }),
        );
        assert!(a.unwrap().is_some());
        assert!(b.unwrap().is_some());

        assert!(cache.contains("demo.idle"));
        assert_eq!(cache.refs("demo.idle"), Some(0));

        // both subsequent loads are reflected in the count of the one entry
        let engine = Engine::default();
        cache.resolve("demo.idle", &engine).unwrap().unwrap();
        cache.resolve("demo.idle", &engine).unwrap().unwrap();
        assert_eq!(cache.refs("demo.idle"), Some(2));
    }

    #[tokio::test]
    async fn test_release_of_unknown_module_is_harmless() {
        let dir = module_dir();
        let cache = cache(&dir, Duration::from_secs(10));
        cache.release("demo.never-loaded");
    }

    #[tokio::test]
    async fn test_bytes_for_unknown_module_is_none() {
        let dir = module_dir();
        let cache = cache(&dir, Duration::from_secs(10));
        assert!(cache.bytes("demo.missing").is_none());
    }
}
