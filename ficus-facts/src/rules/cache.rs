//! Rule Script Cache
//!
//! Maps a logical script name to its compiled rule. Each name is compiled at
//! most once: concurrent loads of an uncached name elect one compiler while
//! the others wait on a condition variable for its result. Failed compiles
//! are not cached, so the next load retries.
//!
//! A cached name keeps its first compiled object even if later loads pass a
//! different source. Call [`RuleScriptCache::evict`] to force a recompile.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use sha2::{Digest, Sha256};

use super::compiler::compile;
use super::{Capability, RuleObject};
use crate::config::RuleCacheConfig;
use crate::error::{FactError, FactResult};

const ANONYMOUS: &str = "<anonymous>";

/// Compiled script stored under a name
struct RuleScriptEntry {
    name: String,
    capability: Capability,
    compiled: RuleObject,
    source_hash: [u8; 32],
}

/// Read-only view of a cached script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntryInfo {
    /// Cache key
    pub name: String,
    /// Capability the cached object serves
    pub capability: Capability,
    /// SHA-256 of the source the object was compiled from
    pub source_hash: [u8; 32],
}

impl RuleEntryInfo {
    /// Lowercase hex form of `source_hash`
    pub fn source_hash_hex(&self) -> String {
        self.source_hash.iter().map(|byte| format!("{:02x}", byte)).collect()
    }
}

enum CacheSlot {
    Compiling,
    Ready(Arc<RuleScriptEntry>),
}

/// Removes the in-progress marker if the compiler unwinds
struct CompileGuard<'a> {
    cache: &'a RuleScriptCache,
    name: &'a str,
    armed: bool,
}

impl Drop for CompileGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut slots = self.cache.slots.lock();
            if matches!(slots.get(self.name), Some(CacheSlot::Compiling)) {
                slots.remove(self.name);
            }
            self.cache.compiled.notify_all();
        }
    }
}

/// Compile-once cache of rule scripts
pub struct RuleScriptCache {
    config: RuleCacheConfig,
    slots: Mutex<HashMap<String, CacheSlot>>,
    compiled: Condvar,
    compilations: AtomicUsize,
}

impl RuleScriptCache {
    /// Create an empty cache
    pub fn new(config: RuleCacheConfig) -> FactResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            slots: Mutex::new(HashMap::new()),
            compiled: Condvar::new(),
            compilations: AtomicUsize::new(0),
        })
    }

    /// Load the rule serving `capability` from `source`
    ///
    /// With a `name`, the first successful compile is cached and returned to
    /// every later caller without looking at `source` again. Without a name
    /// the source is compiled on every call and never cached.
    ///
    /// Blocks while another thread compiles the same name; call it through
    /// `spawn_blocking` from async code.
    pub fn load(
        &self,
        name: Option<&str>,
        source: &str,
        capability: Capability,
    ) -> FactResult<RuleObject> {
        if source.trim().is_empty() {
            return Err(FactError::EmptySource);
        }

        let name = match name {
            Some(name) => name,
            None => return self.compile_script(ANONYMOUS, source, capability),
        };

        {
            let mut slots = self.slots.lock();
            loop {
                match slots.get(name) {
                    Some(CacheSlot::Ready(entry)) => {
                        debug!("Rule script {} served from cache", name);
                        return Self::serve(entry, capability);
                    }
                    Some(CacheSlot::Compiling) => self.compiled.wait(&mut slots),
                    None => break,
                }
            }
            slots.insert(name.to_string(), CacheSlot::Compiling);
        }

        let mut guard = CompileGuard {
            cache: self,
            name,
            armed: true,
        };
        let result = self.compile_script(name, source, capability);

        let mut slots = self.slots.lock();
        guard.armed = false;
        let outcome = match result {
            Ok(compiled) => {
                let mut source_hash = [0u8; 32];
                source_hash.copy_from_slice(&Sha256::digest(source.as_bytes()));
                let entry = Arc::new(RuleScriptEntry {
                    name: name.to_string(),
                    capability,
                    compiled: compiled.clone(),
                    source_hash,
                });
                slots.insert(name.to_string(), CacheSlot::Ready(entry));
                info!("Rule script {} compiled and cached as {}", name, capability);
                Ok(compiled)
            }
            Err(e) => {
                slots.remove(name);
                Err(e)
            }
        };
        drop(slots);
        self.compiled.notify_all();
        outcome
    }

    fn compile_script(
        &self,
        name: &str,
        source: &str,
        capability: Capability,
    ) -> FactResult<RuleObject> {
        self.compilations.fetch_add(1, Ordering::Relaxed);
        compile(name, source, capability, &self.config).map_err(|e| {
            warn!("Rule script {} failed to load: {}", name, e);
            e
        })
    }

    fn serve(entry: &RuleScriptEntry, capability: Capability) -> FactResult<RuleObject> {
        if entry.capability == capability {
            Ok(entry.compiled.clone())
        } else {
            Err(FactError::NoMatchingCapability {
                name: entry.name.clone(),
                capability,
            })
        }
    }

    /// Drop the cached entry for `name`
    ///
    /// Returns whether an entry was removed. A compile in progress is left
    /// alone.
    pub fn evict(&self, name: &str) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(name) {
            Some(CacheSlot::Ready(_)) => {
                slots.remove(name);
                info!("Rule script {} evicted", name);
                true
            }
            _ => false,
        }
    }

    /// Whether `name` has a cached entry
    pub fn contains(&self, name: &str) -> bool {
        matches!(self.slots.lock().get(name), Some(CacheSlot::Ready(_)))
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, CacheSlot::Ready(_)))
            .count()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, CacheSlot::Ready(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Describe the cached entry for `name`
    pub fn entry_info(&self, name: &str) -> Option<RuleEntryInfo> {
        match self.slots.lock().get(name) {
            Some(CacheSlot::Ready(entry)) => Some(RuleEntryInfo {
                name: entry.name.clone(),
                capability: entry.capability,
                source_hash: entry.source_hash,
            }),
            _ => None,
        }
    }

    /// Number of compiles run so far, failed and anonymous ones included
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for RuleScriptCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleScriptCache")
            .field("names", &self.names())
            .field("compilations", &self.compilations())
            .finish()
    }
}
