//! Durable local cache.
//!
//! Survives process restarts and is shared by every session running under
//! the same user profile. Accumulators are keyed by order id so histories of
//! different orders never collide; the active assignment is keyed by machine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::accounting::PhaseAccumulators;
use crate::phase::{ActiveAssignment, MachineId, OrderId};

const CACHE_FILE: &str = "phase-cache.json";

/// Everything the cache holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDocument {
    #[serde(default)]
    pub orders: BTreeMap<OrderId, PhaseAccumulators>,
    #[serde(default)]
    pub assignments: BTreeMap<MachineId, ActiveAssignment>,
}

impl CacheDocument {
    pub fn accumulators(&self, order_id: &str) -> Option<&PhaseAccumulators> {
        self.orders.get(order_id)
    }

    pub fn assignment(&self, machine_id: &str) -> Option<&ActiveAssignment> {
        self.assignments.get(machine_id)
    }

    /// Record one transition's outcome for the order and its machine.
    pub fn record(&mut self, assignment: &ActiveAssignment, accumulators: &PhaseAccumulators) {
        self.orders
            .insert(assignment.order_id.clone(), accumulators.clone());
        if assignment.phase.is_terminal() {
            self.assignments.remove(&assignment.machine_id);
        } else {
            self.assignments
                .insert(assignment.machine_id.clone(), assignment.clone());
        }
    }

    pub fn clear_order(&mut self, order_id: &str) {
        self.orders.remove(order_id);
        self.assignments.retain(|_, a| a.order_id != order_id);
    }

    pub fn clear_assignment(&mut self, machine_id: &str) {
        self.assignments.remove(machine_id);
    }
}

/// Key/value persistence for phase timing.
pub trait DurableCache: Send + Sync {
    fn load(&self) -> Result<CacheDocument>;

    fn save(&self, doc: &CacheDocument) -> Result<()>;

    /// Read-modify-write the whole document.
    fn update(&self, f: &mut dyn FnMut(&mut CacheDocument)) -> Result<()> {
        let mut doc = self.load()?;
        f(&mut doc);
        self.save(&doc)
    }
}

/// JSON file cache in a per-profile directory.
#[derive(Debug, Clone)]
pub struct FileCache {
    path: PathBuf,
}

impl FileCache {
    /// Open a cache in `dir`, creating the directory if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create cache directory: {}", dir.display()))?;
        Ok(Self {
            path: dir.join(CACHE_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DurableCache for FileCache {
    fn load(&self) -> Result<CacheDocument> {
        if !self.path.exists() {
            return Ok(CacheDocument::default());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read cache file: {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(CacheDocument::default());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse cache file: {}", self.path.display()))
    }

    fn save(&self, doc: &CacheDocument) -> Result<()> {
        let json = serde_json::to_string_pretty(doc).context("Failed to serialize cache")?;
        // Write beside the target, then rename over it
        let tmp = self.path.with_extension("json.tmp");
        fs::File::create(&tmp)
            .and_then(|mut f| f.write_all(json.as_bytes()).and_then(|_| f.sync_all()))
            .with_context(|| format!("Failed to write cache file: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace cache file: {}", self.path.display()))?;
        Ok(())
    }
}

/// In-process cache; clones share the same document.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    inner: Arc<Mutex<CacheDocument>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableCache for MemoryCache {
    fn load(&self) -> Result<CacheDocument> {
        let doc = self
            .inner
            .lock()
            .map_err(|e| anyhow::anyhow!("Cache lock poisoned: {}", e))?;
        Ok(doc.clone())
    }

    fn save(&self, doc: &CacheDocument) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|e| anyhow::anyhow!("Cache lock poisoned: {}", e))?;
        *guard = doc.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn assignment(order: &str, phase: Phase) -> ActiveAssignment {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        let mut a = ActiveAssignment::begin_setup("M-01", order, "op-7", now);
        a.phase = phase;
        a
    }

    #[test]
    fn test_file_cache_empty_returns_default() {
        let dir = tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        assert_eq!(cache.load().unwrap(), CacheDocument::default());
    }

    #[test]
    fn test_file_cache_survives_reopen() {
        let dir = tempdir().unwrap();
        let a = assignment("O1", Phase::Production);
        let mut acc = PhaseAccumulators::started(a.phase_started_at);
        acc.setup_seconds = 120;

        {
            let cache = FileCache::open(dir.path()).unwrap();
            cache.update(&mut |doc| doc.record(&a, &acc)).unwrap();
        }

        let cache = FileCache::open(dir.path()).unwrap();
        let doc = cache.load().unwrap();
        assert_eq!(doc.accumulators("O1").unwrap().setup_seconds, 120);
        assert_eq!(doc.assignment("M-01").unwrap().phase, Phase::Production);
        assert!(!cache.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_record_terminal_phase_drops_machine_pointer() {
        let mut doc = CacheDocument::default();
        let acc = PhaseAccumulators::default();
        doc.record(&assignment("O1", Phase::Setup), &acc);
        assert!(doc.assignment("M-01").is_some());
        doc.record(&assignment("O1", Phase::Suspended), &acc);
        assert!(doc.assignment("M-01").is_none());
        assert!(doc.accumulators("O1").is_some());
    }

    #[test]
    fn test_orders_do_not_collide() {
        let mut doc = CacheDocument::default();
        let mut first = PhaseAccumulators::default();
        first.setup_seconds = 10;
        let mut second = PhaseAccumulators::default();
        second.setup_seconds = 20;
        doc.record(&assignment("O1", Phase::Setup), &first);
        doc.record(&assignment("O2", Phase::Setup), &second);
        assert_eq!(doc.accumulators("O1").unwrap().setup_seconds, 10);
        assert_eq!(doc.accumulators("O2").unwrap().setup_seconds, 20);
    }

    #[test]
    fn test_clear_order_removes_entries() {
        let mut doc = CacheDocument::default();
        doc.record(&assignment("O1", Phase::Setup), &PhaseAccumulators::default());
        doc.clear_order("O1");
        assert!(doc.accumulators("O1").is_none());
        assert!(doc.assignment("M-01").is_none());
    }

    #[test]
    fn test_memory_cache_clones_share_state() {
        let cache = MemoryCache::new();
        let other = cache.clone();
        cache
            .update(&mut |doc| {
                doc.record(&assignment("O1", Phase::Setup), &PhaseAccumulators::default())
            })
            .unwrap();
        assert!(other.load().unwrap().assignment("M-01").is_some());
    }

    #[test]
    fn test_file_cache_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        fs::write(cache.path(), "{not json").unwrap();
        let err = cache.load().unwrap_err();
        assert!(err.to_string().contains("Failed to parse cache file"));
    }
}
