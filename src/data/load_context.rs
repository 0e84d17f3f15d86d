//! State shared by every item of one dataset load
//!
//! Both caches live exactly as long as the [`LoadContext`] that owns them;
//! nothing here is process-global.

use anyhow::{Context, Result};
use log::warn;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Image sizes keyed by file name, so headers are probed once per load
#[derive(Debug, Default, Clone)]
pub struct SizeCache {
    entries: HashMap<String, (u32, u32)>,
}

impl SizeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, filename: &str) -> Option<(u32, u32)> {
        self.entries.get(filename).copied()
    }

    pub fn insert(&mut self, filename: impl Into<String>, size: (u32, u32)) {
        self.entries.insert(filename.into(), size);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load a persisted cache. A missing file gives an empty cache.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read size cache: {}", path.display()))?;
        let entries: HashMap<String, (u32, u32)> = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse size cache: {}", path.display()))?;
        Ok(Self { entries })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.entries)?;
        fs::write(path, text)
            .with_context(|| format!("Failed to write size cache: {}", path.display()))?;
        Ok(())
    }
}

/// Emits each distinct warning message once
#[derive(Debug, Default)]
pub struct WarningLog {
    printed: HashSet<String>,
}

impl WarningLog {
    /// Returns true if the message was logged, false if it was a repeat.
    pub fn warn_once(&mut self, msg: &str) -> bool {
        if self.printed.contains(msg) {
            return false;
        }
        warn!("{}", msg);
        self.printed.insert(msg.to_string());
        true
    }

    pub fn count(&self) -> usize {
        self.printed.len()
    }
}

/// Explicit context for one dataset load
#[derive(Debug, Default)]
pub struct LoadContext {
    pub size_cache: SizeCache,
    pub warnings: WarningLog,
}

impl LoadContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size_cache(size_cache: SizeCache) -> Self {
        Self {
            size_cache,
            warnings: WarningLog::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warn_once_dedups_by_text() {
        let mut log = WarningLog::default();
        assert!(log.warn_once("slow path"));
        assert!(!log.warn_once("slow path"));
        assert!(log.warn_once("other"));
        assert_eq!(log.count(), 2);
    }

    #[test]
    fn test_size_cache_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".size_cache.json");

        // Missing file is an empty cache
        let mut cache = SizeCache::load(&path).unwrap();
        assert!(cache.is_empty());

        cache.insert("a.png", (640, 480));
        cache.insert("b.jpg", (512, 768));
        cache.save(&path).unwrap();

        let reloaded = SizeCache::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("a.png"), Some((640, 480)));
        assert_eq!(reloaded.get("missing.png"), None);
    }

    #[test]
    fn test_corrupt_size_cache_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".size_cache.json");
        fs::write(&path, "not json").unwrap();
        assert!(SizeCache::load(&path).is_err());
    }
}
