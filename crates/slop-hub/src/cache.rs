//! On-disk tool metadata cache.
//!
//! One JSON file maps server names to the tool list seen on their last
//! successful handshake, keyed by the descriptor fingerprint so a changed
//! descriptor never serves stale tools. Caching is best effort: a missing,
//! corrupt or outdated file reads as empty.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use slop_core::{fingerprint, ServerDescriptor};
use tracing::{debug, warn};

/// Schema version of the cache file.
pub const CACHE_VERSION: u32 = 1;

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One tool as known to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Server the tool belongs to.
    #[serde(default)]
    pub mcp_name: String,
    #[serde(default)]
    pub input_schema: Value,
}

/// Cached handshake result for one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub config_hash: String,
    pub server_name: String,
    #[serde(default)]
    pub server_version: String,
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
    pub cached_at: DateTime<Utc>,
}

/// The whole cache file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheFile {
    pub version: u32,
    #[serde(default)]
    pub entries: BTreeMap<String, CacheEntry>,
}

impl Default for CacheFile {
    fn default() -> Self {
        Self {
            version: CACHE_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// Disk-backed tool cache.
#[derive(Debug)]
pub struct ToolCache {
    path: PathBuf,
    lock: RwLock<()>,
}

impl ToolCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cache file. Any failure reads as an empty cache.
    pub fn load(&self) -> CacheFile {
        let _guard = self.lock.read();
        self.load_unlocked()
    }

    fn load_unlocked(&self) -> CacheFile {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to read tool cache");
                }
                return CacheFile::default();
            }
        };

        match serde_json::from_str::<CacheFile>(&content) {
            Ok(file) if file.version == CACHE_VERSION => file,
            Ok(file) => {
                debug!(
                    found = file.version,
                    expected = CACHE_VERSION,
                    "Ignoring tool cache with another schema version"
                );
                CacheFile::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring corrupt tool cache");
                CacheFile::default()
            }
        }
    }

    /// Write the whole file atomically.
    pub fn save(&self, file: &CacheFile) -> Result<(), CacheError> {
        let _guard = self.lock.write();
        self.save_unlocked(file)
    }

    fn save_unlocked(&self, file: &CacheFile) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(file)?;
        let tmp = self.tmp_path();
        std::fs::write(&tmp, content)?;

        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        debug!(path = %self.path.display(), entries = file.entries.len(), "Saved tool cache");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "tools.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    pub fn get_entry(&self, name: &str) -> Option<CacheEntry> {
        self.load().entries.remove(name)
    }

    /// Replace one entry. Concurrent setters serialize on the write lock.
    pub fn set_entry(&self, name: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let _guard = self.lock.write();
        let mut file = self.load_unlocked();
        file.entries.insert(name.to_string(), entry);
        self.save_unlocked(&file)
    }

    /// Drop one entry. Returns whether it existed.
    pub fn remove_entry(&self, name: &str) -> Result<bool, CacheError> {
        let _guard = self.lock.write();
        let mut file = self.load_unlocked();
        if file.entries.remove(name).is_none() {
            return Ok(false);
        }
        self.save_unlocked(&file)?;
        Ok(true)
    }

    /// Whether the cached entry for `name` was recorded for this exact
    /// descriptor.
    pub fn is_valid(&self, name: &str, descriptor: &ServerDescriptor) -> bool {
        self.get_entry(name)
            .map(|entry| entry.config_hash == fingerprint(descriptor))
            .unwrap_or(false)
    }

    /// Remove the cache file.
    pub fn clear(&self) -> Result<(), CacheError> {
        let _guard = self.lock.write();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn tool(server: &str, name: &str) -> ToolInfo {
        ToolInfo {
            name: name.to_string(),
            description: format!("{} tool", name),
            mcp_name: server.to_string(),
            input_schema: json!({"type": "object"}),
        }
    }

    fn entry(descriptor: &ServerDescriptor, tools: &[&str]) -> CacheEntry {
        CacheEntry {
            config_hash: fingerprint(descriptor),
            server_name: descriptor.name.clone(),
            server_version: "1.0.0".to_string(),
            tools: tools.iter().map(|t| tool(&descriptor.name, t)).collect(),
            cached_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cache = ToolCache::new(dir.path().join("cache").join("tools.json"));
        let fs = ServerDescriptor::stdio("fs", "fs-server");

        let mut file = CacheFile::default();
        file.entries.insert("fs".to_string(), entry(&fs, &["read", "write"]));
        cache.save(&file).unwrap();

        assert_eq!(cache.load(), file);
    }

    #[test]
    fn test_missing_and_corrupt_load_empty() {
        let dir = TempDir::new().unwrap();
        let cache = ToolCache::new(dir.path().join("tools.json"));
        assert!(cache.load().entries.is_empty());

        std::fs::write(cache.path(), "{ not json").unwrap();
        assert!(cache.load().entries.is_empty());
    }

    #[test]
    fn test_version_mismatch_loads_empty() {
        let dir = TempDir::new().unwrap();
        let cache = ToolCache::new(dir.path().join("tools.json"));
        let fs = ServerDescriptor::stdio("fs", "fs-server");

        let mut file = CacheFile {
            version: CACHE_VERSION + 1,
            entries: BTreeMap::new(),
        };
        file.entries.insert("fs".to_string(), entry(&fs, &["read"]));
        std::fs::write(cache.path(), serde_json::to_string(&file).unwrap()).unwrap();

        assert!(cache.load().entries.is_empty());
    }

    #[test]
    fn test_set_entry_leaves_no_tmp() {
        let dir = TempDir::new().unwrap();
        let cache = ToolCache::new(dir.path().join("tools.json"));
        let fs = ServerDescriptor::stdio("fs", "fs-server");

        cache.set_entry("fs", entry(&fs, &["read"])).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["tools.json"]);
    }

    #[test]
    fn test_is_valid_follows_fingerprint() {
        let dir = TempDir::new().unwrap();
        let cache = ToolCache::new(dir.path().join("tools.json"));
        let fs = ServerDescriptor::stdio("fs", "fs-server");
        cache.set_entry("fs", entry(&fs, &["read"])).unwrap();

        assert!(cache.is_valid("fs", &fs));
        assert!(cache.is_valid("fs", &fs.clone().with_timeout("5s")));
        assert!(!cache.is_valid("fs", &ServerDescriptor::stdio("fs", "fs-server-v2")));
        assert!(!cache.is_valid("other", &fs));
    }

    #[test]
    fn test_concurrent_setters_keep_every_entry() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ToolCache::new(dir.path().join("tools.json")));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let descriptor = ServerDescriptor::stdio(format!("s{}", i), "server");
                    cache
                        .set_entry(&descriptor.name, entry(&descriptor, &["t"]))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.load().entries.len(), 8);
    }

    #[test]
    fn test_remove_and_clear() {
        let dir = TempDir::new().unwrap();
        let cache = ToolCache::new(dir.path().join("tools.json"));
        let fs = ServerDescriptor::stdio("fs", "fs-server");
        cache.set_entry("fs", entry(&fs, &["read"])).unwrap();

        assert!(cache.remove_entry("fs").unwrap());
        assert!(!cache.remove_entry("fs").unwrap());

        cache.clear().unwrap();
        cache.clear().unwrap();
        assert!(!cache.path().exists());
    }
}
