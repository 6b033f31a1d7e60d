use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

/// One JSON file per (feature, version), named `{feature}_{version}.json`.
#[derive(Debug, Clone)]
pub struct ManifestCache {
    dir: PathBuf,
}

impl ManifestCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, feature: &str, version: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.json", feature, version))
    }

    /// Cached body, if present and a JSON object. Anything else is removed
    /// so the caller fetches a fresh copy.
    pub fn read(&self, feature: &str, version: &str) -> Option<String> {
        let path = self.path_for(feature, version);
        let body = match fs::read_to_string(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read cached manifest");
                return None;
            }
        };
        let problem = match serde_json::from_str::<Value>(&body) {
            Ok(Value::Object(_)) => None,
            Ok(_) => Some("manifest root is not an object".to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(problem) = problem {
            warn!(path = %path.display(), error = %problem, "cached manifest is corrupt, discarding it");
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "could not remove corrupt manifest");
            }
            return None;
        }
        debug!(feature, version, "manifest cache hit");
        Some(body)
    }

    pub fn write(&self, feature: &str, version: &str, body: &str) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(feature, version);
        fs::write(&path, body)?;
        Ok(path)
    }

    /// Delete every cached version of `feature` other than `keep`.
    /// Failures are logged per file. Returns the number of removed files.
    pub fn remove_stale(&self, feature: &str, keep: &str) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "could not list manifest cache");
                return 0;
            }
        };

        let prefix = format!("{}_", feature);
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(version) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            // `{feature}_{other}_{version}.json` belongs to another feature
            if version == keep || version.contains('_') {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(feature, version, "removed stale manifest");
                    removed += 1;
                }
                Err(e) => warn!(path = %entry.path().display(), error = %e, "could not remove stale manifest"),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let cache = ManifestCache::new(dir.path().join("nested"));
        assert!(cache.read("checkout", "3").is_none());
        let path = cache.write("checkout", "3", r#"{"componentConfigs":[]}"#).unwrap();
        assert!(path.ends_with("checkout_3.json"));
        assert_eq!(cache.read("checkout", "3").as_deref(), Some(r#"{"componentConfigs":[]}"#));
    }

    #[test]
    fn test_corrupt_entry_is_a_miss_and_removed() {
        let dir = TempDir::new().unwrap();
        let cache = ManifestCache::new(dir.path());
        let path = cache.write("checkout", "3", "{oops").unwrap();
        assert!(cache.read("checkout", "3").is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_non_object_entry_is_a_miss_and_removed() {
        let dir = TempDir::new().unwrap();
        let cache = ManifestCache::new(dir.path());
        for (version, body) in [("1", "[]"), ("2", "null"), ("3", "\"text\"")] {
            let path = cache.write("bad", version, body).unwrap();
            assert!(cache.read("bad", version).is_none());
            assert!(!path.exists());
        }
    }

    #[test]
    fn test_remove_stale_keeps_current_and_other_features() {
        let dir = TempDir::new().unwrap();
        let cache = ManifestCache::new(dir.path());
        for (feature, version) in [("checkout", "1"), ("checkout", "2"), ("checkout", "3"), ("checkout_v2", "1"), ("promo", "1")] {
            cache.write(feature, version, "{}").unwrap();
        }
        assert_eq!(cache.remove_stale("checkout", "3"), 2);
        assert!(cache.path_for("checkout", "3").exists());
        assert!(!cache.path_for("checkout", "1").exists());
        assert!(cache.path_for("checkout_v2", "1").exists());
        assert!(cache.path_for("promo", "1").exists());
    }

    #[test]
    fn test_remove_stale_without_dir() {
        let dir = TempDir::new().unwrap();
        let cache = ManifestCache::new(dir.path().join("missing"));
        assert_eq!(cache.remove_stale("checkout", "1"), 0);
    }
}
