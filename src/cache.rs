//! Folder-level "already processed" markers.
//!
//! A marker is an empty file in the cache directory. Its name is the folder
//! absolute path with separators stripped (for humans) followed by the
//! SHA-256 of the absolute path string (for uniqueness):
//!
//! ```text
//! /data/inbox/2024/03  →  datainbox202403__5f1c…e9
//! ```
//!
//! Relative paths are resolved first, so a folder gets the same marker
//! whatever the working directory. Only the existence of the file matters. Markers are written after a whole
//! folder uploaded successfully and removed by [`ScanCache::invalidate`].
//! Individual files are deduplicated by the upload ledger, not here.

use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};

use crate::config::ScanConfig;

#[derive(Debug, Clone)]
pub struct ScanCache {
    dir: PathBuf,
    enabled: bool,
}

impl ScanCache {
    pub fn new(dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            dir: dir.into(),
            enabled,
        }
    }

    pub fn from_config(config: &ScanConfig) -> Self {
        Self::new(&config.cache_dir, config.cache_enabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// File name of the marker for `folder`.
    pub fn marker_name(folder: &Path) -> String {
        let resolved = absolute_path(folder);
        let path = resolved.to_string_lossy();
        let readable: String = path
            .chars()
            .filter(|c| !matches!(c, '/' | '\\' | ':'))
            .collect();
        let digest = Sha256::digest(path.as_bytes());
        format!("{}__{}", readable, hex::encode(digest))
    }

    pub fn marker_path(&self, folder: &Path) -> PathBuf {
        self.dir.join(Self::marker_name(folder))
    }

    /// Looks the marker up, surfacing filesystem faults.
    ///
    /// A disabled cache always answers `Ok(false)`.
    pub fn lookup(&self, folder: &Path) -> io::Result<bool> {
        if !self.enabled {
            return Ok(false);
        }
        self.marker_path(folder).try_exists()
    }

    /// Whether `folder` was fully processed. Lookup faults count as "not
    /// processed" so that a broken cache never blocks uploads.
    pub fn is_processed(&self, folder: &Path) -> bool {
        match self.lookup(folder) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(folder = %folder.display(), error = %e, "cache lookup failed, treating folder as unprocessed");
                false
            }
        }
    }

    pub fn mark_processed(&self, folder: &Path) -> io::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.marker_path(folder), [])?;
        tracing::info!(folder = %folder.display(), "folder marked as processed");
        Ok(())
    }

    /// Removes the marker so the next pass processes `folder` again.
    ///
    /// Works even while the cache is disabled. Returns whether a marker existed.
    pub fn invalidate(&self, folder: &Path) -> io::Result<bool> {
        match std::fs::remove_file(self.marker_path(folder)) {
            Ok(()) => {
                tracing::info!(folder = %folder.display(), "cache marker removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Canonical form of `path` when it exists, else joined onto the working
/// directory.
fn absolute_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marker_name_shape() {
        let name = ScanCache::marker_name(Path::new("/data/inbox/2024/03"));
        let (readable, digest) = name.split_once("__").unwrap();
        assert_eq!(readable, "datainbox202403");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_marker_name_distinguishes_paths() {
        // Same readable prefix, different hash.
        let a = ScanCache::marker_name(Path::new("/a/b"));
        let b = ScanCache::marker_name(Path::new("/ab"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_relative_and_absolute_share_marker() {
        let tmp = TempDir::new().unwrap();
        let cache = ScanCache::new(tmp.path().join("cache"), true);
        let relative = Path::new("kbsync-unmarked-inbox").join("2024").join("03");
        let absolute = std::env::current_dir().unwrap().join(&relative);

        assert_eq!(
            ScanCache::marker_name(&relative),
            ScanCache::marker_name(&absolute)
        );
        cache.mark_processed(&relative).unwrap();
        assert!(cache.is_processed(&absolute));
        assert!(cache.invalidate(&absolute).unwrap());
        assert!(!cache.is_processed(&relative));
    }

    #[test]
    fn test_existing_folder_marker_is_canonical() {
        let tmp = TempDir::new().unwrap();
        let folder = tmp.path().join("inbox").join("2024").join("03");
        std::fs::create_dir_all(&folder).unwrap();
        let dotted = tmp.path().join("inbox").join("2024").join(".").join("03");
        assert_eq!(
            ScanCache::marker_name(&dotted),
            ScanCache::marker_name(&folder)
        );
    }

    #[test]
    fn test_mark_then_invalidate() {
        let tmp = TempDir::new().unwrap();
        let cache = ScanCache::new(tmp.path().join("cache"), true);
        let folder = Path::new("/inbox/2024/03");

        assert!(!cache.is_processed(folder));
        cache.mark_processed(folder).unwrap();
        assert!(cache.is_processed(folder));
        assert_eq!(std::fs::metadata(cache.marker_path(folder)).unwrap().len(), 0);

        assert!(cache.invalidate(folder).unwrap());
        assert!(!cache.is_processed(folder));
        assert!(!cache.invalidate(folder).unwrap());
    }

    #[test]
    fn test_disabled_cache() {
        let tmp = TempDir::new().unwrap();
        let cache = ScanCache::new(tmp.path().join("cache"), false);
        let folder = Path::new("/inbox/2024/03");
        cache.mark_processed(folder).unwrap();
        assert!(!cache.is_processed(folder));
        assert!(!tmp.path().join("cache").exists());
    }

    #[test]
    fn test_lookup_fault_fails_open() {
        let tmp = TempDir::new().unwrap();
        // The cache "directory" is a regular file, so lookups inside it fail.
        let blocker = tmp.path().join("cache");
        std::fs::write(&blocker, b"x").unwrap();
        let cache = ScanCache::new(&blocker, true);
        let folder = Path::new("/inbox/2024/03");

        assert!(cache.mark_processed(folder).is_err());
        assert!(!cache.is_processed(folder));
    }
}
