//! File access for demos and maps.
//!
//! All paths are anchored at a single root directory. Maps live under
//! `maps/`; maps extracted from demos (or downloaded) are cached under
//! `downloadedmaps/`, named by map name plus content digest so different
//! versions of the same map coexist.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// Folder for canonical map files.
const MAPS_DIR: &str = "maps";
/// Cache folder for maps keyed by name + digest.
const DOWNLOADED_MAPS_DIR: &str = "downloadedmaps";

/// Root-anchored storage for demo and map files.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create storage rooted at `root`. The directory itself is not created.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a root-relative name.
    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    /// Open a root-relative file for reading.
    pub fn open_read(&self, relative: impl AsRef<Path>) -> io::Result<File> {
        File::open(self.path(relative))
    }

    /// Create a root-relative file for writing, creating parent folders.
    pub fn create_write(&self, relative: impl AsRef<Path>) -> io::Result<File> {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(path)
    }

    /// Cache file name for a map with a known SHA-256 digest.
    pub fn map_cache_name(map_name: &str, sha256: &[u8; 32]) -> String {
        format!("{}_{}.map", map_name, hex::encode(sha256))
    }

    /// Cache file name for a map known only by CRC.
    pub fn map_cache_name_crc(map_name: &str, crc: u32) -> String {
        format!("{map_name}_{crc:08x}.map")
    }

    /// Root-relative cache path for an extracted map.
    pub fn map_cache_path(map_name: &str, sha256: &[u8; 32]) -> PathBuf {
        Path::new(DOWNLOADED_MAPS_DIR).join(Self::map_cache_name(map_name, sha256))
    }

    /// Locate a map file by name and digest/CRC.
    ///
    /// Tried in order: the download cache keyed by name + digest (CRC when
    /// no digest is known), the canonical `maps/` folder, then a recursive
    /// search for `<name>.map` under `maps/`.
    pub fn find_map(&self, map_name: &str, sha256: Option<&[u8; 32]>, crc: u32) -> Option<PathBuf> {
        let cache_name = match sha256 {
            Some(sha) => Self::map_cache_name(map_name, sha),
            None => Self::map_cache_name_crc(map_name, crc),
        };
        let cached = self.path(Path::new(DOWNLOADED_MAPS_DIR).join(cache_name));
        if cached.is_file() {
            return Some(cached);
        }

        let canonical = self.path(Path::new(MAPS_DIR).join(format!("{map_name}.map")));
        if canonical.is_file() {
            return Some(canonical);
        }

        find_file(&self.path(MAPS_DIR), &format!("{map_name}.map"))
    }
}

/// Depth-first search for a file name under `dir`.
fn find_file(dir: &Path, file_name: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_file(&path, file_name) {
                return Some(found);
            }
        } else if path.file_name().is_some_and(|n| n == file_name) {
            return Some(path);
        }
    }
    None
}
