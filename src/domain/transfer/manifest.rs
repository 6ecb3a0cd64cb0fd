use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::domain::transfer::hash::compute_sha256_sync;
use crate::error::{Error, Result};

/// One entry of a [`Manifest`]. Relative paths use `/` as separator and are
/// relative to the parent directory of the transferred path.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ManifestEntry {
    Directory { relative_path: String },
    File { relative_path: String, size: u64, hash: String },
}

/// Precomputed description of everything a directory or file-set transfer
/// moves: every directory to recreate and every file with its size and hash.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Walks every path once and hashes every file found. This reads all bytes
    /// of the tree, so it runs on the blocking pool.
    pub async fn build(paths: Vec<PathBuf>) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::for_paths(&paths))
            .await
            .map_err(|e| Error::IoError(std::io::Error::other(format!("manifest task failed: {e}"))))?
    }

    pub fn for_paths(paths: &[PathBuf]) -> Result<Self> {
        let mut entries = Vec::new();

        for path in paths {
            let base = path.parent().unwrap_or_else(|| Path::new(""));

            for entry in WalkDir::new(path).follow_links(true).sort_by_file_name() {
                let entry = entry.map_err(|e| Error::IoError(std::io::Error::other(e.to_string())))?;
                let relative_path = relative_string(base, entry.path())?;

                if entry.file_type().is_dir() {
                    entries.push(ManifestEntry::Directory { relative_path });
                } else if entry.file_type().is_file() {
                    let size = entry.metadata().map_err(|e| Error::IoError(std::io::Error::other(e.to_string())))?.len();
                    let hash = compute_sha256_sync(entry.path())?;
                    entries.push(ManifestEntry::File { relative_path, size, hash });
                } else {
                    log::warn!("Skipping '{}': neither a file nor a directory", entry.path().display());
                }
            }
        }

        Ok(Manifest { entries })
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, u64, &str)> {
        self.entries.iter().filter_map(|entry| match entry {
            ManifestEntry::File { relative_path, size, hash } => Some((relative_path.as_str(), *size, hash.as_str())),
            ManifestEntry::Directory { .. } => None,
        })
    }

    pub fn cumulated_size(&self) -> u64 {
        self.files().map(|(_, size, _)| size).sum()
    }

    /// Recreates every directory of the manifest below `root` (`mkdir -p`).
    pub fn create_directories(&self, root: &Path) -> Result<()> {
        fs::create_dir_all(root)?;
        for entry in &self.entries {
            if let ManifestEntry::Directory { relative_path } = entry {
                fs::create_dir_all(join_relative(root, relative_path)?)?;
            }
        }
        Ok(())
    }
}

fn relative_string(base: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(base)
        .map_err(|_| Error::ProtocolError(format!("'{}' is not below '{}'", path.display(), base.display())))?;

    let parts: Vec<String> = relative.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
    Ok(parts.join("/"))
}

/// Joins a manifest relative path onto `root`, refusing anything that could
/// leave `root` (absolute paths, `..`).
pub fn join_relative(root: &Path, relative_path: &str) -> Result<PathBuf> {
    let relative = Path::new(relative_path);
    if relative_path.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(Error::ProtocolError(format!("invalid relative path '{}'", relative_path)));
    }
    Ok(root.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_directory_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(data.join("sub/deeper")).unwrap();
        fs::write(data.join("a.txt"), b"alpha").unwrap();
        fs::write(data.join("sub/deeper/b.bin"), vec![1u8; 300]).unwrap();

        let manifest = Manifest::for_paths(&[data]).unwrap();

        let dirs: Vec<&ManifestEntry> = manifest.entries.iter().filter(|e| matches!(e, ManifestEntry::Directory { .. })).collect();
        assert_eq!(dirs.len(), 3);

        let files: Vec<(&str, u64)> = manifest.files().map(|(path, size, _)| (path, size)).collect();
        assert_eq!(files, vec![("data/a.txt", 5), ("data/sub/deeper/b.bin", 300)]);
        assert_eq!(manifest.cumulated_size(), 305);
    }

    #[test]
    fn test_file_set_is_relative_to_parent() {
        let dir = tempfile::tempdir().unwrap();
        let header = dir.path().join("scan.hdr");
        let image = dir.path().join("scan.img");
        fs::write(&header, b"hdr").unwrap();
        fs::write(&image, b"image-bytes").unwrap();

        let manifest = Manifest::for_paths(&[header, image]).unwrap();
        let names: Vec<&str> = manifest.files().map(|(path, _, _)| path).collect();

        assert_eq!(names, vec!["scan.hdr", "scan.img"]);
    }

    #[test]
    fn test_join_relative_rejects_escaping_paths() {
        let root = Path::new("/staging/3");

        assert!(join_relative(root, "../etc/passwd").is_err());
        assert!(join_relative(root, "/etc/passwd").is_err());
        assert!(join_relative(root, "").is_err());
        assert_eq!(join_relative(root, "data/a.txt").unwrap(), PathBuf::from("/staging/3/data/a.txt"));
    }

    #[test]
    fn test_create_directories_is_idempotent() {
        let source = tempfile::tempdir().unwrap();
        let data = source.path().join("tree");
        fs::create_dir_all(data.join("x/y")).unwrap();
        let manifest = Manifest::for_paths(&[data]).unwrap();

        let target = tempfile::tempdir().unwrap();
        manifest.create_directories(target.path()).unwrap();
        manifest.create_directories(target.path()).unwrap();

        assert!(target.path().join("tree/x/y").is_dir());
    }
}
