//! CANOPY - Filesystem Helpers
//! Atomic replacement, hard-link trees and directory removal.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::Result;

/// Replace `path` with `bytes` through a temporary file and a rename.
/// The file gets a fresh inode, so hard links to the old file keep the old contents.
pub fn write_atomically(path: &Path, bytes: &[u8], sync: bool) -> Result<()> {
    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        if sync {
            file.sync_all()?;
        }
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Sibling path with a `.tmp` suffix appended.
pub fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    name.into()
}

/// Recreate the directory tree of `source` under `target`, hard-linking every file.
/// A missing source is treated as an empty tree.
pub fn hard_link_tree(source: &Path, target: &Path) -> Result<()> {
    if !source.exists() {
        fs::create_dir_all(target)?;
        return Ok(());
    }
    if source.is_file() {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::hard_link(source, target)?;
        return Ok(());
    }
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        hard_link_tree(&entry.path(), &target.join(entry.file_name()))?;
    }
    Ok(())
}

/// Replace `path` with a private copy of itself so that writes through it cannot reach
/// other hard links to the same file.
pub fn unshare_file(path: &Path) -> Result<()> {
    let tmp = tmp_path(path);
    fs::copy(path, &tmp)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Delete a directory and everything in it. Missing directories are fine.
pub fn delete_directory_and_contents(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomically_breaks_hard_link() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("meta");
        let linked = dir.path().join("meta.link");
        fs::write(&original, b"v1").unwrap();
        fs::hard_link(&original, &linked).unwrap();

        write_atomically(&linked, b"v2", false).unwrap();

        assert_eq!(fs::read(&original).unwrap(), b"v1");
        assert_eq!(fs::read(&linked).unwrap(), b"v2");
    }

    #[test]
    fn test_hard_link_tree_copies_structure() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("a/b")).unwrap();
        fs::write(src.join("a/b/file"), b"data").unwrap();
        fs::write(src.join("top"), b"top").unwrap();

        let dst = dir.path().join("dst");
        hard_link_tree(&src, &dst).unwrap();

        assert_eq!(fs::read(dst.join("a/b/file")).unwrap(), b"data");
        assert_eq!(fs::read(dst.join("top")).unwrap(), b"top");
    }

    #[test]
    fn test_unshare_file_detaches_links() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"same").unwrap();
        fs::hard_link(&a, &b).unwrap();

        unshare_file(&b).unwrap();
        fs::OpenOptions::new()
            .write(true)
            .open(&b)
            .unwrap()
            .write_all(b"diff")
            .unwrap();

        assert_eq!(fs::read(&a).unwrap(), b"same");
        assert_eq!(fs::read(&b).unwrap(), b"diff");
    }

    #[test]
    fn test_delete_missing_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(delete_directory_and_contents(&dir.path().join("nope")).is_ok());
    }
}
