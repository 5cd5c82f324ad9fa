//! Inode numbers for virtual paths.
//!
//! The kernel protocol addresses nodes by inode while the filesystem core
//! works on paths, so every path the kernel has looked up gets a stable
//! number here. Paths are virtual and absolute (`/`, `/dir/file`).

use super::constants::{INITIAL_INODE, ROOT_INODE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
struct Tables {
    paths: HashMap<u64, PathBuf>,
    inodes: HashMap<PathBuf, u64>,
    next_inode: u64,
}

/// Bidirectional inode <-> virtual path map.
#[derive(Debug)]
pub struct InodeTable {
    tables: Mutex<Tables>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut tables = Tables {
            next_inode: INITIAL_INODE,
            ..Default::default()
        };
        tables.paths.insert(ROOT_INODE, PathBuf::from("/"));
        tables.inodes.insert(PathBuf::from("/"), ROOT_INODE);
        Self {
            tables: Mutex::new(tables),
        }
    }

    /// Virtual path of `ino`, if the kernel has been told about it.
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.tables.lock().paths.get(&ino).cloned()
    }

    /// Virtual path of `name` inside directory `parent`.
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.path(parent).map(|p| p.join(name))
    }

    /// Inode for `path`, allocating one on first sight.
    pub fn inode_for(&self, path: &Path) -> u64 {
        let mut tables = self.tables.lock();
        if let Some(ino) = tables.inodes.get(path) {
            return *ino;
        }
        let ino = tables.next_inode;
        tables.next_inode += 1;
        tables.paths.insert(ino, path.to_path_buf());
        tables.inodes.insert(path.to_path_buf(), ino);
        ino
    }

    /// Drops the mapping for a removed path.
    pub fn remove(&self, path: &Path) {
        let mut tables = self.tables.lock();
        if let Some(ino) = tables.inodes.remove(path) {
            tables.paths.remove(&ino);
        }
    }

    /// Moves `from` (and everything below it) to `to`, keeping inode numbers.
    pub fn rename(&self, from: &Path, to: &Path) {
        let mut tables = self.tables.lock();

        // a replaced target loses its number
        if let Some(old) = tables.inodes.remove(to) {
            tables.paths.remove(&old);
        }

        let moved: Vec<(PathBuf, u64)> = tables
            .inodes
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();

        for (old_path, ino) in moved {
            let new_path = match old_path.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };
            tables.inodes.remove(&old_path);
            tables.paths.insert(ino, new_path.clone());
            tables.inodes.insert(new_path, ino);
        }
    }

    pub fn len(&self) -> usize {
        self.tables.lock().paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
