use super::constants::MAX_PATH;
use super::error::{FsError, FsResult};
use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Maps virtual paths under the mount to paths in the backing directory.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Prefixes `virtual_path` (absolute, as seen through the mount) with the
    /// backing root.
    ///
    /// The result is a plain concatenation, so `/` maps to the root itself and
    /// `/a/b` to `<root>/a/b`. Fails with [`FsError::PathTooLong`] when the
    /// joined path would not fit in `MAX_PATH` bytes.
    pub fn resolve(&self, virtual_path: &Path) -> FsResult<PathBuf> {
        let root = self.root.as_os_str().as_bytes();
        let tail = virtual_path.as_os_str().as_bytes();
        let root = root.strip_suffix(b"/").unwrap_or(root);
        let separator = if tail.starts_with(b"/") { 0 } else { 1 };

        if root.len() + separator + tail.len() >= MAX_PATH {
            return Err(FsError::PathTooLong(virtual_path.to_path_buf()));
        }

        let mut joined = OsString::from(std::ffi::OsStr::from_bytes(root));
        if separator == 1 {
            joined.push("/");
        }
        joined.push(std::ffi::OsStr::from_bytes(tail));
        Ok(PathBuf::from(joined))
    }
}
