//! Metadata operations delegated to the backing directory.
//!
//! Every function here takes an already resolved backing path. Symlinks are
//! never followed for attribute changes.

use super::error::{FsError, FsResult};
use fuser::{FileAttr, FileType, TimeOrNow};
use nix::errno::Errno;
use nix::sys::stat::{self, SFlag};
use nix::sys::statvfs::{statvfs, Statvfs};
use nix::unistd::{self, AccessFlags, FchownatFlags, Gid, Uid};
use std::ffi::{CString, OsStr, OsString};
use std::fs::{self, DirBuilder, File, OpenOptions, Permissions};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::ptr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One directory entry of the backing store.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: FileType,
}

/// Answer to an xattr query: the needed size when the caller asked with an
/// empty buffer, the bytes otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Xattr {
    Size(u32),
    Data(Vec<u8>),
}

fn cpath(path: &Path) -> FsResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| FsError::InvalidPath(path.to_string_lossy().into_owned()))
}

fn cname(name: &OsStr) -> FsResult<CString> {
    CString::new(name.as_bytes()).map_err(|_| FsError::InvalidPath(name.to_string_lossy().into_owned()))
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(nsecs as u64)
    }
}

fn kind_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn kind_from_file_type(file_type: fs::FileType) -> FileType {
    if file_type.is_dir() {
        FileType::Directory
    } else if file_type.is_symlink() {
        FileType::Symlink
    } else if file_type.is_char_device() {
        FileType::CharDevice
    } else if file_type.is_block_device() {
        FileType::BlockDevice
    } else if file_type.is_fifo() {
        FileType::NamedPipe
    } else if file_type.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

/// `lstat` of the backing path, reported under inode `ino`.
pub fn attr(path: &Path, ino: u64) -> FsResult<FileAttr> {
    let meta = fs::symlink_metadata(path)?;
    let ctime = system_time(meta.ctime(), meta.ctime_nsec());
    Ok(FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime,
        crtime: meta.created().unwrap_or(ctime),
        kind: kind_from_mode(meta.mode()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    })
}

pub fn access(path: &Path, mask: i32) -> FsResult<()> {
    unistd::access(path, AccessFlags::from_bits_truncate(mask))?;
    Ok(())
}

pub fn readlink(path: &Path) -> FsResult<Vec<u8>> {
    Ok(fs::read_link(path)?.into_os_string().into_vec())
}

/// Entries of a backing directory, without `.` and `..`.
pub fn read_dir(path: &Path) -> FsResult<Vec<DirEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        entries.push(DirEntry {
            name: entry.file_name(),
            kind: kind_from_file_type(entry.file_type()?),
        });
    }
    Ok(entries)
}

/// Creates a node. Regular files are created exclusively with `open`.
pub fn mknod(path: &Path, mode: u32, rdev: u32) -> FsResult<()> {
    let perm = mode & 0o7777;
    match mode & libc::S_IFMT {
        libc::S_IFREG | 0 => {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(perm)
                .open(path)?;
        }
        libc::S_IFIFO => unistd::mkfifo(path, stat::Mode::from_bits_truncate(perm))?,
        kind => stat::mknod(
            path,
            SFlag::from_bits_truncate(kind),
            stat::Mode::from_bits_truncate(perm),
            rdev as libc::dev_t,
        )?,
    }
    Ok(())
}

/// Creates (or empties) a regular file so it is visible before a codec
/// writes it.
pub fn create_file(path: &Path, mode: u32) -> FsResult<()> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode & 0o7777)
        .open(path)?;
    Ok(())
}

/// Opens a backing file for positional reads.
pub fn open_read(path: &Path) -> FsResult<File> {
    Ok(File::open(path)?)
}

pub fn mkdir(path: &Path, mode: u32) -> FsResult<()> {
    DirBuilder::new().mode(mode & 0o7777).create(path)?;
    Ok(())
}

pub fn unlink(path: &Path) -> FsResult<()> {
    Ok(fs::remove_file(path)?)
}

pub fn rmdir(path: &Path) -> FsResult<()> {
    Ok(fs::remove_dir(path)?)
}

/// Creates `link` pointing at `target`; the target is stored verbatim.
pub fn symlink(target: &Path, link: &Path) -> FsResult<()> {
    Ok(std::os::unix::fs::symlink(target, link)?)
}

/// Plain rename; exchange and no-replace flags are not supported.
pub fn rename(from: &Path, to: &Path, flags: u32) -> FsResult<()> {
    if flags != 0 {
        return Err(Errno::EINVAL.into());
    }
    Ok(fs::rename(from, to)?)
}

pub fn link(existing: &Path, new: &Path) -> FsResult<()> {
    Ok(fs::hard_link(existing, new)?)
}

pub fn chmod(path: &Path, mode: u32) -> FsResult<()> {
    Ok(fs::set_permissions(path, Permissions::from_mode(mode & 0o7777))?)
}

pub fn chown(path: &Path, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
    unistd::fchownat(
        None,
        path,
        uid.map(Uid::from_raw),
        gid.map(Gid::from_raw),
        FchownatFlags::NoFollowSymlink,
    )?;
    Ok(())
}

pub fn truncate(path: &Path, size: u64) -> FsResult<()> {
    unistd::truncate(path, size as libc::off_t)?;
    Ok(())
}

fn timespec(time: Option<TimeOrNow>) -> libc::timespec {
    let (secs, nsecs) = match time {
        None => (0, libc::UTIME_OMIT),
        Some(TimeOrNow::Now) => (0, libc::UTIME_NOW),
        Some(TimeOrNow::SpecificTime(at)) => {
            let since = at.duration_since(UNIX_EPOCH).unwrap_or_default();
            (since.as_secs() as libc::time_t, since.subsec_nanos() as libc::c_long)
        }
    };
    libc::timespec {
        tv_sec: secs,
        tv_nsec: nsecs,
    }
}

/// Sets access and modification times; `None` leaves a time untouched.
pub fn utimens(path: &Path, atime: Option<TimeOrNow>, mtime: Option<TimeOrNow>) -> FsResult<()> {
    if atime.is_none() && mtime.is_none() {
        return Ok(());
    }
    let path = cpath(path)?;
    let times = [timespec(atime), timespec(mtime)];
    // SAFETY: both pointers are valid for the duration of the call
    let res = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    Errno::result(res)?;
    Ok(())
}

pub fn statfs(path: &Path) -> FsResult<Statvfs> {
    Ok(statvfs(path)?)
}

/// Preallocates space in a backing file. Only the default mode is supported.
pub fn fallocate(path: &Path, offset: i64, length: i64, mode: i32) -> FsResult<()> {
    if mode != 0 {
        return Err(Errno::EOPNOTSUPP.into());
    }
    let file = OpenOptions::new().write(true).open(path)?;
    nix::fcntl::posix_fallocate(
        std::os::fd::AsRawFd::as_raw_fd(&file),
        offset as libc::off_t,
        length as libc::off_t,
    )?;
    Ok(())
}

pub fn set_xattr(path: &Path, name: &OsStr, value: &[u8], flags: i32) -> FsResult<()> {
    let (path, name) = (cpath(path)?, cname(name)?);
    // SAFETY: all buffers outlive the call and `value.len()` bounds the read
    let res = unsafe {
        libc::lsetxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            flags,
        )
    };
    Errno::result(res)?;
    Ok(())
}

pub fn get_xattr(path: &Path, name: &OsStr, size: u32) -> FsResult<Xattr> {
    let (path, name) = (cpath(path)?, cname(name)?);
    if size == 0 {
        // SAFETY: a null buffer with size 0 only queries the length
        let len = unsafe { libc::lgetxattr(path.as_ptr(), name.as_ptr(), ptr::null_mut(), 0) };
        return Ok(Xattr::Size(Errno::result(len)? as u32));
    }
    let mut buf = vec![0u8; size as usize];
    // SAFETY: `buf` is writable for `buf.len()` bytes
    let len = unsafe {
        libc::lgetxattr(path.as_ptr(), name.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
    };
    buf.truncate(Errno::result(len)? as usize);
    Ok(Xattr::Data(buf))
}

pub fn list_xattr(path: &Path, size: u32) -> FsResult<Xattr> {
    let path = cpath(path)?;
    if size == 0 {
        // SAFETY: a null buffer with size 0 only queries the length
        let len = unsafe { libc::llistxattr(path.as_ptr(), ptr::null_mut(), 0) };
        return Ok(Xattr::Size(Errno::result(len)? as u32));
    }
    let mut buf = vec![0u8; size as usize];
    // SAFETY: `buf` is writable for `buf.len()` bytes
    let len = unsafe { libc::llistxattr(path.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
    buf.truncate(Errno::result(len)? as usize);
    Ok(Xattr::Data(buf))
}

pub fn remove_xattr(path: &Path, name: &OsStr) -> FsResult<()> {
    let (path, name) = (cpath(path)?, cname(name)?);
    // SAFETY: both strings are NUL-terminated and outlive the call
    let res = unsafe { libc::lremovexattr(path.as_ptr(), name.as_ptr()) };
    Errno::result(res)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_attr_reports_backing_metadata() -> Result<()> {
        let dir = tempdir()?;
        let file = dir.path().join("f");
        fs::write(&file, b"12345")?;
        chmod(&file, 0o640)?;

        let attr = attr(&file, 42)?;
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 5);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o640);

        assert_eq!(super::attr(dir.path(), 1)?.kind, FileType::Directory);
        assert_eq!(
            super::attr(&dir.path().join("missing"), 3).unwrap_err().errno(),
            libc::ENOENT
        );
        Ok(())
    }

    #[test]
    fn test_directory_operations() -> Result<()> {
        let dir = tempdir()?;
        let sub = dir.path().join("sub");
        mkdir(&sub, 0o755)?;
        mknod(&sub.join("a"), libc::S_IFREG | 0o600, 0)?;
        symlink(Path::new("a"), &sub.join("l"))?;

        let mut names: Vec<_> = read_dir(&sub)?
            .into_iter()
            .map(|e| (e.name.to_string_lossy().into_owned(), e.kind))
            .collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            names,
            vec![
                ("a".to_string(), FileType::RegularFile),
                ("l".to_string(), FileType::Symlink)
            ]
        );
        assert_eq!(readlink(&sub.join("l"))?, b"a");
        assert_eq!(super::attr(&sub.join("l"), 9)?.kind, FileType::Symlink);

        rename(&sub.join("a"), &sub.join("b"), 0)?;
        link(&sub.join("b"), &sub.join("c"))?;
        assert_eq!(super::attr(&sub.join("c"), 9)?.nlink, 2);
        assert_eq!(
            rename(&sub.join("b"), &sub.join("d"), libc::RENAME_NOREPLACE).unwrap_err().errno(),
            libc::EINVAL
        );

        for name in ["b", "c", "l"] {
            unlink(&sub.join(name))?;
        }
        rmdir(&sub)?;
        assert!(!sub.exists());
        Ok(())
    }

    #[test]
    fn test_mknod_regular_is_exclusive() -> Result<()> {
        let dir = tempdir()?;
        let file = dir.path().join("f");
        mknod(&file, libc::S_IFREG | 0o644, 0)?;
        assert_eq!(mknod(&file, libc::S_IFREG | 0o644, 0).unwrap_err().errno(), libc::EEXIST);
        Ok(())
    }

    #[test]
    fn test_truncate_and_create() -> Result<()> {
        let dir = tempdir()?;
        let file = dir.path().join("f");
        fs::write(&file, b"content")?;
        truncate(&file, 3)?;
        assert_eq!(fs::read(&file)?, b"con");

        create_file(&file, 0o600)?;
        assert_eq!(fs::metadata(&file)?.len(), 0);
        Ok(())
    }

    #[test]
    fn test_utimens_sets_mtime() -> Result<()> {
        let dir = tempdir()?;
        let file = dir.path().join("f");
        fs::write(&file, b"")?;
        let at = UNIX_EPOCH + Duration::from_secs(1_000_000);
        utimens(&file, None, Some(TimeOrNow::SpecificTime(at)))?;
        assert_eq!(super::attr(&file, 2)?.mtime, at);
        Ok(())
    }

    #[test]
    fn test_statfs_and_access() -> Result<()> {
        let dir = tempdir()?;
        assert!(statfs(dir.path())?.block_size() > 0);
        access(dir.path(), libc::R_OK | libc::W_OK)?;
        assert!(access(&dir.path().join("missing"), libc::F_OK).is_err());
        Ok(())
    }

    #[test]
    fn test_fallocate_rejects_modes() -> Result<()> {
        let dir = tempdir()?;
        let file = dir.path().join("f");
        fs::write(&file, b"")?;
        fallocate(&file, 0, 4096, 0)?;
        assert!(fs::metadata(&file)?.len() >= 4096);
        assert_eq!(
            fallocate(&file, 0, 10, libc::FALLOC_FL_KEEP_SIZE).unwrap_err().errno(),
            libc::EOPNOTSUPP
        );
        Ok(())
    }
}
