//! FUSE dispatcher.
//!
//! [`HoleFs`] is the callback table handed to `fuser`. Callbacks run on the
//! single session loop thread: metadata calls are answered inline, while
//! content reads and writes take their place in the session's queue here and
//! then run on the tokio blocking pool, so one slow codec never stalls the
//! rest of the mount.

use super::codecfs::{CodecFs, OpenKind};
use super::constants::{GENERATION, ROOT_INODE, TTL};
use super::error::{FsError, FsResult};
use super::inode::InodeTable;
use super::passthrough::Xattr;
use fuser::consts::{FOPEN_DIRECT_IO, FOPEN_NONSEEKABLE};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use libc::c_int;
use log::{debug, info, warn};
use nix::errno::Errno;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::runtime::Handle;

/// Reply with the error's errno and return from the callback.
macro_rules! unwrap_reply {
    ($reply:ident, $expr:expr) => {{
        match $expr {
            Ok(value) => value,
            Err(err) => {
                let err: FsError = err;
                debug!("{}", err);
                $reply.error(err.errno());
                return;
            }
        }
    }};
}

const SESSION_OPEN_FLAGS: u32 = FOPEN_DIRECT_IO | FOPEN_NONSEEKABLE;

fn open_flags(kind: OpenKind) -> u32 {
    match kind {
        OpenKind::Session => SESSION_OPEN_FLAGS,
        OpenKind::Plain => 0,
    }
}

/// Kernel-facing side of a codec mount.
pub struct HoleFs {
    core: Arc<CodecFs>,
    inodes: InodeTable,
    workers: Handle,
    shutdown: Option<signal_hook::iterator::Handle>,
}

impl HoleFs {
    /// `workers` runs the blocking content I/O.
    pub fn new(core: Arc<CodecFs>, workers: Handle) -> Self {
        Self {
            core,
            inodes: InodeTable::new(),
            workers,
            shutdown: None,
        }
    }

    /// Closes `signals` when the kernel tears the mount down, waking whoever
    /// waits on them.
    pub fn with_shutdown(mut self, signals: signal_hook::iterator::Handle) -> Self {
        self.shutdown = Some(signals);
        self
    }

    pub fn core(&self) -> &Arc<CodecFs> {
        &self.core
    }

    fn path(&self, ino: u64) -> FsResult<PathBuf> {
        self.inodes.path(ino).ok_or(FsError::Nix(Errno::ENOENT))
    }

    fn child(&self, parent: u64, name: &OsStr) -> FsResult<PathBuf> {
        self.inodes
            .child_path(parent, name)
            .ok_or(FsError::Nix(Errno::ENOENT))
    }

    /// Attributes of `path`, numbered with its (possibly new) inode.
    fn entry(&self, path: &Path) -> FsResult<FileAttr> {
        let mut attr = self.core.getattr(path, 0)?;
        attr.ino = self.inodes.inode_for(path);
        Ok(attr)
    }

    /// `.`, `..` and the backing entries of directory `ino`.
    fn listing(&self, ino: u64) -> FsResult<Vec<(u64, FileType, OsString)>> {
        let path = self.path(ino)?;
        let parent = match path.parent() {
            Some(parent) => self.inodes.inode_for(parent),
            None => ROOT_INODE,
        };

        let mut listing = vec![
            (ino, FileType::Directory, OsString::from(".")),
            (parent, FileType::Directory, OsString::from("..")),
        ];
        for entry in self.core.readdir(&path)? {
            let child = self.inodes.inode_for(&path.join(&entry.name));
            listing.push((child, entry.kind, entry.name));
        }
        Ok(listing)
    }
}

impl Filesystem for HoleFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        let config = self.core.config();
        info!(
            "Filesystem initialized: {} mount of {} at {}",
            config.mode,
            config.root.display(),
            config.mountpoint.display()
        );
        Ok(())
    }

    fn destroy(&mut self) {
        let open = self.core.sessions().len();
        if open > 0 {
            warn!("Unmounting with {} sessions still open", open);
        }
        info!("Filesystem destroyed");
        if let Some(signals) = self.shutdown.take() {
            signals.close();
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);
        let path = unwrap_reply!(reply, self.child(parent, name));
        let attr = unwrap_reply!(reply, self.entry(&path));
        reply.entry(&TTL, &attr, GENERATION);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);
        let path = unwrap_reply!(reply, self.path(ino));
        let attr = unwrap_reply!(reply, self.core.getattr(&path, ino));
        reply.attr(&TTL, &attr);
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, mode={:?}, size={:?})", ino, mode, size);
        let path = unwrap_reply!(reply, self.path(ino));

        if let Some(mode) = mode {
            unwrap_reply!(reply, self.core.chmod(&path, mode));
        }
        if uid.is_some() || gid.is_some() {
            unwrap_reply!(reply, self.core.chown(&path, uid, gid));
        }
        if let Some(size) = size {
            unwrap_reply!(reply, self.core.truncate(&path, size));
        }
        if atime.is_some() || mtime.is_some() {
            unwrap_reply!(reply, self.core.utimens(&path, atime, mtime));
        }

        let attr = unwrap_reply!(reply, self.core.getattr(&path, ino));
        reply.attr(&TTL, &attr);
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);
        let path = unwrap_reply!(reply, self.path(ino));
        let target = unwrap_reply!(reply, self.core.readlink(&path));
        reply.data(&target);
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);
        let path = unwrap_reply!(reply, self.child(parent, name));
        unwrap_reply!(reply, self.core.mknod(&path, mode & !umask, rdev));
        let attr = unwrap_reply!(reply, self.entry(&path));
        reply.entry(&TTL, &attr, GENERATION);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);
        let path = unwrap_reply!(reply, self.child(parent, name));
        unwrap_reply!(reply, self.core.mkdir(&path, mode & !umask));
        let attr = unwrap_reply!(reply, self.entry(&path));
        reply.entry(&TTL, &attr, GENERATION);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);
        let path = unwrap_reply!(reply, self.child(parent, name));
        unwrap_reply!(reply, self.core.unlink(&path));
        self.inodes.remove(&path);
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);
        let path = unwrap_reply!(reply, self.child(parent, name));
        unwrap_reply!(reply, self.core.rmdir(&path));
        self.inodes.remove(&path);
        reply.ok();
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);
        let path = unwrap_reply!(reply, self.child(parent, link_name));
        unwrap_reply!(reply, self.core.symlink(target, &path));
        let attr = unwrap_reply!(reply, self.entry(&path));
        reply.entry(&TTL, &attr, GENERATION);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!("rename({:?} -> {:?})", name, newname);
        let from = unwrap_reply!(reply, self.child(parent, name));
        let to = unwrap_reply!(reply, self.child(newparent, newname));
        unwrap_reply!(reply, self.core.rename(&from, &to, flags));
        self.inodes.rename(&from, &to);
        reply.ok();
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newname={:?})", ino, newname);
        let existing = unwrap_reply!(reply, self.path(ino));
        let path = unwrap_reply!(reply, self.child(newparent, newname));
        unwrap_reply!(reply, self.core.link(&existing, &path));
        let attr = unwrap_reply!(reply, self.entry(&path));
        reply.entry(&TTL, &attr, GENERATION);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#o})", ino, flags);
        let path = unwrap_reply!(reply, self.path(ino));
        let opened = unwrap_reply!(reply, self.core.open(&path, flags));
        reply.opened(opened.fh, open_flags(opened.kind));
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        let pending = unwrap_reply!(reply, self.core.begin_read(fh));
        self.workers.spawn_blocking(move || {
            match pending.read(offset.max(0) as u64, size as usize) {
                Ok(data) => reply.data(&data),
                Err(err) => {
                    debug!("read on handle {} failed: {}", fh, err);
                    reply.error(err.errno());
                }
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());
        let pending = unwrap_reply!(reply, self.core.begin_write(fh));
        let data = data.to_vec();
        self.workers.spawn_blocking(move || {
            match pending.write(offset.max(0) as u64, &data) {
                Ok(written) => reply.written(written as u32),
                Err(err) => {
                    debug!("write on handle {} failed: {}", fh, err);
                    reply.error(err.errno());
                }
            }
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        self.core.release(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={})", ino, fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir(ino={})", ino);
        let path = unwrap_reply!(reply, self.path(ino));
        let attr = unwrap_reply!(reply, self.core.getattr(&path, ino));
        if attr.kind != FileType::Directory {
            reply.error(libc::ENOTDIR);
            return;
        }
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);
        let listing = unwrap_reply!(reply, self.listing(ino));
        for (i, (child, kind, name)) in listing.into_iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(child, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        debug!("releasedir(ino={})", ino);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        debug!("statfs(ino={})", ino);
        let path = self.path(ino).unwrap_or_else(|_| PathBuf::from("/"));
        let stats = unwrap_reply!(reply, self.core.statfs(&path));
        reply.statfs(
            stats.blocks() as u64,
            stats.blocks_free() as u64,
            stats.blocks_available() as u64,
            stats.files() as u64,
            stats.files_free() as u64,
            stats.block_size() as u32,
            stats.name_max() as u32,
            stats.fragment_size() as u32,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        debug!("setxattr(ino={}, name={:?})", ino, name);
        let path = unwrap_reply!(reply, self.path(ino));
        unwrap_reply!(reply, self.core.set_xattr(&path, name, value, flags));
        reply.ok();
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        debug!("getxattr(ino={}, name={:?}, size={})", ino, name, size);
        let path = unwrap_reply!(reply, self.path(ino));
        match unwrap_reply!(reply, self.core.get_xattr(&path, name, size)) {
            Xattr::Size(len) => reply.size(len),
            Xattr::Data(data) => reply.data(&data),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        debug!("listxattr(ino={}, size={})", ino, size);
        let path = unwrap_reply!(reply, self.path(ino));
        match unwrap_reply!(reply, self.core.list_xattr(&path, size)) {
            Xattr::Size(len) => reply.size(len),
            Xattr::Data(data) => reply.data(&data),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("removexattr(ino={}, name={:?})", ino, name);
        let path = unwrap_reply!(reply, self.path(ino));
        unwrap_reply!(reply, self.core.remove_xattr(&path, name));
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);
        let path = unwrap_reply!(reply, self.path(ino));
        unwrap_reply!(reply, self.core.access(&path, mask));
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o})", parent, name, mode);
        let path = unwrap_reply!(reply, self.child(parent, name));
        let opened = unwrap_reply!(reply, self.core.create(&path, mode & !umask));
        let attr = match self.entry(&path) {
            Ok(attr) => attr,
            Err(err) => {
                self.core.release(opened.fh);
                reply.error(err.errno());
                return;
            }
        };
        reply.created(&TTL, &attr, GENERATION, opened.fh, open_flags(opened.kind));
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        debug!("fallocate(ino={}, offset={}, length={})", ino, offset, length);
        let path = unwrap_reply!(reply, self.path(ino));
        unwrap_reply!(reply, self.core.fallocate(&path, offset, length, mode));
        reply.ok();
    }
}
