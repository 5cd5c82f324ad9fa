//! Path-based filesystem core.
//!
//! [`CodecFs`] owns the session registry and applies the mode policy: which
//! opens start a codec, which are plain, and which operations a mount
//! refuses. The FUSE dispatcher in `proto` translates inodes to virtual
//! paths and forwards here.

use super::config::{Config, Mode};
use super::error::{FsError, FsResult};
use super::launcher::spawn_codec;
use super::passthrough::{self, DirEntry, Xattr};
use super::path::PathResolver;
use super::reaper::Reaper;
use super::session::{Session, SessionRegistry, SessionTicket};
use super::stream;
use fuser::{FileAttr, FileType, TimeOrNow};
use log::{debug, info};
use nix::sys::statvfs::Statvfs;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What an open produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenKind {
    /// Content flows through a codec; the handle is not seekable
    Session,
    /// Ordinary backing file
    Plain,
}

/// Handle returned by [`CodecFs::open`] and [`CodecFs::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFile {
    pub fh: u64,
    pub kind: OpenKind,
}

/// A read or write that has its place in line but has not run yet.
///
/// Obtained on the dispatcher thread so the session's arrival order is
/// fixed before the I/O moves to a worker.
#[derive(Debug)]
pub enum PendingIo {
    Session(SessionTicket),
    Plain(Arc<File>),
}

impl PendingIo {
    /// Runs a read. Sessions are streams, so `offset` only applies to plain
    /// files.
    pub fn read(self, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        match self {
            PendingIo::Session(ticket) => ticket.run(|session| stream::read_session(session, size)),
            PendingIo::Plain(file) => stream::read_plain(&file, offset, size),
        }
    }

    /// Runs a write.
    pub fn write(self, offset: u64, data: &[u8]) -> FsResult<usize> {
        match self {
            PendingIo::Session(ticket) => ticket.run(|session| stream::write_session(session, data)),
            PendingIo::Plain(file) => stream::write_plain(&file, offset, data),
        }
    }
}

/// The codec filesystem, independent of the kernel protocol.
#[derive(Debug)]
pub struct CodecFs {
    config: Config,
    resolver: PathResolver,
    sessions: SessionRegistry,
    plain: Mutex<HashMap<u64, Arc<File>>>,
}

impl CodecFs {
    pub fn new(config: Config) -> Self {
        Self {
            resolver: PathResolver::new(config.root.clone()),
            config,
            sessions: SessionRegistry::new(),
            plain: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Backing path for a virtual path.
    pub fn backing(&self, path: &Path) -> FsResult<PathBuf> {
        self.resolver.resolve(path)
    }

    fn refuse_in(&self, mode: Mode, operation: &'static str) -> FsResult<()> {
        if self.config.mode == mode {
            debug!("Refusing {} on {} mount", operation, mode);
            return Err(FsError::unsupported(operation, mode));
        }
        Ok(())
    }

    fn spawn_session(&self, path: &Path, backing: &Path) -> FsResult<Arc<Session>> {
        let mode = self.config.mode;
        let argv = self
            .config
            .codec
            .argv(mode, backing, self.config.recipient.as_deref())?;
        let launch = spawn_codec(&argv, mode, path)?;
        let session = self.sessions.insert(Session::new(launch, mode, path))?;
        info!(
            "Opened {} session {} for {:?} (codec pid {})",
            mode,
            session.handle(),
            path,
            session.pid()
        );
        Ok(session)
    }

    fn register_plain(&self, file: File) -> FsResult<u64> {
        let fh = file.as_raw_fd() as u64;
        let mut plain = self.plain.lock();
        if plain.contains_key(&fh) {
            return Err(FsError::DuplicateHandle(fh));
        }
        plain.insert(fh, Arc::new(file));
        Ok(fh)
    }

    /// Opens a virtual file.
    ///
    /// * egress: read-only opens start a decoding session, anything with
    ///   write access is refused
    /// * ingest: write access starts an encoding session targeting the
    ///   backing path; read-only opens return the stored bytes as they are
    pub fn open(&self, path: &Path, flags: i32) -> FsResult<OpenFile> {
        let backing = self.backing(path)?;
        let writable = flags & libc::O_ACCMODE != libc::O_RDONLY;

        match (self.config.mode, writable) {
            (Mode::Egress, true) => Err(FsError::unsupported("open for writing", Mode::Egress)),
            (Mode::Egress, false) | (Mode::Ingest, true) => {
                let session = self.spawn_session(path, &backing)?;
                Ok(OpenFile {
                    fh: session.handle(),
                    kind: OpenKind::Session,
                })
            }
            (Mode::Ingest, false) => {
                let fh = self.register_plain(passthrough::open_read(&backing)?)?;
                debug!("Opened {:?} as plain handle {}", path, fh);
                Ok(OpenFile {
                    fh,
                    kind: OpenKind::Plain,
                })
            }
        }
    }

    /// Creates a file and opens an encoding session for it.
    pub fn create(&self, path: &Path, mode: u32) -> FsResult<OpenFile> {
        self.refuse_in(Mode::Egress, "create")?;
        let backing = self.backing(path)?;
        passthrough::create_file(&backing, mode)?;
        let session = self.spawn_session(path, &backing)?;
        Ok(OpenFile {
            fh: session.handle(),
            kind: OpenKind::Session,
        })
    }

    fn pending(&self, fh: u64) -> FsResult<PendingIo> {
        if let Some(session) = self.sessions.lookup(fh) {
            return Ok(PendingIo::Session(SessionTicket::new(session)));
        }
        match self.plain.lock().get(&fh) {
            Some(file) => Ok(PendingIo::Plain(Arc::clone(file))),
            None => Err(FsError::UnknownHandle(fh)),
        }
    }

    /// Queues a read on `fh`.
    pub fn begin_read(&self, fh: u64) -> FsResult<PendingIo> {
        self.pending(fh)
    }

    /// Queues a write on `fh`.
    pub fn begin_write(&self, fh: u64) -> FsResult<PendingIo> {
        self.refuse_in(Mode::Egress, "write")?;
        self.pending(fh)
    }

    /// Reads from `fh` on the calling thread.
    pub fn read(&self, fh: u64, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        self.begin_read(fh)?.read(offset, size)
    }

    /// Writes to `fh` on the calling thread.
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.begin_write(fh)?.write(offset, data)
    }

    /// Closes `fh`.
    ///
    /// A session is detached from the registry before its pipe is closed,
    /// then exited children are swept without waiting for the session's own
    /// codec. Never fails; unknown handles are ignored.
    pub fn release(&self, fh: u64) {
        let plain = self.plain.lock().remove(&fh);
        if let Some(file) = plain {
            drop(file);
            debug!("Released plain handle {}", fh);
            return;
        }

        let Some(session) = self.sessions.remove(fh) else {
            debug!("Release of unknown handle {}", fh);
            return;
        };

        let path = session.path().to_path_buf();
        match Arc::try_unwrap(session) {
            Ok(session) => session.close(),
            // an in-flight request still holds it; the last holder closes it
            Err(shared) => drop(shared),
        }

        let reaped = Reaper::global().sweep();
        info!("Released session {} for {:?}; reaped {} children", fh, path, reaped);
    }

    pub fn getattr(&self, path: &Path, ino: u64) -> FsResult<FileAttr> {
        let attr = passthrough::attr(&self.backing(path)?, ino)?;
        if self.config.mode == Mode::Egress && attr.kind == FileType::RegularFile {
            debug!(
                "Reporting backing size {} for {:?}; decoded size may differ",
                attr.size, path
            );
        }
        Ok(attr)
    }

    pub fn access(&self, path: &Path, mask: i32) -> FsResult<()> {
        passthrough::access(&self.backing(path)?, mask)
    }

    pub fn readlink(&self, path: &Path) -> FsResult<Vec<u8>> {
        passthrough::readlink(&self.backing(path)?)
    }

    pub fn readdir(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        passthrough::read_dir(&self.backing(path)?)
    }

    /// Creates a node. Egress mounts refuse; ingest mounts refuse device
    /// nodes.
    pub fn mknod(&self, path: &Path, mode: u32, rdev: u32) -> FsResult<()> {
        self.refuse_in(Mode::Egress, "mknod")?;
        if matches!(mode & libc::S_IFMT, libc::S_IFCHR | libc::S_IFBLK) {
            return Err(FsError::unsupported("device node creation", Mode::Ingest));
        }
        passthrough::mknod(&self.backing(path)?, mode, rdev)
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()> {
        passthrough::mkdir(&self.backing(path)?, mode)
    }

    pub fn unlink(&self, path: &Path) -> FsResult<()> {
        passthrough::unlink(&self.backing(path)?)
    }

    pub fn rmdir(&self, path: &Path) -> FsResult<()> {
        passthrough::rmdir(&self.backing(path)?)
    }

    /// Creates `link` with the verbatim `target`.
    pub fn symlink(&self, target: &Path, link: &Path) -> FsResult<()> {
        passthrough::symlink(target, &self.backing(link)?)
    }

    pub fn rename(&self, from: &Path, to: &Path, flags: u32) -> FsResult<()> {
        passthrough::rename(&self.backing(from)?, &self.backing(to)?, flags)
    }

    pub fn link(&self, existing: &Path, new: &Path) -> FsResult<()> {
        passthrough::link(&self.backing(existing)?, &self.backing(new)?)
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        passthrough::chmod(&self.backing(path)?, mode)
    }

    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        passthrough::chown(&self.backing(path)?, uid, gid)
    }

    /// Truncates a file. Ingest mounts only allow emptying it, since the
    /// codec rewrites the whole file anyway.
    pub fn truncate(&self, path: &Path, size: u64) -> FsResult<()> {
        self.refuse_in(Mode::Egress, "truncate")?;
        if size != 0 {
            return Err(FsError::unsupported("truncate to non-zero size", Mode::Ingest));
        }
        passthrough::truncate(&self.backing(path)?, size)
    }

    pub fn utimens(
        &self,
        path: &Path,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> FsResult<()> {
        passthrough::utimens(&self.backing(path)?, atime, mtime)
    }

    pub fn statfs(&self, path: &Path) -> FsResult<Statvfs> {
        passthrough::statfs(&self.backing(path)?)
    }

    pub fn fallocate(&self, path: &Path, offset: i64, length: i64, mode: i32) -> FsResult<()> {
        self.refuse_in(Mode::Egress, "fallocate")?;
        passthrough::fallocate(&self.backing(path)?, offset, length, mode)
    }

    pub fn set_xattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> FsResult<()> {
        passthrough::set_xattr(&self.backing(path)?, name, value, flags)
    }

    pub fn get_xattr(&self, path: &Path, name: &OsStr, size: u32) -> FsResult<Xattr> {
        passthrough::get_xattr(&self.backing(path)?, name, size)
    }

    pub fn list_xattr(&self, path: &Path, size: u32) -> FsResult<Xattr> {
        passthrough::list_xattr(&self.backing(path)?, size)
    }

    pub fn remove_xattr(&self, path: &Path, name: &OsStr) -> FsResult<()> {
        passthrough::remove_xattr(&self.backing(path)?, name)
    }
}
