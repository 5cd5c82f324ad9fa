//! Codec sessions and the registry that owns them.
//!
//! A [`Session`] binds one kernel file handle to a pipe and the codec process
//! on the other end of it. The [`SessionRegistry`] owns every live session;
//! callers borrow them as `Arc<Session>` for the duration of one request.

use super::config::Mode;
use super::error::{FsError, FsResult};
use super::launcher::{CodecLaunch, CodecProcess};
use log::{debug, error};
use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct LockState {
    next_ticket: u64,
    serving: u64,
    abandoned: BTreeSet<u64>,
}

/// First-come first-served lock for the requests of one session.
///
/// A ticket is drawn when the request arrives; the holder of the ticket
/// currently being served may touch the pipe. Requests therefore run one at
/// a time and in arrival order even when they are executed on different
/// worker threads.
#[derive(Debug, Default)]
pub struct SessionLock {
    state: Mutex<LockState>,
    turn: Condvar,
}

impl SessionLock {
    /// Draws the next ticket.
    pub fn ticket(&self) -> u64 {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        ticket
    }

    /// Blocks until `ticket` is being served.
    pub fn wait(&self, ticket: u64) -> Turn<'_> {
        let mut state = self.state.lock();
        while state.serving != ticket {
            self.turn.wait(&mut state);
        }
        Turn { lock: self, ticket }
    }

    /// Draws a ticket and waits for it.
    pub fn lock(&self) -> Turn<'_> {
        let ticket = self.ticket();
        self.wait(ticket)
    }

    /// Gives up a ticket that will never be waited on.
    pub fn abandon(&self, ticket: u64) {
        let mut state = self.state.lock();
        if state.serving == ticket {
            Self::advance(&mut state, ticket);
            self.turn.notify_all();
        } else {
            state.abandoned.insert(ticket);
        }
    }

    fn release(&self, ticket: u64) {
        let mut state = self.state.lock();
        Self::advance(&mut state, ticket);
        self.turn.notify_all();
    }

    fn advance(state: &mut LockState, ticket: u64) {
        state.serving = ticket + 1;
        while state.abandoned.remove(&state.serving) {
            state.serving += 1;
        }
    }
}

/// Proof of holding a [`SessionLock`]; the next ticket is served on drop.
#[derive(Debug)]
pub struct Turn<'a> {
    lock: &'a SessionLock,
    ticket: u64,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        self.lock.release(self.ticket);
    }
}

/// One open virtual file whose content flows through a codec.
#[derive(Debug)]
pub struct Session {
    handle: u64,
    mode: Mode,
    path: PathBuf,
    // declared before `process`: the pipe must close before the child is swept
    pipe: File,
    process: CodecProcess,
    lock: SessionLock,
    eof: AtomicBool,
    transferred: AtomicU64,
}

impl Session {
    /// Wraps a launched codec. The handle is the pipe descriptor's number.
    pub fn new(launch: CodecLaunch, mode: Mode, path: &Path) -> Self {
        let CodecLaunch { pipe, process } = launch;
        Self {
            handle: pipe.as_raw_fd() as u64,
            mode,
            path: path.to_path_buf(),
            pipe,
            process,
            lock: SessionLock::default(),
            eof: AtomicBool::new(false),
            transferred: AtomicU64::new(0),
        }
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Virtual path the session was opened for.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> Pid {
        self.process.pid()
    }

    pub fn lock(&self) -> &SessionLock {
        &self.lock
    }

    pub(crate) fn pipe(&self) -> &File {
        &self.pipe
    }

    /// Whether the codec's output has ended.
    pub fn at_eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    pub(crate) fn mark_eof(&self) {
        self.eof.store(true, Ordering::Release);
    }

    /// Bytes moved through the pipe so far.
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub(crate) fn add_transferred(&self, bytes: usize) {
        self.transferred.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Closes the pipe, then hands the child to the reaper.
    pub fn close(self) {
        let Session {
            handle,
            pipe,
            process,
            transferred,
            ..
        } = self;
        drop(pipe);
        debug!(
            "Closed session {} after {} bytes",
            handle,
            transferred.into_inner()
        );
        drop(process);
    }
}

/// A place in a session's queue, drawn when the request arrived.
///
/// [`SessionTicket::run`] waits for the turn and runs the I/O; a ticket that
/// is dropped without running gives its turn up so later requests proceed.
#[derive(Debug)]
pub struct SessionTicket {
    session: Arc<Session>,
    number: u64,
    done: bool,
}

impl SessionTicket {
    pub fn new(session: Arc<Session>) -> Self {
        let number = session.lock.ticket();
        Self {
            session,
            number,
            done: false,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Waits for this ticket's turn and runs `io` while holding it.
    pub fn run<T>(mut self, io: impl FnOnce(&Session) -> T) -> T {
        self.done = true;
        let _turn = self.session.lock.wait(self.number);
        io(&self.session)
    }
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        if !self.done {
            self.session.lock.abandon(self.number);
        }
    }
}

/// Every live session, keyed by handle.
///
/// The map lock only covers the splice itself: lookups clone an `Arc` and
/// return, so no I/O or process wait ever happens under it.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session` under its handle.
    ///
    /// # Errors
    ///
    /// [`FsError::DuplicateHandle`] if the handle is already live. Handles are
    /// descriptor numbers held open by their sessions, so this means an
    /// internal invariant was broken.
    pub fn insert(&self, session: Session) -> FsResult<Arc<Session>> {
        let handle = session.handle();
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&handle) {
            drop(sessions);
            error!("Handle {} is already registered", handle);
            return Err(FsError::DuplicateHandle(handle));
        }
        let session = Arc::new(session);
        sessions.insert(handle, Arc::clone(&session));
        Ok(session)
    }

    /// Session behind `handle`; `None` for plain passthrough handles.
    pub fn lookup(&self, handle: u64) -> Option<Arc<Session>> {
        self.sessions.read().get(&handle).cloned()
    }

    /// Detaches the session behind `handle`. Absent handles are a no-op.
    pub fn remove(&self, handle: u64) -> Option<Arc<Session>> {
        self.sessions.write().remove(&handle)
    }

    pub fn contains(&self, handle: u64) -> bool {
        self.sessions.read().contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::launcher::spawn_codec;
    use std::ffi::CString;
    use std::thread;
    use std::time::Duration;

    fn launch(path: &str) -> FsResult<Session> {
        let argv = vec![CString::new("true").unwrap()];
        let launch = spawn_codec(&argv, Mode::Egress, Path::new(path))?;
        Ok(Session::new(launch, Mode::Egress, Path::new(path)))
    }

    #[test]
    fn test_insert_lookup_remove() -> FsResult<()> {
        let registry = SessionRegistry::new();
        let session = registry.insert(launch("/a")?)?;
        let handle = session.handle();

        assert!(registry.contains(handle));
        let found = registry.lookup(handle).expect("session should be registered");
        assert!(Arc::ptr_eq(&found, &session));
        assert_eq!(found.path(), Path::new("/a"));

        assert!(registry.remove(handle).is_some());
        assert!(registry.lookup(handle).is_none());
        assert!(registry.remove(handle).is_none());
        assert!(registry.is_empty());
        Ok(())
    }

    #[test]
    fn test_distinct_sessions_have_distinct_handles() -> FsResult<()> {
        let registry = SessionRegistry::new();
        let a = registry.insert(launch("/a")?)?;
        let b = registry.insert(launch("/b")?)?;
        assert_ne!(a.handle(), b.handle());
        assert_eq!(registry.len(), 2);
        Ok(())
    }

    #[test]
    fn test_lookup_of_plain_handle_is_none() {
        let registry = SessionRegistry::new();
        assert!(registry.lookup(12345).is_none());
    }

    #[test]
    fn test_lock_serves_in_ticket_order() {
        let lock = Arc::new(SessionLock::default());
        let order = Arc::new(Mutex::new(Vec::new()));
        let tickets: Vec<u64> = (0..4).map(|_| lock.ticket()).collect();

        // start the later tickets first
        let workers: Vec<_> = tickets
            .into_iter()
            .rev()
            .map(|ticket| {
                let lock = Arc::clone(&lock);
                let order = Arc::clone(&order);
                thread::spawn(move || {
                    let _turn = lock.wait(ticket);
                    order.lock().push(ticket);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_abandoned_ticket_is_skipped() {
        let lock = Arc::new(SessionLock::default());
        let first = lock.ticket();
        let second = lock.ticket();
        let third = lock.ticket();

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _turn = lock.wait(third);
            })
        };

        lock.abandon(second);
        thread::sleep(Duration::from_millis(20));
        drop(lock.wait(first));
        waiter.join().unwrap();

        // the queue keeps moving afterwards
        drop(lock.lock());
    }

    #[test]
    fn test_dropped_ticket_releases_turn() -> FsResult<()> {
        let session = Arc::new(launch("/t")?);
        let unused = SessionTicket::new(Arc::clone(&session));
        let next = SessionTicket::new(Arc::clone(&session));
        drop(unused);
        assert_eq!(next.run(|s| s.path().to_path_buf()), PathBuf::from("/t"));
        Ok(())
    }
}
