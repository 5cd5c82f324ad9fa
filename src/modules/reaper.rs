//! Non-blocking collection of codec exit statuses.
//!
//! Waiting on "any child" is process-wide, so there is one [`Reaper`] per
//! process. Each codec pid is tracked together with the virtual path it
//! serves until its status has been collected, which happens exactly once:
//! either during a sweep triggered by a `release`, by a dropped
//! [`CodecProcess`](super::launcher::CodecProcess), or by the SIGCHLD watcher.
//!
//! Launchers fork while holding a [`Spawning`] guard and register the child
//! before releasing it, so a sweep can never collect a codec that is not yet
//! tracked. Exits of children nobody tracks are logged and forgotten.

use super::constants::CODEC_EXEC_FAILED;
use super::error::FsError;
use anyhow::Result;
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::{Mutex, MutexGuard};
use signal_hook::consts::SIGCHLD;
use signal_hook::iterator::{Handle, Signals};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

/// How a codec child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal exit with a status code
    Exited(i32),
    /// Killed by a signal
    Signaled(Signal),
}

#[derive(Debug, Default)]
struct ReaperState {
    live: HashMap<Pid, PathBuf>,
}

/// Process-wide registry of live codec children.
#[derive(Debug, Default)]
pub struct Reaper {
    state: Mutex<ReaperState>,
}

static GLOBAL: OnceLock<Arc<Reaper>> = OnceLock::new();

impl Reaper {
    /// The reaper shared by every mount in this process.
    pub fn global() -> Arc<Reaper> {
        GLOBAL.get_or_init(|| Arc::new(Reaper::default())).clone()
    }

    /// Blocks sweeps from recording exits until the guard is dropped.
    ///
    /// Hold it across `fork` and [`Spawning::track`] the child before
    /// letting go.
    pub fn spawning(&self) -> Spawning<'_> {
        Spawning {
            state: self.state.lock(),
        }
    }

    /// Whether `pid` is still waiting to be collected.
    pub fn is_live(&self, pid: Pid) -> bool {
        self.state.lock().live.contains_key(&pid)
    }

    /// Number of tracked children not yet collected.
    pub fn outstanding(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Collects every child that has already exited, without blocking.
    ///
    /// Returns how many exits were collected. Children still running are left
    /// for a later sweep.
    pub fn sweep(&self) -> usize {
        let mut reaped = 0;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.record(pid, ExitOutcome::Exited(code));
                    reaped += 1;
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    self.record(pid, ExitOutcome::Signaled(signal));
                    reaped += 1;
                }
                Ok(other) => debug!("Ignoring child state change {:?}", other),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    debug!("waitpid failed during sweep: {}", e);
                    break;
                }
            }
        }
        reaped
    }

    fn record(&self, pid: Pid, outcome: ExitOutcome) {
        let tracked = self.state.lock().live.remove(&pid);
        match tracked {
            Some(path) => report(pid, &path, outcome),
            None => debug!("Collected untracked child {} ({:?})", pid, outcome),
        }
    }

    /// Sweeps on every SIGCHLD from a background thread.
    pub fn watch_sigchld(self: &Arc<Self>) -> Result<ReaperWatch> {
        let mut signals = Signals::new([SIGCHLD])?;
        let handle = signals.handle();
        let reaper = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("hfs-reaper".into())
            .spawn(move || {
                for _ in signals.forever() {
                    let reaped = reaper.sweep();
                    debug!("SIGCHLD sweep collected {} children", reaped);
                }
            })?;
        Ok(ReaperWatch { handle, thread })
    }
}

fn report(pid: Pid, path: &Path, outcome: ExitOutcome) {
    match outcome {
        ExitOutcome::Exited(0) => debug!("Codec {} for {:?} finished", pid, path),
        ExitOutcome::Exited(CODEC_EXEC_FAILED) => {
            let err = FsError::CodecLaunchFailed {
                path: path.to_path_buf(),
                status: CODEC_EXEC_FAILED,
            };
            error!("Codec {}: {}", pid, err)
        }
        ExitOutcome::Exited(code) => {
            warn!("Codec {} for {:?} exited with status {}", pid, path, code)
        }
        ExitOutcome::Signaled(signal) => {
            warn!("Codec {} for {:?} was killed by {:?}", pid, path, signal)
        }
    }
}

/// Registration window held across `fork`; see [`Reaper::spawning`].
pub struct Spawning<'a> {
    state: MutexGuard<'a, ReaperState>,
}

impl Spawning<'_> {
    /// Starts tracking a freshly forked codec.
    pub fn track(&mut self, pid: Pid, path: &Path) {
        self.state.live.insert(pid, path.to_path_buf());
    }
}

/// Running SIGCHLD watcher; [`ReaperWatch::stop`] ends it.
pub struct ReaperWatch {
    handle: Handle,
    thread: JoinHandle<()>,
}

impl ReaperWatch {
    pub fn stop(self) {
        self.handle.close();
        if self.thread.join().is_err() {
            error!("Reaper thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untracked_exit_does_not_shadow_reused_pid() {
        let reaper = Reaper::default();
        let pid = Pid::from_raw(4_000_000);
        // e.g. a fusermount helper collected by a sweep
        reaper.record(pid, ExitOutcome::Exited(0));
        assert_eq!(reaper.outstanding(), 0);

        reaper.spawning().track(pid, Path::new("/reused"));
        assert!(reaper.is_live(pid));
        assert_eq!(reaper.outstanding(), 1);
    }

    #[test]
    fn test_exit_waits_for_registration() {
        let reaper = Arc::new(Reaper::default());
        let pid = Pid::from_raw(4_000_002);

        let mut spawning = reaper.spawning();
        let sweeper = {
            let reaper = Arc::clone(&reaper);
            thread::spawn(move || reaper.record(pid, ExitOutcome::Exited(0)))
        };
        thread::sleep(std::time::Duration::from_millis(50));
        spawning.track(pid, Path::new("/fast"));
        drop(spawning);

        sweeper.join().unwrap();
        assert!(!reaper.is_live(pid));
    }

    #[test]
    fn test_record_clears_live_entry_once() {
        let reaper = Reaper::default();
        let pid = Pid::from_raw(4_000_001);
        reaper.spawning().track(pid, Path::new("/file"));
        assert!(reaper.is_live(pid));

        reaper.record(pid, ExitOutcome::Exited(CODEC_EXEC_FAILED));
        assert!(!reaper.is_live(pid));
        assert_eq!(reaper.outstanding(), 0);
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&Reaper::global(), &Reaper::global()));
    }
}
