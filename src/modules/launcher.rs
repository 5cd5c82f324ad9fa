//! Launching codec processes wired to a pipe.

use super::config::Mode;
use super::constants::CODEC_EXEC_FAILED;
use super::error::{FsError, FsResult};
use super::reaper::Reaper;
use log::debug;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::{dup2, fork, pipe2, ForkResult, Pid};
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::raw::c_char;
use std::path::Path;
use std::ptr;

/// A forked codec child.
///
/// The exit status is collected by the process-wide [`Reaper`]; dropping the
/// handle triggers a non-blocking sweep, so a child whose session went away
/// is never forgotten.
#[derive(Debug)]
pub struct CodecProcess {
    pid: Pid,
}

impl CodecProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl Drop for CodecProcess {
    fn drop(&mut self) {
        let reaped = Reaper::global().sweep();
        debug!("Released codec {}; sweep collected {} children", self.pid, reaped);
    }
}

/// Result of a successful launch: the filesystem's end of the pipe and the
/// child running the codec.
#[derive(Debug)]
pub struct CodecLaunch {
    /// Write end (ingest) or read end (egress)
    pub pipe: File,
    pub process: CodecProcess,
}

/// Forks `argv[0]` with its stdin (ingest) or stdout (egress) connected to a
/// new pipe.
///
/// `virtual_path` is only used to attribute the child's exit status.
///
/// # Errors
///
/// * [`FsError::ResourceExhausted`] when the pipe cannot be created
/// * [`FsError::ProcessSpawnFailed`] when `fork` fails; both pipe ends are
///   closed and nothing is left behind
///
/// A failing `execvp` is not an error here: the child exits with
/// `CODEC_EXEC_FAILED` and the session sees an empty stream.
pub fn spawn_codec(argv: &[CString], mode: Mode, virtual_path: &Path) -> FsResult<CodecLaunch> {
    if argv.is_empty() {
        return Err(FsError::InvalidPath(String::new()));
    }

    // the child may not allocate between fork and exec
    let mut arg_ptrs: Vec<*const c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    arg_ptrs.push(ptr::null());

    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(FsError::ResourceExhausted)?;
    // SAFETY: pipe2 just returned these descriptors and nothing else owns them
    let (read_end, write_end) =
        unsafe { (OwnedFd::from_raw_fd(read_end), OwnedFd::from_raw_fd(write_end)) };

    let (parent_end, child_end, child_stream) = match mode {
        Mode::Ingest => (write_end, read_end, libc::STDIN_FILENO),
        Mode::Egress => (read_end, write_end, libc::STDOUT_FILENO),
    };

    let reaper = Reaper::global();
    let mut spawning = reaper.spawning();
    // SAFETY: the child only calls async-signal-safe functions before exec
    match unsafe { fork() } {
        Err(e) => Err(FsError::ProcessSpawnFailed(e)),
        Ok(ForkResult::Child) => exec_codec(
            child_end.as_raw_fd(),
            parent_end.as_raw_fd(),
            child_stream,
            &arg_ptrs,
        ),
        Ok(ForkResult::Parent { child }) => {
            spawning.track(child, virtual_path);
            drop(spawning);
            drop(child_end);
            debug!(
                "Spawned codec {} for {:?} ({} mode, pipe fd {})",
                child,
                virtual_path,
                mode,
                parent_end.as_raw_fd()
            );
            Ok(CodecLaunch {
                pipe: File::from(parent_end),
                process: CodecProcess { pid: child },
            })
        }
    }
}

/// Child side of [`spawn_codec`]. Never returns.
fn exec_codec(child_end: RawFd, parent_end: RawFd, stream: RawFd, argv: &[*const c_char]) -> ! {
    if child_end == stream {
        // dup2 onto itself would keep O_CLOEXEC
        if fcntl(child_end, FcntlArg::F_SETFD(FdFlag::empty())).is_err() {
            unsafe { libc::_exit(CODEC_EXEC_FAILED) }
        }
    } else if dup2(child_end, stream).is_err() {
        unsafe { libc::_exit(CODEC_EXEC_FAILED) }
    }

    unsafe {
        // ignored signals and the blocked mask survive exec
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        let mut unblocked: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut unblocked);
        libc::sigprocmask(libc::SIG_SETMASK, &unblocked, ptr::null_mut());

        if parent_end != stream {
            libc::close(parent_end);
        }
        if child_end != stream {
            libc::close(child_end);
        }
        libc::execvp(argv[0], argv.as_ptr());
        libc::_exit(CODEC_EXEC_FAILED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;
    use std::time::{Duration, Instant};

    fn args(list: &[&str]) -> Vec<CString> {
        list.iter().map(|a| CString::new(*a).unwrap()).collect()
    }

    fn wait_reaped(pid: Pid) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            Reaper::global().sweep();
            if !Reaper::global().is_live(pid) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_egress_child_writes_to_pipe() -> FsResult<()> {
        let launch = spawn_codec(&args(&["echo", "decoded"]), Mode::Egress, Path::new("/echo"))?;
        let pid = launch.process.pid();
        let mut out = String::new();
        (&launch.pipe).read_to_string(&mut out)?;
        assert_eq!(out, "decoded\n");

        drop(launch);
        assert!(wait_reaped(pid));
        Ok(())
    }

    #[test]
    fn test_ingest_child_reads_from_pipe() -> FsResult<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("out");
        let script = format!("cat > '{}'", target.display());
        let launch = spawn_codec(&args(&["sh", "-c", &script]), Mode::Ingest, Path::new("/out"))?;
        let pid = launch.process.pid();

        (&launch.pipe).write_all(b"plain bytes")?;
        drop(launch);

        assert!(wait_reaped(pid));
        assert_eq!(std::fs::read(&target)?, b"plain bytes");
        Ok(())
    }

    #[test]
    fn test_exec_failure_is_an_empty_stream() -> FsResult<()> {
        let launch = spawn_codec(
            &args(&["/nonexistent/holefs-codec"]),
            Mode::Egress,
            Path::new("/missing-codec"),
        )?;
        let pid = launch.process.pid();
        let mut out = Vec::new();
        (&launch.pipe).read_to_end(&mut out)?;
        assert!(out.is_empty());

        drop(launch);
        assert!(wait_reaped(pid));
        Ok(())
    }

    #[test]
    fn test_codec_dies_when_reader_goes_away() -> FsResult<()> {
        let script = "while :; do echo xxxxxxxx; done";
        let launch = spawn_codec(&args(&["sh", "-c", script]), Mode::Egress, Path::new("/endless"))?;
        let pid = launch.process.pid();
        let mut head = [0u8; 4];
        (&launch.pipe).read_exact(&mut head)?;
        assert_eq!(&head, b"xxxx");

        drop(launch);
        assert!(wait_reaped(pid), "codec {} kept running after its reader left", pid);
        Ok(())
    }

    #[test]
    fn test_empty_argv_is_rejected() {
        assert!(spawn_codec(&[], Mode::Egress, Path::new("/x")).is_err());
    }
}
