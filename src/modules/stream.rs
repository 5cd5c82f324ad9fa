//! Moving content between kernel requests and codec pipes.
//!
//! Session I/O must run while holding the session's turn (see
//! [`SessionTicket::run`](super::session::SessionTicket::run)); plain handles
//! are positional and need no ordering.

use super::config::Mode;
use super::error::{FsError, FsResult};
use super::session::Session;
use log::{debug, warn};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;

/// Reads up to `size` bytes of the codec's output.
///
/// Pipes hand out whatever the codec has produced so far, so the loop keeps
/// reading until the request is satisfied or the stream ends. A short result
/// means end of stream; every later call returns nothing without touching
/// the pipe.
pub fn read_session(session: &Session, size: usize) -> FsResult<Vec<u8>> {
    if session.mode() == Mode::Ingest {
        warn!(
            "Read on write-only session {} for {:?}; returning no data",
            session.handle(),
            session.path()
        );
        return Ok(Vec::new());
    }
    if session.at_eof() {
        return Ok(Vec::new());
    }

    let mut buf = vec![0u8; size];
    let mut filled = 0;
    let mut pipe = session.pipe();
    while filled < size {
        match pipe.read(&mut buf[filled..]) {
            Ok(0) => {
                debug!("Codec output for {:?} ended", session.path());
                session.mark_eof();
                break;
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    buf.truncate(filled);
    session.add_transferred(filled);
    Ok(buf)
}

/// Hands `data` to the codec with a single write.
///
/// A short count is returned as-is for the kernel to retry with the rest.
pub fn write_session(session: &Session, data: &[u8]) -> FsResult<usize> {
    if session.mode() == Mode::Egress {
        return Err(FsError::unsupported("write", Mode::Egress));
    }

    let mut pipe = session.pipe();
    let written = loop {
        match pipe.write(data) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    };
    if written < data.len() {
        debug!(
            "Short write to codec for {:?}: {} of {} bytes",
            session.path(),
            written,
            data.len()
        );
    }
    session.add_transferred(written);
    Ok(written)
}

/// Positional read from a plain backing file.
pub fn read_plain(file: &File, offset: u64, size: usize) -> FsResult<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Positional write to a plain backing file.
pub fn write_plain(file: &File, offset: u64, data: &[u8]) -> FsResult<usize> {
    loop {
        match file.write_at(data, offset) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::launcher::spawn_codec;
    use anyhow::Result;
    use std::ffi::CString;
    use std::path::Path;

    fn session(mode: Mode, script: &str) -> Result<Session> {
        let argv: Vec<CString> = ["sh", "-c", script]
            .iter()
            .map(|a| CString::new(*a).unwrap())
            .collect();
        let launch = spawn_codec(&argv, mode, Path::new("/stream"))?;
        Ok(Session::new(launch, mode, Path::new("/stream")))
    }

    #[test]
    fn test_read_returns_min_of_request_and_available() -> Result<()> {
        let session = session(Mode::Egress, "printf hello")?;
        assert_eq!(read_session(&session, 3)?, b"hel");
        assert_eq!(read_session(&session, 100)?, b"lo");
        assert!(session.at_eof());
        assert!(read_session(&session, 100)?.is_empty());
        assert_eq!(session.transferred(), 5);
        Ok(())
    }

    #[test]
    fn test_read_accumulates_across_chunks() -> Result<()> {
        let session = session(Mode::Egress, "printf ab; sleep 0.2; printf cd")?;
        assert_eq!(read_session(&session, 4)?, b"abcd");
        Ok(())
    }

    #[test]
    fn test_read_on_ingest_session_is_empty() -> Result<()> {
        let session = session(Mode::Ingest, "cat > /dev/null")?;
        assert!(read_session(&session, 16)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_write_reaches_codec() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("sink");
        let session = session(Mode::Ingest, &format!("cat > '{}'", target.display()))?;
        assert_eq!(write_session(&session, b"first ")?, 6);
        assert_eq!(write_session(&session, b"second")?, 6);
        let pid = session.pid();
        session.close();

        let reaper = crate::modules::reaper::Reaper::global();
        for _ in 0..500 {
            reaper.sweep();
            if !reaper.is_live(pid) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(std::fs::read(&target)?, b"first second");
        Ok(())
    }

    #[test]
    fn test_write_on_egress_session_is_refused() -> Result<()> {
        let session = session(Mode::Egress, "true")?;
        let err = write_session(&session, b"x").unwrap_err();
        assert_eq!(err.errno(), libc::EROFS);
        Ok(())
    }

    #[test]
    fn test_plain_positional_io() -> Result<()> {
        let file = tempfile::tempfile()?;
        assert_eq!(write_plain(&file, 0, b"0123456789")?, 10);
        assert_eq!(write_plain(&file, 2, b"ab")?, 2);
        assert_eq!(read_plain(&file, 1, 4)?, b"1ab4");
        assert_eq!(read_plain(&file, 8, 10)?, b"89");
        assert!(read_plain(&file, 20, 4)?.is_empty());
        Ok(())
    }
}
