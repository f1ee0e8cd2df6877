use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

use libc::{c_void, size_t};
use nix::fcntl::OFlag;
use nix::unistd::pipe2;

use crate::error::{result, Error, OsError};

/// Reading end of an anonymous pipe.
///
/// Both ends are created close-on-exec; the child clears the flag on fds
/// 0..=2 via `dup2` and keeps it on the check-pipe write end, whose silent
/// close on a successful exec is the success signal.
#[derive(Debug)]
pub struct PipeReader(RawFd);

/// Writing end of an anonymous pipe.
#[derive(Debug)]
pub struct PipeWriter(RawFd);

/// Create an anonymous pipe, both ends close-on-exec.
pub fn pipe() -> Result<(PipeReader, PipeWriter), Error> {
    let (rd, wr) = result(Error::Pipe, pipe2(OFlag::O_CLOEXEC))?;
    Ok((PipeReader(rd.into_raw_fd()), PipeWriter(wr.into_raw_fd())))
}

impl PipeReader {
    /// Extract the file descriptor without closing it.
    pub fn into_fd(self) -> RawFd {
        let PipeReader(fd) = self;
        mem::forget(self);
        fd
    }

    /// Close the descriptor, reporting a close failure instead of
    /// swallowing it in `Drop`.
    pub fn close(self) -> Result<(), Error> {
        close_fd(self.into_fd())
    }
}

impl PipeWriter {
    /// Extract the file descriptor without closing it.
    pub fn into_fd(self) -> RawFd {
        let PipeWriter(fd) = self;
        mem::forget(self);
        fd
    }

    /// Close the descriptor, reporting a close failure instead of
    /// swallowing it in `Drop`.
    pub fn close(self) -> Result<(), Error> {
        close_fd(self.into_fd())
    }
}

fn close_fd(fd: RawFd) -> Result<(), Error> {
    if unsafe { libc::close(fd) } != 0 {
        Err(Error::Close(io::Error::last_os_error().errno()))
    } else {
        Ok(())
    }
}

impl AsRawFd for PipeReader {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl AsRawFd for PipeWriter {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

impl io::Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let ret =
            unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut c_void, buf.len() as size_t) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }
}

impl io::Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let ret =
            unsafe { libc::write(self.0, buf.as_ptr() as *const c_void, buf.len() as size_t) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn roundtrip() {
        let (mut rd, mut wr) = pipe().unwrap();
        wr.write_all(b"ping").unwrap();
        drop(wr);
        let mut buf = Vec::new();
        rd.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"ping");
    }

    #[test]
    fn close_reports_once() {
        let (rd, wr) = pipe().unwrap();
        assert!(rd.close().is_ok());
        assert!(wr.close().is_ok());
    }
}
