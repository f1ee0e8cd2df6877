use std::error::Error as StdError;
use std::fmt;
use std::io;

use nix::errno::Errno;

/// Error launching or interrogating a subject process.
///
/// Most variants carry the raw `errno` of the syscall that failed. The two
/// exceptions are `Exec`, which is reported over the check pipe and carries
/// no errno (the pipe only transports a failure marker), and
/// `StreamFinished`, which is a harness-level condition rather than an OS
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A pipe could not be created. The pipes serve the subject's stdio and
    /// the internal exec-check handshake.
    Pipe(i32),
    /// The fork syscall failed.
    Fork(i32),
    /// The subject could not be executed; the child reported failure over
    /// the check pipe before exiting.
    Exec,
    /// A descriptor that must not leak could not be closed.
    Close(i32),
    /// A pipe end could not be converted into a byte-stream handle.
    FdOpen(i32),
    /// A signal could not be delivered to a still-live subject.
    Signal(i32),
    /// An expected-output file could not be opened.
    Stream(i32),
    /// A stream was read after the subject had been reaped and its handles
    /// closed.
    StreamFinished,
}

impl Error {
    /// Bare OS error code, where one exists for the variant.
    pub fn raw_os_error(&self) -> Option<i32> {
        use self::Error::*;
        match *self {
            Pipe(x) | Fork(x) | Close(x) | FdOpen(x) | Signal(x) | Stream(x) => Some(x),
            Exec | StreamFinished => None,
        }
    }

    fn message(&self) -> &'static str {
        use self::Error::*;
        match *self {
            Pipe(_) => "can't create pipe",
            Fork(_) => "error when forking",
            Exec => "subject could not be executed",
            Close(_) => "error closing descriptor",
            FdOpen(_) => "error opening pipe end as a stream",
            Signal(_) => "error signalling subject",
            Stream(_) => "can't open expected-output file",
            StreamFinished => "stream already closed by reap",
        }
    }
}

impl StdError for Error {}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self.raw_os_error() {
            Some(code) => {
                // Format similar to that of std::io::Error
                write!(
                    fmt,
                    "{}: {} (os error {})",
                    self.message(),
                    io::Error::from_raw_os_error(code),
                    code
                )
            }
            None => write!(fmt, "{}", self.message()),
        }
    }
}

/// Something carrying a raw OS error code.
pub(crate) trait OsError {
    fn errno(&self) -> i32;
}

impl OsError for Errno {
    fn errno(&self) -> i32 {
        *self as i32
    }
}

impl OsError for io::Error {
    fn errno(&self) -> i32 {
        self.raw_os_error().unwrap_or(-1)
    }
}

/// Wrap a syscall result into a harness error, capturing the errno.
///
/// `wrap` is one of the tuple variants of `Error`, e.g.
/// `result(Error::Pipe, pipe2(..))`.
#[inline]
pub(crate) fn result<T, E: OsError>(wrap: fn(i32) -> Error, r: Result<T, E>) -> Result<T, Error> {
    r.map_err(|e| wrap(e.errno()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_preserved() {
        let err = result(Error::Pipe, Err::<(), _>(Errno::EMFILE)).unwrap_err();
        assert_eq!(err, Error::Pipe(Errno::EMFILE as i32));
        assert_eq!(err.raw_os_error(), Some(Errno::EMFILE as i32));
    }

    #[test]
    fn display_names_the_operation() {
        let msg = format!("{}", Error::Fork(libc::EAGAIN));
        assert!(msg.starts_with("error when forking"));
        assert!(msg.contains("os error"));

        assert_eq!(format!("{}", Error::Exec), "subject could not be executed");
        assert_eq!(Error::Exec.raw_os_error(), None);
    }
}
