//! Byte-stream operations over the subject's standard pipes.
//!
//! Every stream handle lives behind a mutex as an `Option`: a supervisor
//! thread that reaps the subject takes the handle out and closes it, and
//! every read loop here re-locks and re-checks for `None` before each
//! underlying read. A caller that keeps reading after the reap gets
//! `Error::StreamFinished`, never a silent EOF.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::Mutex;

use log::{debug, warn};

use crate::error::{Error, OsError};
use crate::lock;
use crate::pipe::{PipeReader, PipeWriter};

/// Chunk size for draining a stream to the host's stdout.
const PRINT_CHUNK: usize = 80;

pub(crate) type OutputHandle = Mutex<Option<BufReader<PipeReader>>>;
pub(crate) type InputHandle = Mutex<Option<PipeWriter>>;

/// Write the whole message to the subject's stdin.
///
/// Returns false when the handle is already closed or the write fails;
/// nothing is truncated, the message lands whole or the call reports
/// failure.
pub(crate) fn send(handle: &InputHandle, bytes: &[u8]) -> bool {
    let mut guard = lock(handle);
    let writer = match guard.as_mut() {
        Some(w) => w,
        None => return false,
    };
    if let Err(e) = writer.write_all(bytes).and_then(|()| writer.flush()) {
        debug!("send to subject failed: {}", e);
        return false;
    }
    true
}

/// Close the subject's stdin so it sees EOF.
///
/// True exactly once; repeated calls and close failures return false.
pub(crate) fn finish_input(handle: &InputHandle) -> bool {
    let writer = match lock(handle).take() {
        Some(w) => w,
        None => return false,
    };
    match writer.close() {
        Ok(()) => true,
        Err(e) => {
            warn!("closing subject stdin: {}", e);
            false
        }
    }
}

/// Read one byte, re-checking the handle on every call.
///
/// `Ok(None)` is EOF. Read errors other than EINTR are logged and treated
/// as EOF, the way stdio folds them into the end-of-stream indicator.
fn read_byte(handle: &OutputHandle) -> Result<Option<u8>, Error> {
    loop {
        let mut guard = lock(handle);
        let reader = guard.as_mut().ok_or(Error::StreamFinished)?;
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("read from subject stream failed: {}", e);
                return Ok(None);
            }
        }
    }
}

/// True when the next read on the stream would return EOF.
///
/// Peeks through the buffer without consuming anything.
fn at_eof(handle: &OutputHandle) -> Result<bool, Error> {
    loop {
        let mut guard = lock(handle);
        let reader = guard.as_mut().ok_or(Error::StreamFinished)?;
        match reader.fill_buf() {
            Ok(buf) => return Ok(buf.is_empty()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("peek on subject stream failed: {}", e);
                return Ok(false);
            }
        }
    }
}

/// The next `expected.len()` bytes on the stream compare equal to
/// `expected`. An empty expectation means the stream must be at EOF.
pub(crate) fn expect(handle: &OutputHandle, expected: &[u8]) -> Result<bool, Error> {
    if expected.is_empty() {
        return at_eof(handle);
    }
    for &want in expected {
        match read_byte(handle)? {
            Some(got) if got == want => continue,
            _ => return Ok(false),
        }
    }
    Ok(true)
}

/// Byte-by-byte compare of the stream's remaining output against the
/// file's contents; true iff both reach EOF at the same point.
pub(crate) fn expect_file(handle: &OutputHandle, path: &Path) -> Result<bool, Error> {
    let file = File::open(path).map_err(|e| Error::Stream(e.errno()))?;
    let mut expected = BufReader::new(file).bytes();
    loop {
        let want = match expected.next() {
            Some(Ok(b)) => Some(b),
            Some(Err(ref e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Some(Err(e)) => {
                debug!("read of expected-output file failed: {}", e);
                return Ok(false);
            }
            None => None,
        };
        let got = read_byte(handle)?;
        match (want, got) {
            (None, None) => return Ok(true),
            (Some(w), Some(g)) if w == g => continue,
            _ => return Ok(false),
        }
    }
}

/// Accumulate bytes up to and including the next newline, or to EOF.
pub(crate) fn readline(handle: &OutputHandle) -> Result<Vec<u8>, Error> {
    let mut line = Vec::new();
    while let Some(byte) = read_byte(handle)? {
        line.push(byte);
        if byte == b'\n' {
            break;
        }
    }
    Ok(line)
}

/// Drain the stream to the host's stdout in fixed-size chunks.
pub(crate) fn print_stream(handle: &OutputHandle) -> Result<(), Error> {
    let stdout = io::stdout();
    loop {
        let mut chunk = [0u8; PRINT_CHUNK];
        let n = {
            let mut guard = lock(handle);
            let reader = guard.as_mut().ok_or(Error::StreamFinished)?;
            match reader.read(&mut chunk) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("drain of subject stream failed: {}", e);
                    return Ok(());
                }
            }
        };
        if n == 0 {
            return Ok(());
        }
        let mut out = stdout.lock();
        if out.write_all(&chunk[..n]).and_then(|()| out.flush()).is_err() {
            return Ok(());
        }
    }
}

/// Take an output handle out and close it, so later readers see
/// `StreamFinished` instead of a dangling descriptor.
pub(crate) fn close_output(handle: &OutputHandle) -> Result<(), Error> {
    match lock(handle).take() {
        Some(reader) => reader.into_inner().close(),
        None => Ok(()),
    }
}

/// Take the input handle out and close it; closed-already is fine here,
/// unlike `finish_input` this runs on the teardown path.
pub(crate) fn close_input(handle: &InputHandle) -> Result<(), Error> {
    match lock(handle).take() {
        Some(writer) => writer.close(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::pipe;

    fn output_from(bytes: &[u8]) -> OutputHandle {
        let (rd, mut wr) = pipe().unwrap();
        wr.write_all(bytes).unwrap();
        drop(wr);
        Mutex::new(Some(BufReader::new(rd)))
    }

    #[test]
    fn expect_matches_prefix() {
        let out = output_from(b"hello world\n");
        assert_eq!(expect(&out, b"hello").unwrap(), true);
        assert_eq!(expect(&out, b" world\n").unwrap(), true);
    }

    #[test]
    fn expect_rejects_mismatch() {
        let out = output_from(b"hello\n");
        assert_eq!(expect(&out, b"help").unwrap(), false);
    }

    #[test]
    fn empty_expect_means_eof() {
        let out = output_from(b"x");
        assert_eq!(expect(&out, b"").unwrap(), false);
        assert_eq!(expect(&out, b"x").unwrap(), true);
        assert_eq!(expect(&out, b"").unwrap(), true);
    }

    #[test]
    fn expect_on_short_stream_fails() {
        let out = output_from(b"hi");
        assert_eq!(expect(&out, b"hi there").unwrap(), false);
    }

    #[test]
    fn readline_keeps_newline() {
        let out = output_from(b"one\ntwo");
        assert_eq!(readline(&out).unwrap(), b"one\n");
        assert_eq!(readline(&out).unwrap(), b"two");
        assert_eq!(readline(&out).unwrap(), b"");
    }

    #[test]
    fn closed_stream_is_an_error_not_eof() {
        let out = output_from(b"data");
        close_output(&out).unwrap();
        assert_eq!(expect(&out, b"data"), Err(Error::StreamFinished));
        assert_eq!(readline(&out), Err(Error::StreamFinished));
    }

    #[test]
    fn finish_input_is_idempotent() {
        let (_rd, wr) = pipe().unwrap();
        let input: InputHandle = Mutex::new(Some(wr));
        assert!(finish_input(&input));
        assert!(!finish_input(&input));
        assert!(!finish_input(&input));
    }

    #[test]
    fn send_after_close_reports_failure() {
        let (_rd, wr) = pipe().unwrap();
        let input: InputHandle = Mutex::new(Some(wr));
        assert!(send(&input, b"live\n"));
        assert!(finish_input(&input));
        assert!(!send(&input, b"dead\n"));
    }
}
