use std::collections::HashSet;
use std::ffi::{CString, OsStr};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use libc::pid_t;
use log::debug;

use crate::error::Error;
use crate::ffi_util::ToCString;
use crate::stream;
use crate::{lock, Process};

/// How a spawned subject is supervised.
///
/// The supervision mode is plain data dispatched on inside the launch
/// path; there is no class hierarchy behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervision {
    /// No watchdog; the subject runs until it exits or is killed.
    Plain,
    /// A watchdog thread kills the subject's process group once the
    /// duration elapses.
    Timeout(Duration),
    /// Timeout plus a ptrace supervisor that follows every descendant and
    /// enforces the forkbomb cap. Linux only; elsewhere it degrades to
    /// `Timeout`.
    Traced(Duration),
}

/// Description of a subject program to launch.
///
/// Mostly the same builder surface as `std::process::Command`, restricted
/// to what a marking harness needs: argv, an optional stdin file, and a
/// supervision mode.
pub struct Subject {
    argv: Vec<CString>,
    input_file: Option<PathBuf>,
    supervision: Supervision,
}

impl Subject {
    /// Describe a subject launching the program at `program`.
    pub fn new<S: AsRef<OsStr>>(program: S) -> Subject {
        Subject {
            argv: vec![program.to_cstring()],
            input_file: None,
            supervision: Supervision::Plain,
        }
    }

    /// Describe a subject from a whole argument vector; the first element
    /// names the program. This is the one-shot form the embedding host
    /// constructs with.
    ///
    /// Panics on an empty vector: there is no program to look up.
    pub fn from_argv<I, S>(argv: I) -> Subject
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let argv: Vec<CString> = argv.into_iter().map(|a| a.to_cstring()).collect();
        assert!(!argv.is_empty(), "argv must name a program");
        Subject {
            argv,
            input_file: None,
            supervision: Supervision::Plain,
        }
    }

    /// Add an argument to pass to the subject.
    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Subject {
        self.argv.push(arg.to_cstring());
        self
    }

    /// Add multiple arguments to pass to the subject.
    pub fn args<I, S>(&mut self, args: I) -> &mut Subject
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.argv.extend(args.into_iter().map(|a| a.to_cstring()));
        self
    }

    /// Feed the subject's stdin from a file instead of a pipe. With an
    /// input file configured, `send` and `finish_input` have no pipe to
    /// act on and report failure.
    pub fn input_file<P: AsRef<Path>>(&mut self, path: P) -> &mut Subject {
        self.input_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Kill the subject's process group after `timeout`.
    pub fn timeout(&mut self, timeout: Duration) -> &mut Subject {
        self.supervision = Supervision::Timeout(timeout);
        self
    }

    /// Trace the subject and its descendants, with the same timeout
    /// protection as `timeout`.
    #[cfg(target_os = "linux")]
    pub fn traced(&mut self, timeout: Duration) -> &mut Subject {
        self.supervision = Supervision::Traced(timeout);
        self
    }

    /// Tracing needs ptrace fork events; on this platform only the
    /// timeout protection is available.
    #[cfg(not(target_os = "linux"))]
    pub fn traced(&mut self, timeout: Duration) -> &mut Subject {
        log::warn!("descendant tracing is Linux-only, falling back to a plain timeout");
        self.supervision = Supervision::Timeout(timeout);
        self
    }

    pub(crate) fn argv(&self) -> &[CString] {
        &self.argv
    }

    pub(crate) fn input_path(&self) -> Option<&Path> {
        self.input_file.as_deref()
    }

    pub(crate) fn supervision(&self) -> &Supervision {
        &self.supervision
    }
}

impl Process {
    /// OS process id of the subject.
    pub fn pid(&self) -> pid_t {
        self.shared.pid
    }

    /// Exit status of the subject; `Some` only after it has been reaped
    /// and only if it exited normally.
    pub fn exit_status(&self) -> Option<i32> {
        self.shared
            .exit_state()
            .filter(|state| !state.abnormal_exit)
            .map(|state| state.exit_status)
    }

    /// True once the subject has been reaped without a normal exit.
    pub fn abnormal_exit(&self) -> bool {
        self.shared
            .exit_state()
            .map(|state| state.abnormal_exit)
            .unwrap_or(false)
    }

    /// True once the subject has been reaped after dying to a signal.
    pub fn signalled(&self) -> bool {
        self.shared
            .exit_state()
            .map(|state| state.signalled)
            .unwrap_or(false)
    }

    /// The signal that killed the subject, once `signalled` is true.
    pub fn signal(&self) -> Option<i32> {
        self.shared
            .exit_state()
            .filter(|state| state.signalled)
            .map(|state| state.signal_num)
    }

    /// True once the watchdog has fired for this subject.
    pub fn timed_out(&self) -> bool {
        self.shared.timed_out()
    }

    /// Write bytes to the subject's stdin and flush them through.
    pub fn send<B: AsRef<[u8]>>(&self, bytes: B) -> bool {
        stream::send(&self.shared.stdin, bytes.as_ref())
    }

    /// Copy a file's contents into the subject's stdin.
    pub fn send_file<P: AsRef<Path>>(&self, path: P) -> bool {
        let mut file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) => {
                debug!("can't open input file {:?}: {}", path.as_ref(), e);
                return false;
            }
        };
        let mut chunk = [0u8; 4096];
        loop {
            match file.read(&mut chunk) {
                Ok(0) => return true,
                Ok(n) => {
                    if !stream::send(&self.shared.stdin, &chunk[..n]) {
                        return false;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("can't read input file {:?}: {}", path.as_ref(), e);
                    return false;
                }
            }
        }
    }

    /// Close the subject's stdin; true exactly once.
    pub fn finish_input(&self) -> bool {
        stream::finish_input(&self.shared.stdin)
    }

    /// The next bytes on stdout are exactly `expected`; an empty
    /// expectation asserts EOF.
    pub fn expect_stdout<B: AsRef<[u8]>>(&self, expected: B) -> Result<bool, Error> {
        stream::expect(&self.shared.stdout, expected.as_ref())
    }

    /// The next bytes on stderr are exactly `expected`.
    pub fn expect_stderr<B: AsRef<[u8]>>(&self, expected: B) -> Result<bool, Error> {
        stream::expect(&self.shared.stderr, expected.as_ref())
    }

    /// The rest of stdout matches the file's contents byte for byte.
    pub fn expect_stdout_file<P: AsRef<Path>>(&self, path: P) -> Result<bool, Error> {
        stream::expect_file(&self.shared.stdout, path.as_ref())
    }

    /// The rest of stderr matches the file's contents byte for byte.
    pub fn expect_stderr_file<P: AsRef<Path>>(&self, path: P) -> Result<bool, Error> {
        stream::expect_file(&self.shared.stderr, path.as_ref())
    }

    /// Read one line from stdout, newline included when one was found.
    pub fn readline_stdout(&self) -> Result<Vec<u8>, Error> {
        stream::readline(&self.shared.stdout)
    }

    /// Read one line from stderr.
    pub fn readline_stderr(&self) -> Result<Vec<u8>, Error> {
        stream::readline(&self.shared.stderr)
    }

    /// Drain the subject's stdout to our stdout.
    pub fn print_stdout(&self) -> Result<(), Error> {
        stream::print_stream(&self.shared.stdout)
    }

    /// Drain the subject's stderr to our stdout.
    pub fn print_stderr(&self) -> Result<(), Error> {
        stream::print_stream(&self.shared.stderr)
    }

    /// Pids of the descendants the tracer has tracked. Empty for an
    /// untraced subject.
    pub fn child_pids(&self) -> HashSet<pid_t> {
        lock(&self.shared.children).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_argv() {
        let mut subject = Subject::new("/bin/echo");
        subject.arg("-n").args(["a", "b"]);
        let argv: Vec<&str> = subject
            .argv()
            .iter()
            .map(|a| a.to_str().unwrap())
            .collect();
        assert_eq!(argv, ["/bin/echo", "-n", "a", "b"]);
    }

    #[test]
    fn from_argv_takes_the_whole_vector() {
        let subject = Subject::from_argv(["/bin/sh", "-c", "exit 0"]);
        let argv: Vec<&str> = subject
            .argv()
            .iter()
            .map(|a| a.to_str().unwrap())
            .collect();
        assert_eq!(argv, ["/bin/sh", "-c", "exit 0"]);
        assert_eq!(*subject.supervision(), Supervision::Plain);
    }

    #[test]
    fn supervision_defaults_to_plain() {
        let subject = Subject::new("/bin/true");
        assert_eq!(*subject.supervision(), Supervision::Plain);
    }

    #[test]
    fn timeout_sets_supervision() {
        let mut subject = Subject::new("/bin/true");
        subject.timeout(Duration::from_secs(3));
        assert_eq!(
            *subject.supervision(),
            Supervision::Timeout(Duration::from_secs(3))
        );
    }
}
