//! Child-process harness for automated-marking test suites.
//!
//! A test describes a subject program with [`Subject`], launches it, and
//! interrogates the running [`Process`] with assertion-style calls: the
//! next bytes on stdout are exactly these, the exit status is zero, the
//! process was killed by that signal. The harness owns the plumbing this
//! needs: the stdio pipes, the fork/exec handshake that makes exec
//! failures observable, reaping, an optional wall-clock watchdog, and an
//! optional ptrace supervisor that follows descendants and contains
//! forkbombs.
//!
//! This is a low-level Unix interface; tracing is Linux-only.
//!
//! ```no_run
//! use procmark::Subject;
//!
//! let proc = Subject::new("/bin/echo").arg("hello").spawn().unwrap();
//! assert!(proc.expect_stdout("hello\n").unwrap());
//! assert!(proc.assert_exit_status(0));
//! ```

use std::collections::HashSet;
use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use libc::pid_t;
use log::warn;
use once_cell::sync::Lazy;

mod api;
mod child;
mod error;
mod ffi_util;
mod pipe;
mod reaper;
mod run;
mod status;
mod stream;
mod timeout;
#[cfg(target_os = "linux")]
mod tracer;

pub use api::{Subject, Supervision};
pub use error::Error;
pub use status::ExitState;
#[cfg(target_os = "linux")]
pub use tracer::MAX_CHILD_COUNT;

use pipe::{PipeReader, PipeWriter};
use stream::{InputHandle, OutputHandle};

/// A launched subject process.
///
/// Owns the subject's pipes, its pid, and any supervisor threads. Dropping
/// the handle kills a still-running subject, reaps it, and joins the
/// supervisors, so nothing outlives the value.
#[derive(Debug)]
pub struct Process {
    shared: Arc<Shared>,
    watchdog: Option<JoinHandle<()>>,
    tracer: Option<JoinHandle<()>>,
}

/// State shared between the caller and the supervisor threads.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) pid: pid_t,
    /// Serializes terminal-state publication and stream teardown between
    /// the reaper and the tracer. The tracer holds it for its whole run.
    pub(crate) finish_serial: Mutex<()>,
    /// Write-once terminal state; `Some` is the `finished` flag.
    pub(crate) terminal: Mutex<Option<ExitState>>,
    pub(crate) finish_cv: Condvar,
    timed_out: AtomicBool,
    pub(crate) stdin: InputHandle,
    pub(crate) stdout: OutputHandle,
    pub(crate) stderr: OutputHandle,
    /// Descendants the tracer is following.
    pub(crate) children: Mutex<HashSet<pid_t>>,
    /// Watchdog cancellation gate.
    pub(crate) gate: Mutex<bool>,
    pub(crate) gate_cv: Condvar,
}

impl Shared {
    pub(crate) fn new(
        pid: pid_t,
        stdin: Option<PipeWriter>,
        stdout: BufReader<PipeReader>,
        stderr: BufReader<PipeReader>,
    ) -> Shared {
        Shared {
            pid,
            finish_serial: Mutex::new(()),
            terminal: Mutex::new(None),
            finish_cv: Condvar::new(),
            timed_out: AtomicBool::new(false),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(Some(stdout)),
            stderr: Mutex::new(Some(stderr)),
            children: Mutex::new(HashSet::new()),
            gate: Mutex::new(false),
            gate_cv: Condvar::new(),
        }
    }

    pub(crate) fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::Relaxed);
    }

    pub(crate) fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Relaxed)
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // Cancel the watchdog's sleep before anything slow below.
        {
            let mut cancelled = lock(&self.shared.gate);
            *cancelled = true;
            self.shared.gate_cv.notify_all();
        }
        if !self.shared.finished() {
            self.shared.kill_tracked();
            if let Err(e) = self.shared.send_kill() {
                warn!("teardown kill of pid group {}: {}", self.shared.pid, e);
            }
        }
        // Supervisors must not outlive the process state they watch.
        if let Some(thread) = self.watchdog.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.tracer.take() {
            let _ = thread.join();
        }
    }
}

/// Lock that shrugs off poisoning: a panicked holder leaves the data no
/// less usable for teardown paths than it was.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Process-wide preload value, read once per spawn under the lock.
static PRELOAD: Lazy<Mutex<String>> = Lazy::new(|| Mutex::new(String::new()));

/// Configure a shared library to inject into every subsequently spawned
/// subject via the platform's preload mechanism. An empty value turns
/// injection off.
pub fn set_preload<S: Into<String>>(value: S) {
    *lock(&PRELOAD) = value.into();
}

/// The currently configured preload value.
pub fn get_preload() -> String {
    lock(&PRELOAD).clone()
}

/// Environment entries the preload configuration adds to a subject.
pub(crate) fn preload_environ() -> Vec<(&'static str, String)> {
    let value = get_preload();
    if value.is_empty() {
        return Vec::new();
    }
    if cfg!(target_os = "macos") {
        vec![
            ("DYLD_FORCE_FLAT_NAMESPACE", "1".to_string()),
            ("DYLD_INSERT_LIBRARIES", value),
        ]
    } else {
        vec![("LD_PRELOAD", value)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preload_round_trips() {
        set_preload("/tmp/shim.so");
        assert_eq!(get_preload(), "/tmp/shim.so");
        let environ = preload_environ();
        assert!(environ.iter().any(|(_, v)| v == "/tmp/shim.so"));
        set_preload("");
        assert_eq!(get_preload(), "");
        assert!(preload_environ().is_empty());
    }
}
