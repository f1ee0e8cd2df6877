use std::env;
use std::ffi::{CString, OsStr};
use std::io::{BufReader, ErrorKind, Read};
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::sync::Arc;

use libc::c_char;
use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};

use crate::api::{Subject, Supervision};
use crate::child::{self, ChildSetup};
use crate::error::{Error, OsError};
use crate::ffi_util::ToCString;
use crate::pipe::pipe;
use crate::preload_environ;
use crate::timeout;
#[cfg(target_os = "linux")]
use crate::tracer;
use crate::{Process, Shared};

fn raw_with_null(arr: &[CString]) -> Vec<*const c_char> {
    let mut vec = Vec::with_capacity(arr.len() + 1);
    for s in arr {
        vec.push(s.as_ptr());
    }
    vec.push(ptr::null());
    vec
}

/// Snapshot of the current environment plus any configured preload
/// variable, as NUL-terminated `KEY=VALUE` entries.
fn build_environ() -> Vec<CString> {
    let preload = preload_environ();
    let mut environ: Vec<CString> = Vec::new();
    for (key, value) in env::vars_os() {
        if preload.iter().any(|(k, _)| key.as_os_str() == OsStr::new(k)) {
            continue;
        }
        let mut pair = key.into_encoded_bytes();
        pair.push(b'=');
        pair.extend(value.into_encoded_bytes());
        environ.push(CString::new(pair).expect("environment entry with NUL"));
    }
    for (key, value) in preload {
        let mut pair = key.as_bytes().to_vec();
        pair.push(b'=');
        pair.extend(value.as_bytes());
        environ.push(CString::new(pair).expect("environment entry with NUL"));
    }
    environ
}

/// Reap a child we are abandoning on a failed launch; the error that got
/// us here is the one worth reporting.
fn reap_discard(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            _ => break,
        }
    }
}

impl Subject {
    /// Launch the subject.
    ///
    /// Single-phase construction: by the time this returns `Ok`, the child
    /// has successfully exec'd the target program and any supervisors are
    /// armed; an exec failure surfaces here as `Error::Exec` with the
    /// child already reaped.
    pub fn spawn(&self) -> Result<Process, Error> {
        let environ = build_environ();
        let c_args = raw_with_null(self.argv());
        let c_environ = raw_with_null(&environ);
        let input_path = self.input_path().map(|p| p.to_cstring());

        // Pipes, in the fixed order of the launch protocol: stdin only
        // when no input file is configured, then stdout, stderr, check.
        let stdin_pipe = if input_path.is_none() {
            Some(pipe()?)
        } else {
            None
        };
        let (out_rd, out_wr) = pipe()?;
        let (err_rd, err_wr) = pipe()?;
        let (check_rd, check_wr) = pipe()?;

        let traced = matches!(self.supervision(), Supervision::Traced(_));
        let setup = ChildSetup {
            filename: c_args[0],
            args: &c_args,
            environ: &c_environ,
            stdin_pipe: stdin_pipe
                .as_ref()
                .map(|(rd, wr)| (rd.as_raw_fd(), wr.as_raw_fd())),
            input_file: input_path.as_ref().map(|p| p.as_ptr()),
            stdout_pipe: (out_rd.as_raw_fd(), out_wr.as_raw_fd()),
            stderr_pipe: (err_rd.as_raw_fd(), err_wr.as_raw_fd()),
            check_pipe: (check_rd.as_raw_fd(), check_wr.as_raw_fd()),
            stop_for_tracer: traced,
        };

        let pid = match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => child,
            Ok(ForkResult::Child) => unsafe { child::child_after_fork(&setup) },
            Err(e) => return Err(Error::Fork(e.errno())),
        };
        debug!("forked subject pid {}", pid);

        // Parent side. Drop the child's pipe ends; the write ends must go
        // before the check-pipe read below can ever see EOF.
        let stdin_wr = stdin_pipe.map(|(rd, wr)| {
            drop(rd);
            wr
        });
        drop(out_wr);
        drop(err_wr);
        drop(check_wr);

        let shared = Arc::new(Shared::new(
            pid.as_raw(),
            stdin_wr,
            BufReader::new(out_rd),
            BufReader::new(err_rd),
        ));

        // Pre-exec hook: a traced subject is sitting in SIGSTOP and only
        // the tracer can release it, so the tracer must be running before
        // we block on the check pipe.
        #[cfg(target_os = "linux")]
        let tracer_thread = traced.then(|| tracer::spawn_tracer(shared.clone()));
        #[cfg(not(target_os = "linux"))]
        let tracer_thread: Option<std::thread::JoinHandle<()>> = None;

        // Exec-check handshake: zero bytes means the close-on-exec write
        // end died with a successful exec; any payload is the failure
        // marker.
        let mut check_rd = check_rd;
        let mut marker = [0u8; 5];
        let read = loop {
            match check_rd.read(&mut marker) {
                Ok(n) => break Ok(n),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Err(Error::Pipe(e.errno())),
            }
        };
        match read {
            Ok(0) => {}
            Ok(_) => {
                debug!("subject pid {} failed to exec", pid);
                reap_discard(pid);
                join_abandoned(tracer_thread);
                return Err(Error::Exec);
            }
            Err(e) => {
                let _ = kill(pid, Signal::SIGKILL);
                reap_discard(pid);
                join_abandoned(tracer_thread);
                return Err(e);
            }
        }
        // Leaking the check descriptor in a long-running test runner is
        // not acceptable; a failed close aborts the launch whole.
        if let Err(e) = check_rd.close() {
            let _ = kill(pid, Signal::SIGKILL);
            reap_discard(pid);
            join_abandoned(tracer_thread);
            return Err(e);
        }

        let watchdog = match *self.supervision() {
            Supervision::Plain => None,
            Supervision::Timeout(dur) | Supervision::Traced(dur) => {
                Some(timeout::spawn_watchdog(shared.clone(), dur))
            }
        };

        Ok(Process {
            shared,
            watchdog,
            tracer: tracer_thread,
        })
    }
}

/// A tracer armed for a launch that failed has a dead tracee; it winds
/// itself down once the exit event arrives, we only wait for it.
fn join_abandoned(tracer: Option<std::thread::JoinHandle<()>>) {
    if let Some(handle) = tracer {
        let _ = handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environ_carries_the_parent_environment() {
        env::set_var("PROCMARK_ENV_PROBE", "1");
        let environ = build_environ();
        assert!(environ
            .iter()
            .any(|e| e.as_bytes().starts_with(b"PROCMARK_ENV_PROBE=1")));
        env::remove_var("PROCMARK_ENV_PROBE");
    }

    #[test]
    fn argv_terminates_with_null() {
        let argv = vec![
            CString::new("prog").unwrap(),
            CString::new("arg").unwrap(),
        ];
        let raw = raw_with_null(&argv);
        assert_eq!(raw.len(), 3);
        assert!(raw[2].is_null());
    }
}
