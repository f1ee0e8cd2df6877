use std::fmt;

use nix::sys::wait::WaitStatus;

/// Terminal state of a reaped subject.
///
/// Written exactly once, under the finish mutex, by whichever supervisor
/// reaps the subject (the reaper or the tracer). `exit_status` is only
/// meaningful when `abnormal_exit` is false; `signal_num` only when
/// `signalled` is true.
#[derive(Debug, Clone, Copy)]
pub struct ExitState {
    pub exit_status: i32,
    pub abnormal_exit: bool,
    pub signalled: bool,
    pub signal_num: i32,
}

impl ExitState {
    pub(crate) fn from_wait(status: WaitStatus) -> ExitState {
        match status {
            WaitStatus::Exited(_, code) => ExitState {
                exit_status: code,
                abnormal_exit: false,
                signalled: false,
                signal_num: 0,
            },
            WaitStatus::Signaled(_, sig, _core) => ExitState {
                exit_status: 0,
                abnormal_exit: true,
                signalled: true,
                signal_num: sig as i32,
            },
            // A stop or continue notification is not a termination; record
            // it as an abnormal exit rather than inventing a status.
            _ => ExitState {
                exit_status: 0,
                abnormal_exit: true,
                signalled: false,
                signal_num: 0,
            },
        }
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.signalled {
            write!(
                fmt,
                "killed by signal {}[{}]",
                signal_name(self.signal_num).unwrap_or("unknown"),
                self.signal_num
            )
        } else if self.abnormal_exit {
            write!(fmt, "terminated abnormally")
        } else {
            write!(fmt, "exited with code {}", self.exit_status)
        }
    }
}

fn signal_name(sig: i32) -> Option<&'static str> {
    match sig {
        libc::SIGABRT => Some("SIGABRT"),
        libc::SIGALRM => Some("SIGALRM"),
        libc::SIGBUS => Some("SIGBUS"),
        libc::SIGFPE => Some("SIGFPE"),
        libc::SIGHUP => Some("SIGHUP"),
        libc::SIGILL => Some("SIGILL"),
        libc::SIGINT => Some("SIGINT"),
        libc::SIGKILL => Some("SIGKILL"),
        libc::SIGPIPE => Some("SIGPIPE"),
        libc::SIGQUIT => Some("SIGQUIT"),
        libc::SIGSEGV => Some("SIGSEGV"),
        libc::SIGTERM => Some("SIGTERM"),
        _ => None,
    }
}
