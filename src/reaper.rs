use libc::pid_t;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::Error;
use crate::status::ExitState;
use crate::stream;
use crate::{lock, Process, Shared};

impl Shared {
    /// Monotonic: once true, the terminal fields are stable forever.
    pub(crate) fn finished(&self) -> bool {
        lock(&self.terminal).is_some()
    }

    pub(crate) fn exit_state(&self) -> Option<ExitState> {
        *lock(&self.terminal)
    }

    /// Reap the subject if it has terminated.
    ///
    /// Blocking mode waits for termination; non-blocking returns with the
    /// process still unfinished when the subject is alive. A wait error
    /// means somebody else (the tracer, or an earlier call) already reaped
    /// the child, which is not an error here; a blocking caller then
    /// parks until the terminal state has been published.
    pub(crate) fn perform_wait(&self, block: bool) {
        if self.finished() {
            return;
        }
        let flags = if block {
            None
        } else {
            Some(WaitPidFlag::WNOHANG)
        };
        loop {
            match waitpid(Pid::from_raw(self.pid), flags) {
                Ok(WaitStatus::StillAlive) => return,
                Ok(status @ WaitStatus::Exited(..)) | Ok(status @ WaitStatus::Signaled(..)) => {
                    self.finalize(status);
                    return;
                }
                // Stops and continues are not terminations; keep waiting.
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(_) => {
                    if block {
                        self.wait_published();
                    }
                    return;
                }
            }
        }
    }

    fn wait_published(&self) {
        let mut terminal = lock(&self.terminal);
        while terminal.is_none() {
            terminal = self
                .finish_cv
                .wait(terminal)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Record a termination observed outside the tracer.
    pub(crate) fn finalize(&self, status: WaitStatus) {
        let _serial = lock(&self.finish_serial);
        self.publish(status);
    }

    /// Publish the terminal state and tear the streams down.
    ///
    /// The caller holds the finish mutex (the tracer keeps it for its
    /// whole run; `finalize` takes it just for this).
    pub(crate) fn publish(&self, status: WaitStatus) {
        let mut terminal = lock(&self.terminal);
        if terminal.is_some() {
            return;
        }
        for (name, closed) in [
            ("stdin", stream::close_input(&self.stdin)),
            ("stdout", stream::close_output(&self.stdout)),
            ("stderr", stream::close_output(&self.stderr)),
        ] {
            if let Err(e) = closed {
                warn!("closing subject {}: {}", name, e);
            }
        }
        let state = ExitState::from_wait(status);
        debug!("subject pid {} finished: {}", self.pid, state);
        *terminal = Some(state);
        self.finish_cv.notify_all();
    }

    /// Probe-then-signal, so a wrong-way race with a natural exit is
    /// reported as "finished" rather than as a delivery failure.
    pub(crate) fn signal_pid(&self, target: pid_t, sig: i32) -> Result<(), Error> {
        let target = Pid::from_raw(target);
        if kill(target, None).is_err() {
            self.perform_wait(true);
            if !self.finished() {
                return Err(Error::Signal(Errno::ESRCH as i32));
            }
            return Ok(());
        }
        let sig = signal_from_raw(sig)?;
        kill(target, sig).map_err(|e| Error::Signal(e as i32))
    }

    /// SIGKILL the whole group and reap.
    pub(crate) fn send_kill(&self) -> Result<(), Error> {
        let r = self.signal_pid(-self.pid, libc::SIGKILL);
        self.perform_wait(true);
        r
    }

    /// SIGKILL every descendant the tracer has tracked.
    pub(crate) fn kill_tracked(&self) {
        for &pid in lock(&self.children).iter() {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }

    /// SIGKILL the group and the tracked descendants both; the group
    /// covers anyone who stayed in it, the set covers anyone who left.
    #[cfg(target_os = "linux")]
    pub(crate) fn kill_group_and_tracked(&self) {
        use nix::sys::signal::killpg;

        if let Err(e) = killpg(Pid::from_raw(self.pid), Signal::SIGKILL) {
            debug!("group kill of {}: {}", self.pid, e);
        }
        self.kill_tracked();
    }
}

fn signal_from_raw(sig: i32) -> Result<Option<Signal>, Error> {
    if sig == 0 {
        // Signal zero is the liveness probe.
        return Ok(None);
    }
    Signal::try_from(sig)
        .map(Some)
        .map_err(|_| Error::Signal(Errno::EINVAL as i32))
}

impl Process {
    /// Blocking reap, then compare the recorded exit status. False when
    /// the subject did not exit normally.
    pub fn assert_exit_status(&self, expected: i32) -> bool {
        self.shared.perform_wait(true);
        match self.shared.exit_state() {
            Some(state) => !state.abnormal_exit && state.exit_status == expected,
            None => false,
        }
    }

    /// Blocking reap, then compare against whether a signal terminated
    /// the subject.
    pub fn assert_signalled(&self, expected: bool) -> bool {
        self.shared.perform_wait(true);
        match self.shared.exit_state() {
            Some(state) => state.signalled == expected,
            None => false,
        }
    }

    /// Blocking reap, then require death by exactly this signal.
    pub fn assert_signal(&self, expected: i32) -> bool {
        self.shared.perform_wait(true);
        match self.shared.exit_state() {
            Some(state) => state.signalled && state.signal_num == expected,
            None => false,
        }
    }

    /// Non-blocking probe; true when the subject has been killed by a
    /// signal.
    pub fn check_signalled(&self) -> bool {
        self.shared.perform_wait(false);
        self.shared
            .exit_state()
            .map(|state| state.signalled)
            .unwrap_or(false)
    }

    /// Send an arbitrary signal to the subject.
    pub fn send_signal(&self, sig: i32) -> Result<(), Error> {
        self.shared.signal_pid(self.shared.pid, sig)
    }

    /// Send an arbitrary signal to the subject's whole process group.
    pub fn send_signal_group(&self, sig: i32) -> Result<(), Error> {
        self.shared.signal_pid(-self.shared.pid, sig)
    }

    /// SIGKILL the subject's process group and wait for the reap.
    pub fn kill(&self) -> Result<(), Error> {
        self.shared.send_kill()
    }
}
