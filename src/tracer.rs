//! Ptrace supervisor for a traced subject (Linux only).
//!
//! The subject stopped itself with SIGSTOP before exec; this thread
//! attaches, subscribes to fork/clone/vfork events, and follows every
//! descendant the subject creates. The thread is the sole reaper of the
//! subject while it runs, and it holds the finish mutex for its whole
//! life, releasing it only after the final group cleanup.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use libc::pid_t;
use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::{lock, Shared};

/// Hard cap on the descendants a traced subject may create. Reaching it
/// is treated as a forkbomb: the whole group and every tracked pid are
/// SIGKILLed.
pub const MAX_CHILD_COUNT: usize = 20;

pub(crate) fn spawn_tracer(shared: Arc<Shared>) -> JoinHandle<()> {
    thread::spawn(move || trace_subject(shared))
}

fn trace_subject(shared: Arc<Shared>) {
    let root = Pid::from_raw(shared.pid);

    // Held until the loop is done and the group is cleaned up; the reaper
    // publishing a termination has to wait its turn behind us.
    let _serial = lock(&shared.finish_serial);

    if let Err(e) = ptrace::attach(root) {
        warn!("can't attach to subject pid {}: {}", root, e);
        // The subject is frozen waiting for us and nobody else will ever
        // resume it.
        let _ = kill(root, Signal::SIGKILL);
        return;
    }

    let options = Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_TRACEFORK
        | Options::PTRACE_O_TRACEVFORK
        | Options::PTRACE_O_TRACESYSGOOD;
    let mut options_set = false;

    loop {
        let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
            Err(Errno::EINTR) => continue,
            Err(e) => {
                // Includes ECHILD after another thread won a reap race;
                // there is nothing left to supervise either way.
                debug!("tracer wait failed: {}", e);
                shared.kill_group_and_tracked();
                break;
            }
            Ok(status) => status,
        };
        trace!("tracer wait: {:?}", status);

        match status {
            WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => {
                if pid == root {
                    // Main subject is done; publish under the mutex we
                    // already hold.
                    shared.publish(status);
                } else if !lock(&shared.children).remove(&pid.as_raw()) {
                    trace!("untracked pid {} exited", pid);
                }
                if shared.finished() && lock(&shared.children).is_empty() {
                    break;
                }
                continue;
            }
            WaitStatus::PtraceEvent(pid, _, event)
                if event == libc::PTRACE_EVENT_FORK
                    || event == libc::PTRACE_EVENT_CLONE
                    || event == libc::PTRACE_EVENT_VFORK =>
            {
                if !track_new_child(&shared, pid) {
                    break;
                }
            }
            WaitStatus::PtraceSyscall(pid) => {
                trace_syscall(pid);
            }
            WaitStatus::Stopped(pid, Signal::SIGSTOP) if pid == root && !options_set => {
                // First stop of the subject: arm descendant reporting and
                // resume it towards exec.
                if let Err(e) = ptrace::setoptions(root, options) {
                    warn!("can't set trace options on {}: {}", root, e);
                }
                options_set = true;
                let _ = ptrace::syscall(root, None);
                continue;
            }
            _ => {}
        }

        if let Some(pid) = status.pid() {
            let _ = ptrace::cont(pid, None);
        }
    }

    // Attempt to kill everything before exiting, in case something
    // escaped.
    debug!("tracer final cleanup for pid group {}", root);
    shared.kill_group_and_tracked();
}

/// Record a fork/clone/vfork event. Returns false when the descendant cap
/// was hit and the loop must stop.
fn track_new_child(shared: &Shared, reporter: Pid) -> bool {
    let new_child = match ptrace::getevent(reporter) {
        Ok(msg) => msg as pid_t,
        Err(e) => {
            trace!("can't read pid of new child from {}: {}", reporter, e);
            return true;
        }
    };
    let count = {
        let mut children = lock(&shared.children);
        children.insert(new_child);
        children.len()
    };
    trace!("child [{}] {} created", count, new_child);

    if count >= MAX_CHILD_COUNT {
        debug!(
            "subject pid {} spawned {} descendants, killing the group",
            shared.pid, count
        );
        shared.kill_group_and_tracked();
        return false;
    }

    // Release the new process; its reporter resumes at the loop bottom.
    let _ = ptrace::cont(Pid::from_raw(new_child), None);
    true
}

/// Syscall-stop hook. The syscall number could be peeked from the user
/// area here; nothing consumes it yet.
fn trace_syscall(pid: Pid) {
    trace!("syscall stop from {}", pid);
}
