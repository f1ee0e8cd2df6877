use std::os::unix::io::RawFd;

use libc::{c_char, c_void};

// At this point we are on the child side of the fork and must be
// considered hamstrung: until exec, nothing beyond bare syscalls is safe.
//
// ESPECIALLY NO MEMORY (DE)ALLOCATIONS. The parent prepared every string
// and descriptor in `ChildSetup`; this module only plumbs and execs.

/// Everything the child needs after the fork, fully prepared by the
/// parent. Passed by reference so nothing is dropped on this side.
pub struct ChildSetup<'a> {
    pub filename: *const c_char,
    pub args: &'a [*const c_char],
    pub environ: &'a [*const c_char],
    /// (read, write) ends of the stdin pipe; absent when an input file is
    /// configured instead.
    pub stdin_pipe: Option<(RawFd, RawFd)>,
    /// Path the subject reads as stdin, already NUL-terminated.
    pub input_file: Option<*const c_char>,
    pub stdout_pipe: (RawFd, RawFd),
    pub stderr_pipe: (RawFd, RawFd),
    pub check_pipe: (RawFd, RawFd),
    /// Stop ourselves just before exec so a tracer can attach.
    pub stop_for_tracer: bool,
}

/// Failure marker written to the check pipe when anything below goes
/// wrong before exec. A successful exec closes the (close-on-exec) write
/// end instead, so the parent reads zero bytes.
const FAIL_TOKEN: &[u8; 4] = b"fail";

pub unsafe fn child_after_fork(child: &ChildSetup) -> ! {
    let (check_rd, check_wr) = child.check_pipe;

    // Stdin: either the configured input file or the pipe's read end.
    if let Some(path) = child.input_file {
        let fd = libc::open(path, libc::O_RDONLY);
        if fd < 0 || libc::dup2(fd, 0) < 0 {
            fail(check_wr);
        }
        if fd != 0 {
            libc::close(fd);
        }
    } else if let Some((rd, wr)) = child.stdin_pipe {
        if libc::dup2(rd, 0) < 0 {
            fail(check_wr);
        }
        libc::close(wr);
        libc::close(rd);
    }

    let (out_rd, out_wr) = child.stdout_pipe;
    if libc::dup2(out_wr, 1) < 0 {
        fail(check_wr);
    }
    libc::close(out_rd);
    libc::close(out_wr);

    let (err_rd, err_wr) = child.stderr_pipe;
    if libc::dup2(err_wr, 2) < 0 {
        fail(check_wr);
    }
    libc::close(err_rd);
    libc::close(err_wr);

    libc::close(check_rd);

    // Become our own process-group leader: the group is the unit both the
    // group-kill operations and the tracer's descendant cleanup act on.
    if libc::setpgid(0, 0) != 0 {
        fail(check_wr);
    }

    // check_wr already carries O_CLOEXEC from pipe creation; exec-success
    // closes it without another syscall here.

    if child.stop_for_tracer {
        // Freeze until the tracer attaches and resumes us.
        libc::raise(libc::SIGSTOP);
    }

    // The new program inherits the environment the parent assembled
    // (including any preload variable); swap the global environ so the
    // PATH-searching exec picks it up.
    ffi::environ = child.environ.as_ptr();
    libc::execvp(child.filename, child.args.as_ptr());

    fail(check_wr);
}

unsafe fn fail(check_wr: RawFd) -> ! {
    // Writes under PIPE_BUF are atomic; there is nothing useful to do if
    // this write fails anyway.
    libc::write(
        check_wr,
        FAIL_TOKEN.as_ptr() as *const c_void,
        FAIL_TOKEN.len(),
    );
    libc::close(check_wr);
    libc::_exit(-1);
}

/// The libc crate does not re-export the global environment pointer.
mod ffi {
    use libc::c_char;

    extern "C" {
        pub static mut environ: *const *const c_char;
    }
}
