//! End-to-end scenarios driving real system binaries.

use std::io::Write;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use procmark::{Error, Subject};
use tempfile::NamedTempFile;

// A tracer's wait loop reaps any child of this process, so every test
// that forks holds this lock for its whole body.
static FORK_LOCK: Mutex<()> = Mutex::new(());

fn fork_lock() -> MutexGuard<'static, ()> {
    FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn hello_world() {
    let _lock = fork_lock();
    let proc = Subject::new("/bin/echo").arg("hello").spawn().unwrap();
    assert!(proc.expect_stdout("hello\n").unwrap());
    assert!(proc.assert_exit_status(0));
    assert!(!proc.signalled());
}

#[test]
fn path_lookup_uses_argv0() {
    let _lock = fork_lock();
    let proc = Subject::new("echo").arg("found").spawn().unwrap();
    assert!(proc.expect_stdout("found\n").unwrap());
    assert!(proc.assert_exit_status(0));
}

#[test]
fn exit_code_is_recorded() {
    let _lock = fork_lock();
    let proc = Subject::from_argv(["/bin/sh", "-c", "exit 7"])
        .spawn()
        .unwrap();
    assert!(proc.assert_exit_status(7));
    assert!(!proc.assert_exit_status(0));
    assert_eq!(proc.exit_status(), Some(7));
}

#[test]
fn death_by_signal_is_recorded() {
    let _lock = fork_lock();
    let proc = Subject::new("/bin/sh")
        .args(["-c", "kill -SEGV $$"])
        .spawn()
        .unwrap();
    assert!(proc.assert_signalled(true));
    assert!(proc.assert_signal(libc::SIGSEGV));
    assert!(proc.abnormal_exit());
    // Exit status and signal death are mutually exclusive.
    assert_eq!(proc.exit_status(), None);
    assert_eq!(proc.signal(), Some(libc::SIGSEGV));
}

#[test]
fn exec_failure_surfaces_at_construction() {
    let _lock = fork_lock();
    let err = Subject::new("/no/such/binary").spawn().unwrap_err();
    assert_eq!(err, Error::Exec);
}

#[test]
fn echo_roundtrip_through_cat() {
    let _lock = fork_lock();
    let proc = Subject::new("/bin/cat").spawn().unwrap();
    assert!(proc.send("abc\n"));
    assert_eq!(proc.readline_stdout().unwrap(), b"abc\n");
    assert!(proc.finish_input());
    assert!(proc.assert_exit_status(0));
}

#[test]
fn finish_input_reports_true_exactly_once() {
    let _lock = fork_lock();
    let proc = Subject::new("/bin/cat").spawn().unwrap();
    assert!(proc.finish_input());
    assert!(!proc.finish_input());
    assert!(!proc.finish_input());
    assert!(proc.assert_exit_status(0));
}

#[test]
fn empty_expectation_asserts_eof() {
    let _lock = fork_lock();
    let proc = Subject::new("/bin/echo").arg("hi").spawn().unwrap();
    assert!(!proc.expect_stdout("").unwrap());
    assert!(proc.expect_stdout("hi\n").unwrap());
    assert!(proc.expect_stdout("").unwrap());
    assert!(proc.assert_exit_status(0));
}

#[test]
fn streams_are_errors_after_reap() {
    let _lock = fork_lock();
    let proc = Subject::new("/bin/echo").arg("gone").spawn().unwrap();
    assert!(proc.assert_exit_status(0));
    assert_eq!(proc.expect_stdout("gone\n"), Err(Error::StreamFinished));
    assert_eq!(proc.readline_stdout(), Err(Error::StreamFinished));
    assert!(!proc.send("late\n"));
}

#[test]
fn expect_file_compares_to_eof() {
    let _lock = fork_lock();
    let mut expected = NamedTempFile::new().unwrap();
    expected.write_all(b"line one\nline two\n").unwrap();

    let proc = Subject::new("/bin/cat").spawn().unwrap();
    assert!(proc.send("line one\nline two\n"));
    assert!(proc.finish_input());
    assert!(proc.expect_stdout_file(expected.path()).unwrap());
    assert!(proc.assert_exit_status(0));
}

#[test]
fn expect_file_rejects_longer_output() {
    let _lock = fork_lock();
    let mut expected = NamedTempFile::new().unwrap();
    expected.write_all(b"line one\n").unwrap();

    let proc = Subject::new("/bin/cat").spawn().unwrap();
    assert!(proc.send("line one\nline two\n"));
    assert!(proc.finish_input());
    assert!(!proc.expect_stdout_file(expected.path()).unwrap());
}

#[test]
fn missing_expectation_file_is_a_stream_error() {
    let _lock = fork_lock();
    let proc = Subject::new("/bin/echo").spawn().unwrap();
    match proc.expect_stdout_file("/no/such/expected-output") {
        Err(Error::Stream(_)) => {}
        other => panic!("expected a stream error, got {:?}", other),
    }
}

#[test]
fn stderr_is_its_own_stream() {
    let _lock = fork_lock();
    let proc = Subject::new("/bin/sh")
        .args(["-c", "echo out; echo err 1>&2"])
        .spawn()
        .unwrap();
    assert_eq!(proc.readline_stderr().unwrap(), b"err\n");
    assert_eq!(proc.readline_stdout().unwrap(), b"out\n");
    assert!(proc.assert_exit_status(0));
}

#[test]
fn input_file_replaces_the_stdin_pipe() {
    let _lock = fork_lock();
    let mut input = NamedTempFile::new().unwrap();
    input.write_all(b"from a file\n").unwrap();

    let proc = Subject::new("/bin/cat")
        .input_file(input.path())
        .spawn()
        .unwrap();
    // No pipe to write to or close.
    assert!(!proc.send("ignored\n"));
    assert!(!proc.finish_input());
    assert!(proc.expect_stdout("from a file\n").unwrap());
    assert!(proc.assert_exit_status(0));
}

#[test]
fn send_file_copies_into_stdin() {
    let _lock = fork_lock();
    let mut input = NamedTempFile::new().unwrap();
    input.write_all(b"copied through\n").unwrap();

    let proc = Subject::new("/bin/cat").spawn().unwrap();
    assert!(proc.send_file(input.path()));
    assert!(proc.finish_input());
    assert!(proc.expect_stdout("copied through\n").unwrap());
    assert!(proc.assert_exit_status(0));
}

#[test]
fn print_stdout_drains_the_stream() {
    let _lock = fork_lock();
    let proc = Subject::new("/bin/echo").arg("printed").spawn().unwrap();
    proc.print_stdout().unwrap();
    assert!(proc.expect_stdout("").unwrap());
    assert!(proc.assert_exit_status(0));
}

#[test]
fn send_signal_terminates_the_subject() {
    let _lock = fork_lock();
    let proc = Subject::new("/bin/sleep").arg("60").spawn().unwrap();
    assert!(!proc.check_signalled());
    proc.send_signal(libc::SIGTERM).unwrap();
    assert!(proc.assert_signalled(true));
    assert!(proc.assert_signal(libc::SIGTERM));
}

#[test]
fn signalling_a_finished_subject_is_not_an_error() {
    let _lock = fork_lock();
    let proc = Subject::new("/bin/true").spawn().unwrap();
    assert!(proc.assert_exit_status(0));
    // Probe fails, the reap has already happened; nothing to deliver.
    proc.send_signal(libc::SIGTERM).unwrap();
    proc.kill().unwrap();
}

#[test]
fn kill_takes_down_the_whole_group() {
    let _lock = fork_lock();
    let proc = Subject::new("/bin/sh")
        .args(["-c", "/bin/sleep 60 & /bin/sleep 60"])
        .spawn()
        .unwrap();
    proc.kill().unwrap();
    assert!(proc.assert_signalled(true));
    assert!(proc.assert_signal(libc::SIGKILL));
    assert!(proc.check_signalled());
}

#[test]
fn timeout_fires_within_bound() {
    let _lock = fork_lock();
    let started = Instant::now();
    let proc = Subject::new("/bin/sleep")
        .arg("60")
        .timeout(Duration::from_secs(1))
        .spawn()
        .unwrap();
    assert!(proc.assert_signalled(true));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(proc.timed_out());
    assert!(proc.signalled());
    assert_eq!(proc.signal(), Some(libc::SIGKILL));
}

#[test]
fn timeout_leaves_a_fast_subject_alone() {
    let _lock = fork_lock();
    let proc = Subject::new("/bin/echo")
        .arg("quick")
        .timeout(Duration::from_secs(30))
        .spawn()
        .unwrap();
    assert!(proc.expect_stdout("quick\n").unwrap());
    assert!(proc.assert_exit_status(0));
    assert!(!proc.timed_out());
    // Dropping must cancel the watchdog, not sit out the 30 seconds.
    let started = Instant::now();
    drop(proc);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn drop_kills_a_running_subject() {
    let _lock = fork_lock();
    let started = Instant::now();
    let proc = Subject::new("/bin/sleep").arg("60").spawn().unwrap();
    drop(proc);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[cfg(target_os = "linux")]
mod traced {
    use super::*;

    #[test]
    fn traced_subject_runs_normally() {
        let _lock = fork_lock();
        let proc = Subject::new("/bin/echo")
            .arg("traced")
            .traced(Duration::from_secs(10))
            .spawn()
            .unwrap();
        assert!(proc.expect_stdout("traced\n").unwrap());
        assert!(proc.assert_exit_status(0));
        assert!(proc.child_pids().is_empty());
    }

    #[test]
    fn traced_exec_failure_still_surfaces() {
        let _lock = fork_lock();
        let err = Subject::new("/no/such/binary")
            .traced(Duration::from_secs(10))
            .spawn()
            .unwrap_err();
        assert_eq!(err, Error::Exec);
    }

    #[test]
    fn traced_subject_sees_its_descendants() {
        let _lock = fork_lock();
        let proc = Subject::new("/bin/sh")
            .args(["-c", "/bin/true & /bin/true & wait"])
            .traced(Duration::from_secs(10))
            .spawn()
            .unwrap();
        assert!(proc.assert_exit_status(0));
        assert!(proc.child_pids().len() <= 2);
    }

    #[test]
    fn forkbomb_is_contained() {
        let _lock = fork_lock();
        let started = Instant::now();
        let proc = Subject::new("/bin/sh")
            .args(["-c", "while true; do /bin/sleep 10 & done"])
            .traced(Duration::from_secs(5))
            .spawn()
            .unwrap();
        assert!(proc.assert_signalled(true));
        assert!(proc.assert_signal(libc::SIGKILL));
        assert!(proc.child_pids().len() <= procmark::MAX_CHILD_COUNT);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn timeout_covers_a_traced_subject() {
        let _lock = fork_lock();
        let proc = Subject::new("/bin/sleep")
            .arg("60")
            .traced(Duration::from_secs(1))
            .spawn()
            .unwrap();
        assert!(proc.assert_signalled(true));
        assert!(proc.timed_out());
        assert_eq!(proc.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn preload_variable_reaches_the_subject() {
        let _lock = fork_lock();
        procmark::set_preload("/tmp/pm-shim.so");
        let proc = Subject::new("/bin/sh")
            .args(["-c", "printenv LD_PRELOAD"])
            .spawn()
            .unwrap();
        let line = proc.readline_stdout().unwrap();
        procmark::set_preload("");
        assert_eq!(line, b"/tmp/pm-shim.so\n");
    }

    #[test]
    fn no_descriptors_leak_across_a_lifecycle() {
        let _lock = fork_lock();
        let before = open_fd_count();
        let proc = Subject::new("/bin/echo").arg("fds").spawn().unwrap();
        assert!(proc.assert_exit_status(0));
        drop(proc);
        assert_eq!(open_fd_count(), before);
    }

    fn open_fd_count() -> usize {
        std::fs::read_dir("/proc/self/fd").unwrap().count()
    }
}
