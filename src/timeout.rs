//! Wall-clock watchdog for a launched subject.
//!
//! One thread per timeout-configured subject. The sleep is a condvar wait
//! with a deadline so teardown can cancel it promptly; there is no thread
//! cancellation to lean on.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::{lock, Shared};

pub(crate) fn spawn_watchdog(shared: Arc<Shared>, timeout: Duration) -> JoinHandle<()> {
    thread::spawn(move || watch(shared, timeout))
}

fn watch(shared: Arc<Shared>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    let mut cancelled = lock(&shared.gate);
    loop {
        if *cancelled {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let (guard, _) = shared
            .gate_cv
            .wait_timeout(cancelled, deadline - now)
            .unwrap_or_else(|e| e.into_inner());
        cancelled = guard;
    }
    drop(cancelled);

    // A subject that finished under the deadline needs nothing from us; a
    // race where it finishes right now just makes the kills below no-ops.
    if shared.finished() {
        return;
    }
    shared.mark_timed_out();
    debug!("subject pid {} exceeded its deadline, killing", shared.pid);

    // Tracked descendants first: anything that escaped the process group
    // is only reachable through the tracer's set.
    shared.kill_tracked();
    if let Err(e) = shared.send_kill() {
        // The group may already be dead; nothing to deliver to.
        warn!("deadline kill of pid group {}: {}", shared.pid, e);
    }
}
