use std::time::Duration;

use procmark::Subject;

fn main() {
    env_logger::init();

    let proc = Subject::new("/bin/sleep")
        .arg("60")
        .timeout(Duration::from_secs(2))
        .spawn()
        .unwrap();

    println!("spawned pid {}, waiting for the watchdog", proc.pid());
    println!("killed by signal: {}", proc.assert_signalled(true));
    println!("timed out: {}", proc.timed_out());
    println!("signal: {:?}", proc.signal());
}
