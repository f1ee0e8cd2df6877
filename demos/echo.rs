use procmark::Subject;

fn main() {
    env_logger::init();

    let proc = Subject::new("/bin/echo")
        .arg("hello")
        .arg("world!")
        .spawn()
        .unwrap();

    println!("spawned pid {}", proc.pid());
    println!("stdout matched: {}", proc.expect_stdout("hello world!\n").unwrap());
    println!("exit status 0: {}", proc.assert_exit_status(0));
}
