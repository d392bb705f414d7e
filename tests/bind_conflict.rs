use std::net::TcpListener;
use std::process::Command;

#[test]
fn occupied_port_exits_with_status_one() {
    let holder = TcpListener::bind(("0.0.0.0", 0)).expect("reserve port");
    let port = holder.local_addr().expect("local addr").port();

    let output = Command::new(env!("CARGO_BIN_EXE_sillycoins-harvester"))
        .env("PORT", port.to_string())
        .env("COOKIES", "remember_web=abc")
        .env("RUST_LOG", "info")
        .output()
        .expect("run binary");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains(&format!("Port {} is already in use", port)),
        "unexpected stderr: {}",
        stderr
    );
    assert!(stderr.contains("EADDRINUSE"));
}
