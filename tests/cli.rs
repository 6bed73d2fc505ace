use assert_cmd::Command;
use std::net::UdpSocket;

#[test]
fn help_lists_subcommands() {
    let out = Command::cargo_bin("slowdns")
        .unwrap()
        .arg("--help")
        .output()
        .unwrap();

    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("serve"));
    assert!(stdout.contains("health"));
}

#[test]
fn health_fails_without_a_proxy() {
    // puerto reservado que nadie contesta
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = silent.local_addr().unwrap().port();

    Command::cargo_bin("slowdns")
        .unwrap()
        .env("IP", "127.0.0.1")
        .env("PORT", port.to_string())
        .args(["health", "--timeout-ms", "200"])
        .assert()
        .failure();
}

#[test]
fn unreadable_config_is_fatal() {
    Command::cargo_bin("slowdns")
        .unwrap()
        .args(["-c", "/nonexistent/slowdns.toml", "health"])
        .assert()
        .failure();
}

#[test]
fn serve_without_upstreams_exits_with_error() {
    Command::cargo_bin("slowdns")
        .unwrap()
        .env("IP", "127.0.0.1")
        .env("PORT", "0")
        .env("DNS_SERVERS", "")
        .arg("serve")
        .assert()
        .failure();
}
