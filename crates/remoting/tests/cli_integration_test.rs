//! CLI Integration Tests
//!
//! Runs the `remoting` binary against a demo service started by the same
//! binary on a free loopback port.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

// ============================================================================
// Test Helpers
// ============================================================================

fn remoting() -> Command {
    Command::new(env!("CARGO_BIN_EXE_remoting"))
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Demo service that is killed when dropped.
struct Served {
    child: Child,
    addr: SocketAddr,
}

impl Served {
    fn start() -> Self {
        let port = free_port();
        let child = remoting()
            .args(["serve", "-p", &port.to_string(), "--tick-ms", "0"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to start serve");
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while TcpStream::connect(addr).is_err() {
            assert!(Instant::now() < deadline, "serve did not start listening");
            std::thread::sleep(Duration::from_millis(50));
        }
        Served { child, addr }
    }

    fn call(&self, method: &str, params: &str) -> Output {
        remoting()
            .args(["call", &self.addr.to_string(), method, "-p", params])
            .output()
            .expect("failed to run call")
    }
}

impl Drop for Served {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_help_lists_subcommands() {
    let output = remoting().arg("--help").output().unwrap();
    let text = String::from_utf8_lossy(&output.stdout);
    for command in ["serve", "call", "publish", "listen"] {
        assert!(text.contains(command), "help should mention {}", command);
    }
}

#[test]
fn test_call_rejects_non_array_params() {
    let output = remoting()
        .args(["call", "127.0.0.1:1", "echo", "-p", "{\"a\": 1}"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("JSON array"));
}

#[test]
fn test_call_against_demo_service() {
    let served = Served::start();

    let output = served.call("echo", "[{\"x\": [1, 2]}]");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value, serde_json::json!({"x": [1, 2]}));

    let output = served.call("add", "[2, 3]");
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value.as_f64(), Some(5.0));
}

#[test]
fn test_remote_error_exits_non_zero() {
    let served = Served::start();

    let output = served.call("error", "[\"boom\"]");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("IllegalState boom"));
}

#[test]
fn test_publish_without_subscribers_prints_payload() {
    let served = Served::start();

    let output = remoting()
        .args(["publish", &served.addr.to_string(), "price", "{\"v\": 10}", "--linger-ms", "0"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value, serde_json::json!({"v": 10}));
}
