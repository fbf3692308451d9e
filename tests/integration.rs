use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

struct AgentGuard(Child);

impl Drop for AgentGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn_agent(socket: &str, extra_args: &[&str]) -> AgentGuard {
    let uid = nix::unistd::Uid::current().as_raw();
    let mut cmd = Command::cargo_bin("secmem-agent").unwrap();
    cmd.arg("--socket")
        .arg(socket)
        .arg("--allow-uid")
        .arg(uid.to_string())
        .args(extra_args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    let child = cmd.spawn().expect("spawn agent");
    thread::sleep(Duration::from_millis(250));
    AgentGuard(child)
}

#[test]
fn put_get_roundtrip() {
    let socket = "/dev/shm/secmem_it_roundtrip.sock";
    let _agent = spawn_agent(socket, &[]);

    Command::cargo_bin("secmemctl")
        .unwrap()
        .arg("--socket")
        .arg(socket)
        .arg("put")
        .arg("db_password=supersecret")
        .arg("--ttl")
        .arg("2s")
        .assert()
        .success();

    Command::cargo_bin("secmemctl")
        .unwrap()
        .arg("--socket")
        .arg(socket)
        .arg("get")
        .arg("db_password")
        .assert()
        .success()
        .stdout(contains("supersecret"));
}

#[test]
fn ttl_expiration_prevents_get() {
    let socket = "/dev/shm/secmem_it_ttl.sock";
    let _agent = spawn_agent(socket, &[]);

    Command::cargo_bin("secmemctl")
        .unwrap()
        .arg("--socket")
        .arg(socket)
        .arg("put")
        .arg("short=one")
        .arg("--ttl")
        .arg("1s")
        .assert()
        .success();

    thread::sleep(Duration::from_millis(2500));

    Command::cargo_bin("secmemctl")
        .unwrap()
        .arg("--socket")
        .arg(socket)
        .arg("get")
        .arg("short")
        .assert()
        .failure();

    Command::cargo_bin("secmemctl")
        .unwrap()
        .arg("--socket")
        .arg(socket)
        .arg("list")
        .assert()
        .success()
        .stdout(contains("short").not());
}

#[test]
fn delete_removes_secret() {
    let socket = "/dev/shm/secmem_it_delete.sock";
    let _agent = spawn_agent(socket, &[]);

    Command::cargo_bin("secmemctl")
        .unwrap()
        .arg("--socket")
        .arg(socket)
        .arg("put")
        .arg("k=v")
        .assert()
        .success();

    Command::cargo_bin("secmemctl")
        .unwrap()
        .arg("--socket")
        .arg(socket)
        .arg("delete")
        .arg("k")
        .assert()
        .success();

    Command::cargo_bin("secmemctl")
        .unwrap()
        .arg("--socket")
        .arg(socket)
        .arg("get")
        .arg("k")
        .assert()
        .failure();
}

#[test]
fn list_shows_only_put_names() {
    let socket = "/dev/shm/secmem_it_list.sock";
    let _agent = spawn_agent(socket, &[]);

    for name in ["a1", "a2"] {
        Command::cargo_bin("secmemctl")
            .unwrap()
            .arg("--socket")
            .arg(socket)
            .arg("put")
            .arg(format!("{name}=x"))
            .assert()
            .success();
    }

    Command::cargo_bin("secmemctl")
        .unwrap()
        .arg("--socket")
        .arg(socket)
        .arg("list")
        .assert()
        .success()
        .stdout(contains("a1"))
        .stdout(contains("a2"));
}

#[test]
fn metrics_reports_op_counts() {
    let socket = "/dev/shm/secmem_it_metrics.sock";
    let _agent = spawn_agent(socket, &[]);

    Command::cargo_bin("secmemctl")
        .unwrap()
        .arg("--socket")
        .arg(socket)
        .arg("put")
        .arg("m=v")
        .assert()
        .success();

    Command::cargo_bin("secmemctl")
        .unwrap()
        .arg("--socket")
        .arg(socket)
        .arg("metrics")
        .assert()
        .success()
        .stdout(contains("secmem_ops_total{op=\"put\"}"))
        .stdout(contains("secmem_secrets_gauge"))
        .stdout(contains("secmem_latency_seconds_bucket"));
}
