#[path = "common/mod.rs"]
mod common;

use std::{
    process::{Command as StdCommand, Stdio},
    time::Duration,
};

use assert_cmd::{Command, cargo::cargo_bin};
use common::{HEALTHY, ScriptService, Stack, fast_settings, wait_until};
use predicates::{boolean::PredicateBooleanExt, str::contains};

fn stack() -> Stack {
    Stack::new(&[
        ScriptService::new("chain", HEALTHY),
        ScriptService::new("indexer", HEALTHY).depends_on(&["chain"]),
    ])
}

fn isomer(stack: &Stack) -> Command {
    let mut cmd = Command::cargo_bin("isomer").expect("binary not built");
    cmd.arg("--root")
        .arg(stack.root())
        .arg("--config")
        .arg(stack.settings_path())
        .arg("--manifest")
        .arg(stack.manifest_path())
        .arg("--log-level")
        .arg("warn");
    cmd
}

#[test]
fn binaries_check_then_download() {
    let stack = stack();

    isomer(&stack)
        .args(["binaries", "check"])
        .assert()
        .success()
        .stdout(contains("chain").and(contains("not installed")));

    isomer(&stack)
        .args(["binaries", "download"])
        .assert()
        .success()
        .stdout(contains("chain: installed 1.0.0").and(contains("indexer: installed 1.0.0")));

    isomer(&stack)
        .args(["binaries", "check", "--json"])
        .assert()
        .success()
        .stdout(contains("\"status\": \"installed\""));
}

#[test]
fn status_without_running_engine() {
    let stack = stack();
    isomer(&stack)
        .arg("status")
        .assert()
        .success()
        .stdout(contains("isomer engine is not running"));
}

#[test]
fn down_without_running_engine_is_a_noop() {
    let stack = stack();
    isomer(&stack).arg("down").assert().success();
}

#[test]
fn reset_requires_confirmation() {
    let stack = stack();
    isomer(&stack)
        .arg("reset")
        .assert()
        .failure()
        .stderr(contains("--yes"));

    isomer(&stack)
        .args(["reset", "--yes"])
        .assert()
        .success()
        .stdout(contains("Chain data reset"));
}

#[test]
fn chain_commands_need_a_running_engine() {
    let stack = stack();
    isomer(&stack)
        .args(["mine", "1"])
        .assert()
        .failure()
        .stderr(contains("isomer up"));
}

#[test]
fn invalid_log_level_is_rejected() {
    let stack = stack();
    let mut cmd = Command::cargo_bin("isomer").unwrap();
    cmd.args(["--log-level", "9", "--root"])
        .arg(stack.root())
        .arg("status")
        .assert()
        .failure()
        .stderr(contains("expected 0-5"));
}

#[test]
fn config_apply_saves_settings_offline() {
    let stack = stack();

    isomer(&stack)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(contains("rpc_user: isomer"));

    let mut settings = fast_settings();
    settings.bitcoind.rpc_user = "alice".into();
    let file = stack.settings_path().with_file_name("next.yaml");
    settings.save(&file).unwrap();

    isomer(&stack)
        .args(["config", "apply"])
        .arg(&file)
        .assert()
        .success()
        .stdout(contains("Settings saved"));

    isomer(&stack)
        .args(["config", "show", "--json"])
        .assert()
        .success()
        .stdout(contains("\"rpc_user\": \"alice\""));
    assert_eq!(
        isomer::config::Settings::load(&stack.settings_path())
            .unwrap()
            .bitcoind
            .rpc_user,
        "alice"
    );
}

#[test]
fn config_apply_is_refused_while_the_stack_runs() {
    let stack = stack();
    isomer(&stack).args(["binaries", "download"]).assert().success();

    let mut up = StdCommand::new(cargo_bin("isomer"))
        .arg("--root")
        .arg(stack.root())
        .arg("--config")
        .arg(stack.settings_path())
        .arg("--manifest")
        .arg(stack.manifest_path())
        .arg("up")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn isomer up");

    let socket = stack.layout.control_socket();
    assert!(wait_until(Duration::from_secs(15), || socket.exists()));
    isomer(&stack)
        .args(["status", "--json"])
        .timeout(Duration::from_secs(30))
        .assert()
        .success()
        .stdout(contains("\"is_ready\": true"));

    let mut settings = fast_settings();
    settings.bitcoind.rpc_user = "alice".into();
    let file = stack.settings_path().with_file_name("next.yaml");
    settings.save(&file).unwrap();

    isomer(&stack)
        .args(["config", "apply"])
        .arg(&file)
        .assert()
        .failure()
        .stderr(contains("stopped"));

    isomer(&stack)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(contains("rpc_user: isomer"));

    isomer(&stack)
        .args(["binaries", "download", "chain"])
        .assert()
        .failure()
        .stderr(contains("while it is running"));

    isomer(&stack).arg("down").assert().success();
    let exited = wait_until(Duration::from_secs(15), || {
        matches!(up.try_wait(), Ok(Some(_)))
    });
    if !exited {
        let _ = up.kill();
    }
    assert!(exited, "isomer up did not exit after down");
}

#[test]
fn up_serves_the_control_socket_until_down() {
    let stack = stack();
    isomer(&stack).args(["binaries", "download"]).assert().success();

    let mut up = StdCommand::new(cargo_bin("isomer"))
        .arg("--root")
        .arg(stack.root())
        .arg("--config")
        .arg(stack.settings_path())
        .arg("--manifest")
        .arg(stack.manifest_path())
        .arg("up")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn isomer up");

    let socket = stack.layout.control_socket();
    assert!(wait_until(Duration::from_secs(15), || socket.exists()));

    isomer(&stack)
        .args(["status", "--json"])
        .timeout(Duration::from_secs(30))
        .assert()
        .success()
        .stdout(contains("\"is_ready\": true"));

    isomer(&stack)
        .args(["health", "chain"])
        .assert()
        .success()
        .stdout(contains("healthy").and(contains("unhealthy").not()));

    isomer(&stack)
        .args(["logs", "--service", "indexer"])
        .assert()
        .success()
        .stdout(contains("[indexer:stdout] started"));

    isomer(&stack)
        .args(["mine", "1"])
        .assert()
        .failure()
        .stderr(contains("no chain daemon"));

    isomer(&stack)
        .arg("down")
        .assert()
        .success()
        .stdout(contains("shutting down"));

    let exited = wait_until(Duration::from_secs(15), || {
        matches!(up.try_wait(), Ok(Some(_)))
    });
    if !exited {
        let _ = up.kill();
    }
    assert!(exited, "isomer up did not exit after down");
    assert!(up.wait().unwrap().success());
    assert!(!socket.exists());
}
