#[path = "common/mod.rs"]
mod common;

use std::{fs, time::Duration};

use common::{
    CRASHES_ON_DEMAND, HEALTHY, ScriptService, Stack, status_of, wait_for_exit, wait_for_state,
    wait_until,
};
use isomer::state::ServiceState;

fn stack() -> Stack {
    Stack::new(&[
        ScriptService::new("chain", CRASHES_ON_DEMAND),
        ScriptService::new("indexer", CRASHES_ON_DEMAND).depends_on(&["chain"]),
        ScriptService::new("gateway", HEALTHY).depends_on(&["indexer"]),
    ])
}

#[test]
fn chain_crash_fails_every_dependent() {
    let stack = stack();
    let engine = stack.installed_engine();
    engine.start_services().unwrap();

    let gateway_pid = status_of(&engine, "gateway").pid.unwrap();
    let indexer_pid = status_of(&engine, "indexer").pid.unwrap();

    fs::write(stack.data_dir("chain").join("crash"), b"").unwrap();
    wait_for_state(&engine, "chain", ServiceState::is_error);
    wait_for_state(&engine, "gateway", ServiceState::is_error);
    wait_for_state(&engine, "indexer", ServiceState::is_error);

    let chain = status_of(&engine, "chain");
    assert_eq!(chain.state, ServiceState::Error("exited with code 9".into()));
    assert_eq!(chain.exit_code, Some(9));
    assert_eq!(
        status_of(&engine, "indexer").state,
        ServiceState::Error("dependency 'chain' failed".into())
    );
    assert_eq!(
        status_of(&engine, "gateway").state,
        ServiceState::Error("dependency 'chain' failed".into())
    );

    wait_for_exit(indexer_pid);
    wait_for_exit(gateway_pid);
    assert!(!engine.get_status().unwrap().is_ready);
}

#[test]
fn dependent_crash_leaves_the_chain_running() {
    let stack = stack();
    let engine = stack.installed_engine();
    engine.start_services().unwrap();

    fs::write(stack.data_dir("indexer").join("crash"), b"").unwrap();
    wait_for_state(&engine, "indexer", ServiceState::is_error);
    wait_for_state(&engine, "gateway", ServiceState::is_error);

    assert_eq!(
        status_of(&engine, "gateway").state,
        ServiceState::Error("dependency 'indexer' failed".into())
    );

    // The chain keeps running and healthy across several probe intervals.
    std::thread::sleep(Duration::from_millis(800));
    let chain = status_of(&engine, "chain");
    assert_eq!(chain.state, ServiceState::Running);
    assert!(chain.healthy);
}

#[test]
fn crashed_stack_can_be_started_again() {
    let stack = stack();
    let engine = stack.installed_engine();
    engine.start_services().unwrap();

    fs::write(stack.data_dir("chain").join("crash"), b"").unwrap();
    wait_for_state(&engine, "gateway", ServiceState::is_error);

    engine.start_services().expect("restart after crash failed");
    assert!(
        wait_until(Duration::from_secs(5), || engine
            .get_status()
            .unwrap()
            .is_ready)
    );
    let chain = status_of(&engine, "chain");
    assert_eq!(chain.last_error, None);
}

#[test]
fn stop_after_crash_ends_with_everything_stopped() {
    let stack = stack();
    let engine = stack.installed_engine();
    engine.start_services().unwrap();

    fs::write(stack.data_dir("indexer").join("crash"), b"").unwrap();
    wait_for_state(&engine, "gateway", ServiceState::is_error);

    engine.stop_services().unwrap();
    let status = engine.get_status().unwrap();
    assert!(status.services.iter().all(|s| s.state == ServiceState::Stopped));
    assert_eq!(
        status_of(&engine, "indexer").last_error.as_deref(),
        Some("exited with code 9")
    );
}
