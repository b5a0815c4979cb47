#[path = "common/mod.rs"]
mod common;

use std::fs::OpenOptions;
use std::io::Write;

use common::{
    CRASHES_ON_START, FAILS_ONCE, HEALTHY, NEVER_READY, ScriptService, Stack, download, drain,
    status_of, transitions_to, wait_for_exit,
};
use isomer::{
    binaries::BinaryStatus,
    error::EngineError,
    events::EngineEvent,
    state::ServiceState,
};

#[test]
fn crash_during_startup_rolls_back_every_launched_service() {
    let stack = Stack::new(&[
        ScriptService::new("chain", HEALTHY),
        ScriptService::new("indexer", CRASHES_ON_START).depends_on(&["chain"]),
        ScriptService::new("gateway", HEALTHY).depends_on(&["indexer"]),
    ]);
    let engine = stack.installed_engine();
    let events = engine.subscribe();

    let err = engine.start_services().unwrap_err();
    assert!(
        matches!(&err, EngineError::ProcessCrash { service, .. } if service == "indexer"),
        "{err}"
    );

    let gateway_attempted = drain(&events).iter().any(|event| {
        matches!(event, EngineEvent::StateChanged { service, .. } if service == "gateway")
    });
    assert!(!gateway_attempted, "gateway must never be attempted");

    let status = engine.get_status().unwrap();
    for service in &status.services {
        assert_eq!(service.state, ServiceState::Stopped, "{}", service.id);
        assert_eq!(service.pid, None);
    }

    let indexer = status_of(&engine, "indexer");
    assert_eq!(indexer.exit_code, Some(3));
    assert!(
        indexer
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("exited with code 3")),
        "{indexer:?}"
    );
    assert_eq!(status_of(&engine, "chain").last_error, None);
}

#[test]
fn startup_timeout_kills_the_service_and_rolls_back() {
    let stack = Stack::new(&[
        ScriptService::new("chain", HEALTHY),
        ScriptService::new("indexer", NEVER_READY)
            .depends_on(&["chain"])
            .startup_timeout("1s"),
    ]);
    let engine = stack.installed_engine();
    let events = engine.subscribe();

    let err = engine.start_services().unwrap_err();
    assert!(matches!(err, EngineError::StartupTimeout { .. }), "{err}");

    let seen = drain(&events);
    assert_eq!(
        transitions_to(&seen, &ServiceState::Stopped),
        vec!["indexer", "chain"]
    );

    let status = engine.get_status().unwrap();
    assert!(status.services.iter().all(|s| s.state == ServiceState::Stopped));
    assert!(
        status_of(&engine, "indexer")
            .last_error
            .is_some_and(|e| e.contains("did not become healthy"))
    );
}

#[test]
fn missing_binary_launches_nothing() {
    let stack = Stack::new(&[
        ScriptService::new("chain", HEALTHY),
        ScriptService::new("indexer", HEALTHY).depends_on(&["chain"]),
    ]);
    let engine = stack.engine();
    download(&engine, "indexer");
    let events = engine.subscribe();

    let err = engine.start_services().unwrap_err();
    match err {
        EngineError::Precondition(message) => assert!(message.contains("chain"), "{message}"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(transitions_to(&drain(&events), &ServiceState::Starting).is_empty());
}

#[test]
fn corrupt_chain_binary_blocks_its_dependents() {
    let stack = Stack::new(&[
        ScriptService::new("chain", HEALTHY),
        ScriptService::new("indexer", HEALTHY).depends_on(&["chain"]),
    ]);
    let engine = stack.installed_engine();

    let executable = stack.layout.install_dir("chain").join("chain.sh");
    let mut file = OpenOptions::new().append(true).open(executable).unwrap();
    writeln!(file, "echo tampered").unwrap();
    drop(file);

    let records = engine.check_binaries().unwrap();
    let chain = records.iter().find(|r| r.service == "chain").unwrap();
    assert_eq!(chain.status, BinaryStatus::NotInstalled);

    let events = engine.subscribe();
    assert!(matches!(
        engine.start_services(),
        Err(EngineError::Precondition(_))
    ));
    let starting = transitions_to(&drain(&events), &ServiceState::Starting);
    assert!(!starting.contains(&"indexer".to_string()));
    assert!(starting.is_empty());
}

#[test]
fn retry_after_failed_start_clears_the_error() {
    let stack = Stack::new(&[
        ScriptService::new("chain", HEALTHY),
        ScriptService::new("indexer", FAILS_ONCE).depends_on(&["chain"]),
    ]);
    let engine = stack.installed_engine();

    assert!(engine.start_services().is_err());
    assert_eq!(status_of(&engine, "chain").pid, None);
    assert_eq!(status_of(&engine, "indexer").exit_code, Some(4));

    engine.start_services().expect("second start failed");
    let indexer = status_of(&engine, "indexer");
    assert_eq!(indexer.state, ServiceState::Running);
    assert_eq!(indexer.last_error, None);
    assert_eq!(indexer.exit_code, None);

    let pid = indexer.pid.unwrap();
    engine.stop_services().unwrap();
    wait_for_exit(pid);
}
