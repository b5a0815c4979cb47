#[path = "common/mod.rs"]
mod common;

use std::{collections::HashMap, thread, time::Duration};

use common::{HEALTHY, ScriptService, Stack, drain, status_of, transitions_to, wait_for_exit};
use isomer::{config::Settings, error::EngineError, events::EngineEvent, state::ServiceState};

fn three_tier() -> Stack {
    Stack::new(&[
        ScriptService::new("chain", HEALTHY),
        ScriptService::new("indexer", HEALTHY).depends_on(&["chain"]),
        ScriptService::new("gateway", HEALTHY).depends_on(&["chain", "indexer"]),
    ])
}

#[test]
fn start_follows_dependency_order_and_stop_reverses_it() {
    let stack = three_tier();
    let engine = stack.installed_engine();
    let events = engine.subscribe();

    engine.start_services().expect("start failed");

    let status = engine.get_status().unwrap();
    assert!(status.is_ready, "{status:?}");
    for service in &status.services {
        assert_eq!(service.state, ServiceState::Running);
        assert!(service.healthy);
        assert!(service.pid.is_some());
    }

    let started = drain(&events);
    assert_eq!(
        transitions_to(&started, &ServiceState::Running),
        vec!["chain", "indexer", "gateway"]
    );

    // No service begins starting before each dependency is Running.
    let position = |service: &str, state: ServiceState| {
        started
            .iter()
            .position(|event| {
                matches!(event, EngineEvent::StateChanged { service: s, state: st }
                    if s == service && *st == state)
            })
            .unwrap()
    };
    assert!(position("chain", ServiceState::Running) < position("indexer", ServiceState::Starting));
    assert!(
        position("indexer", ServiceState::Running) < position("gateway", ServiceState::Starting)
    );

    let pids: Vec<u32> = status.services.iter().filter_map(|s| s.pid).collect();
    engine.stop_services().expect("stop failed");

    let stopped = drain(&events);
    assert_eq!(
        transitions_to(&stopped, &ServiceState::Stopped),
        vec!["gateway", "indexer", "chain"]
    );
    for pid in pids {
        wait_for_exit(pid);
    }
    let status = engine.get_status().unwrap();
    assert!(status.services.iter().all(|s| s.state == ServiceState::Stopped));
    assert!(!status.is_ready);
}

#[test]
fn starting_again_keeps_running_services() {
    let stack = three_tier();
    let engine = stack.installed_engine();

    engine.start_services().unwrap();
    let before: HashMap<String, Option<u32>> = engine
        .get_status()
        .unwrap()
        .services
        .into_iter()
        .map(|s| (s.id, s.pid))
        .collect();

    engine.start_services().unwrap();
    let after: HashMap<String, Option<u32>> = engine
        .get_status()
        .unwrap()
        .services
        .into_iter()
        .map(|s| (s.id, s.pid))
        .collect();

    assert_eq!(before, after);
}

#[test]
fn status_reports_version_port_and_uptime() {
    let stack = Stack::new(&[ScriptService::new("chain", HEALTHY)]);
    let engine = stack.installed_engine();

    let stopped = status_of(&engine, "chain");
    assert_eq!(stopped.version.as_deref(), Some(common::VERSION));
    assert_eq!(stopped.uptime_secs, None);
    assert_eq!(stopped.display_name, "chain service");

    engine.start_services().unwrap();
    thread::sleep(Duration::from_millis(1100));

    let running = status_of(&engine, "chain");
    assert_eq!(running.state, ServiceState::Running);
    assert!(running.uptime_secs.unwrap_or_default() >= 1);
    assert_eq!(running.port, None);
    assert_eq!(running.last_error, None);
}

#[test]
fn settings_only_change_while_everything_is_stopped() {
    let stack = Stack::new(&[ScriptService::new("chain", HEALTHY)]);
    let engine = stack.installed_engine();
    engine.start_services().unwrap();

    let mut changed = (*engine.settings()).clone();
    changed.mining.max_blocks_per_call = 10;
    match engine.update_settings(changed.clone()) {
        Err(EngineError::Precondition(message)) => {
            assert!(message.contains("'chain' is running"), "{message}")
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(engine.settings().mining.max_blocks_per_call, 1000);
    assert!(!engine.settings_path().exists());

    engine.stop_services().unwrap();
    engine.update_settings(changed).unwrap();
    assert_eq!(engine.settings().mining.max_blocks_per_call, 10);
    assert_eq!(
        Settings::load(engine.settings_path())
            .unwrap()
            .mining
            .max_blocks_per_call,
        10
    );

    // The next launch runs with the saved settings.
    engine.start_services().unwrap();
    assert!(engine.get_status().unwrap().is_ready);
}

#[test]
fn live_health_check_follows_readiness() {
    let stack = Stack::new(&[ScriptService::new("chain", HEALTHY)]);
    let engine = stack.installed_engine();

    assert!(!engine.check_service_health("chain").unwrap());
    engine.start_services().unwrap();
    assert!(engine.check_service_health("chain").unwrap());

    std::fs::remove_file(stack.data_dir("chain").join("ready")).unwrap();
    assert!(!engine.check_service_health("chain").unwrap());
}

#[test]
fn dropping_the_engine_stops_every_process() {
    let stack = three_tier();
    let engine = stack.installed_engine();
    engine.start_services().unwrap();

    let pids: Vec<u32> = engine
        .get_status()
        .unwrap()
        .services
        .iter()
        .filter_map(|s| s.pid)
        .collect();
    assert_eq!(pids.len(), 3);

    drop(engine);
    for pid in pids {
        wait_for_exit(pid);
    }

    // The data root is free again.
    let engine = stack.engine();
    assert!(!engine.get_status().unwrap().is_ready);
}
