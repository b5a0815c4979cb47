#[path = "common/mod.rs"]
mod common;

use std::{fs, thread, time::Duration};

use common::{HEALTHY, ScriptService, Stack, drain, wait_for_exit};
use isomer::{binaries::BinaryStatus, events::EngineEvent, state::ServiceState};

fn stack() -> Stack {
    Stack::new(&[
        ScriptService::new("chain", HEALTHY),
        ScriptService::new("indexer", HEALTHY).depends_on(&["chain"]),
    ])
}

#[test]
fn reset_stops_services_then_empties_data_dirs() {
    let stack = stack();
    let engine = stack.installed_engine();
    engine.start_services().unwrap();

    let pids: Vec<u32> = engine
        .get_status()
        .unwrap()
        .services
        .iter()
        .filter_map(|s| s.pid)
        .collect();
    for service in ["chain", "indexer"] {
        let blocks = stack.data_dir(service).join("blocks");
        fs::create_dir_all(&blocks).unwrap();
        fs::write(blocks.join("blk00000.dat"), b"regtest").unwrap();
    }

    let events = engine.subscribe();
    engine.reset_chain().expect("reset failed");

    for pid in pids {
        wait_for_exit(pid);
    }
    let status = engine.get_status().unwrap();
    assert!(status.services.iter().all(|s| s.state == ServiceState::Stopped));

    for service in ["chain", "indexer"] {
        let data_dir = stack.data_dir(service);
        assert!(data_dir.is_dir());
        assert_eq!(fs::read_dir(&data_dir).unwrap().count(), 0, "{service}");
    }

    // Binaries survive.
    let records = engine.check_binaries().unwrap();
    assert!(records
        .iter()
        .all(|r| matches!(r.status, BinaryStatus::Installed { .. })));

    thread::sleep(Duration::from_millis(50));
    let seen = drain(&events);
    let stopped_at = seen
        .iter()
        .rposition(|e| matches!(e, EngineEvent::StateChanged { state: ServiceState::Stopped, .. }))
        .unwrap();
    let reset_at = seen
        .iter()
        .position(|e| matches!(e, EngineEvent::ChainReset))
        .unwrap();
    assert!(stopped_at < reset_at);
}

#[test]
fn stack_starts_cleanly_after_reset() {
    let stack = stack();
    let engine = stack.installed_engine();
    engine.start_services().unwrap();
    engine.reset_chain().unwrap();

    engine.start_services().expect("start after reset failed");
    assert!(engine.get_status().unwrap().is_ready);
    engine.stop_services().unwrap();
}

#[test]
fn reset_of_a_stopped_stack_only_wipes_data() {
    let stack = stack();
    let engine = stack.installed_engine();
    fs::create_dir_all(stack.data_dir("chain")).unwrap();
    fs::write(stack.data_dir("chain").join("peers.dat"), b"x").unwrap();

    engine.reset_chain().unwrap();
    assert_eq!(fs::read_dir(stack.data_dir("chain")).unwrap().count(), 0);
    assert!(stack.layout.install_dir("chain").join("chain.sh").is_file());
}
