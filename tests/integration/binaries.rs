#[path = "common/mod.rs"]
mod common;

use std::{fs, thread, time::Duration};

use common::{HEALTHY, ScriptService, Stack, VERSION, collect_download, download, drain};
use isomer::{
    binaries::{BinaryStatus, DownloadEvent, RECEIPT_FILE},
    error::EngineError,
    events::EngineEvent,
};

fn big_script() -> String {
    // Large enough to span many read chunks.
    let mut script = String::from(HEALTHY);
    for i in 0..40_000 {
        script.push_str(&format!("# padding line {i:06}\n"));
    }
    script
}

#[test]
fn download_reports_increasing_progress_ending_at_one() {
    let stack = Stack::new(&[ScriptService::new("chain", &big_script())]);
    let engine = stack.engine();
    let bus = engine.subscribe();

    let events = download(&engine, "chain");
    let (last, progress) = events.split_last().unwrap();
    assert_eq!(
        last,
        &DownloadEvent::Installed {
            version: VERSION.into()
        }
    );

    let values: Vec<f64> = progress
        .iter()
        .map(|event| match event {
            DownloadEvent::Progress(p) => *p,
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert!(values.len() > 2, "{values:?}");
    assert!(values.windows(2).all(|w| w[0] < w[1]), "{values:?}");
    assert_eq!(values.last().copied(), Some(1.0));

    // The bus sees the same transfer.
    thread::sleep(Duration::from_millis(100));
    let published = drain(&bus);
    assert!(published.iter().any(|event| matches!(
        event,
        EngineEvent::DownloadFinished { service, version } if service == "chain" && version == VERSION
    )));

    let install_dir = stack.layout.install_dir("chain");
    assert!(install_dir.join("chain.sh").is_file());
    assert!(install_dir.join(RECEIPT_FILE).is_file());
}

#[test]
fn concurrent_requests_share_one_transfer() {
    let stack = Stack::new(&[ScriptService::new("chain", &big_script())]);
    let engine = stack.engine();

    let first = engine.download("chain").unwrap();
    let second = engine.download("chain").unwrap();

    for events in [collect_download(first), collect_download(second)] {
        assert!(matches!(events.last(), Some(DownloadEvent::Installed { .. })));
    }
    let tmp_leftovers = fs::read_dir(stack.layout.tmp_dir()).unwrap().count();
    assert_eq!(tmp_leftovers, 0);
}

#[test]
fn download_binaries_installs_all_missing_services() {
    let stack = Stack::new(&[
        ScriptService::new("chain", HEALTHY),
        ScriptService::new("indexer", HEALTHY).depends_on(&["chain"]),
        ScriptService::new("gateway", HEALTHY).depends_on(&["indexer"]),
    ]);
    let engine = stack.engine();

    let before = engine.check_binaries().unwrap();
    assert!(before.iter().all(|r| r.status == BinaryStatus::NotInstalled));

    let records = engine.download_binaries().unwrap();
    assert_eq!(records.len(), 3);
    for record in records {
        assert_eq!(
            record.status,
            BinaryStatus::Installed {
                version: VERSION.into()
            },
            "{}",
            record.service
        );
        assert_eq!(record.version.as_deref(), Some(VERSION));
    }
}

#[test]
fn checksum_mismatch_is_never_installed() {
    let stack = Stack::new(&[
        ScriptService::new("chain", HEALTHY).with_sha256(&"0".repeat(64)),
    ]);
    let engine = stack.engine();

    let events = download(&engine, "chain");
    match events.last() {
        Some(DownloadEvent::Failed(reason)) => {
            assert!(reason.contains("Integrity check failed"), "{reason}")
        }
        other => panic!("unexpected final event {other:?}"),
    }

    let records = engine.check_binaries().unwrap();
    assert_eq!(records[0].status, BinaryStatus::NotInstalled);
    assert!(!stack.layout.install_dir("chain").join("chain.sh").exists());
    assert_eq!(fs::read_dir(stack.layout.tmp_dir()).unwrap().count(), 0);
}

#[test]
fn tampered_install_reports_not_installed() {
    let stack = Stack::new(&[ScriptService::new("chain", HEALTHY)]);
    let engine = stack.installed_engine();

    let executable = stack.layout.install_dir("chain").join("chain.sh");
    fs::write(&executable, "#!/bin/sh\nexit 0\n").unwrap();

    let records = engine.check_binaries().unwrap();
    assert_eq!(records[0].status, BinaryStatus::NotInstalled);

    // Reinstalling restores a verified copy.
    let records = engine.download_binaries().unwrap();
    assert!(matches!(records[0].status, BinaryStatus::Installed { .. }));
}

#[test]
fn unknown_service_cannot_be_downloaded() {
    let stack = Stack::new(&[ScriptService::new("chain", HEALTHY)]);
    let engine = stack.engine();
    assert!(engine.download("nope").is_err());
}

#[test]
fn running_service_binaries_are_never_replaced() {
    let stack = Stack::new(&[ScriptService::new("chain", HEALTHY)]);
    let engine = stack.installed_engine();
    engine.start_services().unwrap();

    let executable = stack.layout.install_dir("chain").join("chain.sh");
    let before = fs::read(&executable).unwrap();

    match engine.download("chain") {
        Err(EngineError::Precondition(message)) => {
            assert!(message.contains("chain"), "{message}")
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("download of a running service was accepted"),
    }

    // A tampered install is pending, but stays untouched while running.
    let receipt = stack.layout.install_dir("chain").join(RECEIPT_FILE);
    let content = fs::read_to_string(&receipt).unwrap();
    fs::write(&receipt, content.replace(VERSION, "0.9.0")).unwrap();
    let records = engine.download_binaries().unwrap();
    assert_eq!(records[0].status, BinaryStatus::NotInstalled);
    assert_eq!(fs::read(&executable).unwrap(), before);
    assert!(engine.get_status().unwrap().is_ready);

    engine.stop_services().unwrap();
    let records = engine.download_binaries().unwrap();
    assert!(matches!(records[0].status, BinaryStatus::Installed { .. }));
}
