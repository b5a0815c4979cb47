#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    sync::mpsc::Receiver,
    thread,
    time::{Duration, Instant},
};

use isomer::{
    binaries::{DownloadEvent, sha256_file},
    config::Settings,
    engine::Engine,
    events::EngineEvent,
    manifest::Manifest,
    runtime::RuntimeLayout,
    state::{ServiceState, ServiceStatus},
};
use tempfile::TempDir;

pub const VERSION: &str = "1.0.0";

/// Becomes ready right away and runs until signalled.
pub const HEALTHY: &str = r#"rm -f ready crash
echo "started $0"
touch ready
exec sleep 600
"#;

/// Exits before it ever becomes ready.
pub const CRASHES_ON_START: &str = r#"echo "fatal: cannot open database" >&2
exit 3
"#;

/// Runs but never passes its readiness check.
pub const NEVER_READY: &str = "exec sleep 600\n";

/// Becomes ready, then exits with code 9 once a `crash` file appears in its data dir.
pub const CRASHES_ON_DEMAND: &str = r#"rm -f ready crash
touch ready
while [ ! -f crash ]; do sleep 0.1; done
echo "crashing" >&2
exit 9
"#;

/// Fails its first launch, succeeds afterwards.
pub const FAILS_ONCE: &str = r#"if [ ! -f attempted ]; then
  touch attempted
  exit 4
fi
rm -f ready
touch ready
exec sleep 600
"#;

/// Declares one script-backed service of a test stack.
#[derive(Clone)]
pub struct ScriptService {
    pub id: String,
    pub script: String,
    pub dependencies: Vec<String>,
    pub startup_timeout: String,
    pub sha256: Option<String>,
}

impl ScriptService {
    pub fn new(id: &str, script: &str) -> Self {
        Self {
            id: id.to_string(),
            script: script.to_string(),
            dependencies: Vec::new(),
            startup_timeout: "10s".to_string(),
            sha256: None,
        }
    }

    pub fn depends_on(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn startup_timeout(mut self, timeout: &str) -> Self {
        self.startup_timeout = timeout.to_string();
        self
    }

    /// Publishes a wrong checksum for the artifact.
    pub fn with_sha256(mut self, sha256: &str) -> Self {
        self.sha256 = Some(sha256.to_string());
        self
    }
}

/// A throwaway data root with a manifest of shell-script services whose
/// artifacts are served from `file://` URLs.
pub struct Stack {
    pub dir: TempDir,
    pub settings: Settings,
    pub manifest: Manifest,
    pub layout: RuntimeLayout,
}

impl Stack {
    pub fn new(services: &[ScriptService]) -> Self {
        Self::with_settings(services, fast_settings())
    }

    pub fn with_settings(services: &[ScriptService], settings: Settings) -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let artifacts = dir.path().join("artifacts");
        fs::create_dir_all(&artifacts).expect("failed to create artifacts dir");

        let mut yaml = String::from("services:\n");
        for service in services {
            let artifact = artifacts.join(format!("{}.sh", service.id));
            fs::write(&artifact, format!("#!/bin/sh\n{}", service.script))
                .expect("failed to write script");
            let sha256 = match &service.sha256 {
                Some(sha) => sha.clone(),
                None => sha256_file(&artifact).expect("failed to hash script"),
            };
            let dependencies = service
                .dependencies
                .iter()
                .map(|d| format!("\"{d}\""))
                .collect::<Vec<_>>()
                .join(", ");

            yaml.push_str(&format!(
                r#"  - id: {id}
    display_name: "{id} service"
    kind:
      type: custom
    dependencies: [{dependencies}]
    executable: {id}.sh
    interpreter: sh
    health:
      type: command
      command: test -f ready
    startup_timeout: {timeout}
    release:
      version: "{VERSION}"
      archive:
        type: raw
      url_template: "file://{url}"
      targets:
        any:
          sha256: "{sha256}"
"#,
                id = service.id,
                timeout = service.startup_timeout,
                url = artifact.display(),
            ));
        }

        fs::write(dir.path().join("manifest.yaml"), &yaml).expect("failed to write manifest");
        let manifest = Manifest::from_yaml(&yaml).expect("invalid test manifest");
        let layout = RuntimeLayout::new(dir.path().join("root"));
        settings
            .save(&dir.path().join("isomer.yaml"))
            .expect("failed to write settings");

        Self {
            dir,
            settings,
            manifest,
            layout,
        }
    }

    pub fn engine(&self) -> Engine {
        Engine::new(
            self.settings.clone(),
            self.manifest.clone(),
            self.layout.clone(),
        )
        .expect("failed to build engine")
    }

    /// Engine with every binary installed through the download path.
    pub fn installed_engine(&self) -> Engine {
        let engine = self.engine();
        install_all(&engine);
        engine
    }

    pub fn root(&self) -> PathBuf {
        self.layout.root().to_path_buf()
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.path().join("manifest.yaml")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dir.path().join("isomer.yaml")
    }

    pub fn data_dir(&self, service: &str) -> PathBuf {
        self.layout.data_dir(service)
    }
}

pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.supervision.startup_timeout = "10s".into();
    settings.supervision.stop_grace_period = "2s".into();
    settings.supervision.health_interval = "200ms".into();
    settings.supervision.probe_timeout = "2s".into();
    settings.release_index_url = None;
    settings
}

/// Downloads a service and returns every event up to the final one.
pub fn download(engine: &Engine, service: &str) -> Vec<DownloadEvent> {
    let rx = engine.download(service).expect("download did not start");
    collect_download(rx)
}

pub fn collect_download(rx: Receiver<DownloadEvent>) -> Vec<DownloadEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.recv_timeout(Duration::from_secs(30)) {
        let done = !matches!(event, DownloadEvent::Progress(_));
        events.push(event);
        if done {
            break;
        }
    }
    events
}

pub fn install_all(engine: &Engine) {
    for definition in engine.manifest().services() {
        let events = download(engine, &definition.id);
        assert!(
            matches!(events.last(), Some(DownloadEvent::Installed { .. })),
            "install of '{}' failed: {events:?}",
            definition.id
        );
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

pub fn status_of(engine: &Engine, service: &str) -> ServiceStatus {
    engine
        .get_status()
        .expect("status failed")
        .services
        .into_iter()
        .find(|s| s.id == service)
        .unwrap_or_else(|| panic!("no status for '{service}'"))
}

pub fn state_of(engine: &Engine, service: &str) -> ServiceState {
    status_of(engine, service).state
}

pub fn wait_for_state(engine: &Engine, service: &str, expected: fn(&ServiceState) -> bool) {
    let reached = wait_until(Duration::from_secs(10), || expected(&state_of(engine, service)));
    assert!(
        reached,
        "'{service}' never reached the expected state; last: {}",
        state_of(engine, service)
    );
}

/// True once the PID is gone or a zombie.
pub fn process_exited(pid: u32) -> bool {
    let stat_path = format!("/proc/{pid}/stat");
    if Path::new("/proc").exists() {
        return match fs::read_to_string(&stat_path) {
            Ok(stat) => stat
                .rfind(')')
                .and_then(|idx| stat[idx + 1..].trim().chars().next())
                .is_some_and(|state| state == 'Z' || state == 'X'),
            Err(_) => true,
        };
    }
    unsafe { libc::kill(pid as i32, 0) != 0 }
}

pub fn wait_for_exit(pid: u32) {
    assert!(
        wait_until(Duration::from_secs(10), || process_exited(pid)),
        "PID {pid} is still running"
    );
}

/// Drains every event currently queued on `rx`.
pub fn drain(rx: &Receiver<EngineEvent>) -> Vec<EngineEvent> {
    rx.try_iter().collect()
}

/// Services in the order they reached `state`, from a drained event list.
pub fn transitions_to(events: &[EngineEvent], state: &ServiceState) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::StateChanged { service, state: s } if s == state => {
                Some(service.clone())
            }
            _ => None,
        })
        .collect()
}
