//! Process supervision: dependency-ordered start, rollback, stop and crash detection.
use std::{
    collections::{HashMap, HashSet},
    fs,
    net::TcpListener,
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    binaries::BinaryManager,
    config::{Settings, Timings},
    error::{EngineError, Result},
    generator::{self, LaunchSpec},
    health::{HealthProber, HealthTable, ProbeTarget, SharedTargets, sleep_while},
    logs::{LogBuffer, LogStream, spawn_log_reader},
    manifest::{Manifest, ServiceDefinition},
    runtime::RuntimeLayout,
    state::{ServiceState, StateTable},
};

const READINESS_POLL: Duration = Duration::from_millis(100);
const WATCH_INTERVAL: Duration = Duration::from_millis(250);
const RESET_ATTEMPTS: u32 = 3;

/// Waits for a child to exit, giving up after `timeout`.
pub(crate) fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with code {code}"),
        (None, Some(signal)) => format!("terminated by signal {signal}"),
        (None, None) => "exited".to_string(),
    }
}

/// PIDs of launched services, persisted so a later run can reap orphans.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct PidFile {
    #[serde(skip)]
    path: PathBuf,
    services: HashMap<String, u32>,
}

impl PidFile {
    pub fn load(path: &Path) -> Result<Self> {
        let mut pid_file = if path.exists() {
            let contents = fs::read_to_string(path)?;
            serde_json::from_str::<Self>(&contents).unwrap_or_else(|err| {
                warn!("Discarding unreadable PID file {}: {err}", path.display());
                Self::default()
            })
        } else {
            Self::default()
        };
        pid_file.path = path.to_path_buf();
        Ok(pid_file)
    }

    pub fn services(&self) -> &HashMap<String, u32> {
        &self.services
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn insert(&mut self, service: &str, pid: u32) -> Result<()> {
        self.services.insert(service.to_string(), pid);
        self.save()
    }

    pub fn remove(&mut self, service: &str) -> Result<()> {
        if self.services.remove(service).is_some() {
            self.save()?;
        }
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        self.services.clear();
        self.save()
    }
}

fn process_alive(pid: nix::unistd::Pid) -> bool {
    !matches!(
        nix::sys::signal::kill(pid, None),
        Err(nix::errno::Errno::ESRCH)
    )
}

/// Terminates processes recorded by a previous run that are still alive.
///
/// Only PIDs that still lead their own process group are signalled, which
/// is how services are spawned.
pub fn reap_orphans(pid_file: &mut PidFile, grace: Duration) -> Result<Vec<String>> {
    let mut reaped = Vec::new();
    for (service, &raw_pid) in pid_file.services() {
        let pid = nix::unistd::Pid::from_raw(raw_pid as i32);
        if !process_alive(pid) {
            continue;
        }
        let pgid = unsafe { libc::getpgid(pid.as_raw()) };
        if pgid != pid.as_raw() {
            debug!("PID {raw_pid} recorded for '{service}' now belongs to another process");
            continue;
        }

        warn!("Terminating orphaned '{service}' (PID {raw_pid}) from a previous run");
        unsafe { libc::killpg(pgid, libc::SIGTERM) };

        let deadline = Instant::now() + grace;
        while process_alive(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(100));
        }
        if process_alive(pid) {
            warn!("Orphaned '{service}' ignored SIGTERM; sending SIGKILL");
            unsafe { libc::killpg(pgid, libc::SIGKILL) };
        }
        reaped.push(service.clone());
    }
    pid_file.clear()?;
    Ok(reaped)
}

/// Sends SIGTERM to the child's process group and the child, escalating to
/// SIGKILL after `grace`, and reaps it.
fn terminate(child: &mut Child, service: &str, grace: Duration) -> Result<()> {
    fn nix_error_to_io(err: nix::errno::Errno) -> std::io::Error {
        std::io::Error::from_raw_os_error(err as i32)
    }
    let stop_error = |source: std::io::Error| EngineError::ServiceStop {
        service: service.to_string(),
        source,
    };

    if let Some(status) = child.try_wait().map_err(stop_error)? {
        debug!("Service '{service}' had already {}", describe_exit(&status));
        return Ok(());
    }

    let pid = nix::unistd::Pid::from_raw(child.id() as i32);
    let supervisor_pgid = unsafe { libc::getpgid(0) };
    let child_pgid = unsafe { libc::getpgid(pid.as_raw()) };
    let owns_group = child_pgid >= 0 && child_pgid != supervisor_pgid;

    if owns_group {
        let kill_result = unsafe { libc::killpg(child_pgid, libc::SIGTERM) };
        if kill_result < 0 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::ESRCH => {
                    debug!("Process group for '{service}' missing; falling back to direct signal");
                }
                Some(code) if code == libc::EPERM => {
                    warn!(
                        "Insufficient permissions to signal process group {child_pgid} for '{service}'. Falling back to direct signal"
                    );
                }
                _ => return Err(stop_error(err)),
            }
        } else {
            debug!("Sent SIGTERM to process group {child_pgid} for '{service}'");
        }
    }

    if let Err(err) = nix::sys::signal::kill(pid, Some(nix::sys::signal::SIGTERM))
        && err != nix::errno::Errno::ESRCH
    {
        return Err(stop_error(nix_error_to_io(err)));
    }

    if wait_with_timeout(child, grace).map_err(stop_error)?.is_some() {
        debug!("Service '{service}' stopped after SIGTERM");
        return Ok(());
    }

    warn!("Service '{service}' did not exit after {grace:?}; sending SIGKILL");
    if owns_group {
        unsafe { libc::killpg(child_pgid, libc::SIGKILL) };
    }
    if let Err(err) = nix::sys::signal::kill(pid, Some(nix::sys::signal::SIGKILL))
        && err != nix::errno::Errno::ESRCH
    {
        return Err(stop_error(nix_error_to_io(err)));
    }
    child.wait().map_err(stop_error)?;
    Ok(())
}

/// A launched service process owned by the supervisor.
#[derive(Debug)]
pub struct ServiceProcess {
    pub child: Child,
    pub pid: u32,
    pub started: Instant,
    pub spec: LaunchSpec,
}

/// Startup failure with the exit code of the process, when it exited.
struct StartFailure {
    error: EngineError,
    exit_code: Option<i32>,
}

impl From<EngineError> for StartFailure {
    fn from(error: EngineError) -> Self {
        Self {
            error,
            exit_code: None,
        }
    }
}

/// State shared with the crash watcher thread.
struct Shared {
    manifest: Arc<Manifest>,
    timings: Timings,
    processes: Mutex<HashMap<String, ServiceProcess>>,
    states: StateTable,
    health: HealthTable,
    pid_file: Mutex<PidFile>,
    launch_order: Mutex<Vec<String>>,
}

impl Shared {
    /// Removes the process from the map first so the watcher never treats
    /// an intentional stop as a crash.
    fn take_process(&self, service: &str) -> Result<Option<ServiceProcess>> {
        Ok(self.processes.lock()?.remove(service))
    }

    fn forget(&self, service: &str) {
        let removed = self
            .pid_file
            .lock()
            .map_err(EngineError::from)
            .and_then(|mut pid_file| pid_file.remove(service));
        if let Err(err) = removed {
            warn!("Failed to update PID file for '{service}': {err}");
        }
        if let Ok(mut order) = self.launch_order.lock() {
            order.retain(|id| id != service);
        }
        if let Err(err) = self.health.clear(service) {
            warn!("Failed to clear health of '{service}': {err}");
        }
    }

    fn stop_one(&self, service: &str) -> Result<()> {
        let mut result = Ok(());
        if let Some(mut process) = self.take_process(service)? {
            info!("Stopping service '{service}' (PID {})", process.pid);
            result = terminate(&mut process.child, service, self.timings.stop_grace_period);
            if let Err(err) = &result {
                error!("Failed to stop '{service}': {err}");
            }
        }
        self.forget(service);

        match self.states.state(service)? {
            ServiceState::Stopped => {}
            ServiceState::Starting => {
                self.states
                    .mark_error(service, "stopped during startup", None)?;
                self.states.mark_stopped(service)?;
            }
            ServiceState::Running | ServiceState::Error(_) => {
                self.states.mark_stopped(service)?;
            }
        }
        result
    }

    /// One pass of crash detection over Running services.
    fn detect_crashes(&self) -> Result<()> {
        let mut crashed = Vec::new();
        {
            let mut processes = self.processes.lock()?;
            let mut exited = Vec::new();
            for (service, process) in processes.iter_mut() {
                if !self.states.state(service)?.is_running() {
                    continue;
                }
                match process.child.try_wait() {
                    Ok(Some(status)) => exited.push((service.clone(), status)),
                    Ok(None) => {}
                    Err(err) => error!("Failed to check status of '{service}': {err}"),
                }
            }
            for (service, status) in exited {
                processes.remove(&service);
                crashed.push((service, status));
            }
        }

        for (service, status) in crashed {
            let reason = describe_exit(&status);
            warn!("Service '{service}' {reason} unexpectedly");
            self.forget(&service);
            if let Err(err) = self.states.mark_error(&service, &reason, status.code()) {
                debug!("Crash of '{service}' raced with a stop: {err}");
            }
            self.fail_dependents(&service);
        }
        Ok(())
    }

    fn fail_dependents(&self, failed: &str) {
        for dependent in self.manifest.transitive_dependents(failed) {
            let running = self
                .states
                .state(&dependent)
                .map(|state| state.is_running())
                .unwrap_or(false);
            if !running {
                continue;
            }

            let process = match self.take_process(&dependent) {
                Ok(process) => process,
                Err(err) => {
                    error!("Failed to detach dependent '{dependent}': {err}");
                    continue;
                }
            };

            warn!("Stopping '{dependent}' because dependency '{failed}' failed");
            let reason = format!("dependency '{failed}' failed");
            if let Err(err) = self.states.mark_error(&dependent, reason, None) {
                debug!("Could not mark '{dependent}' failed: {err}");
            }
            if let Some(mut process) = process
                && let Err(err) =
                    terminate(&mut process.child, &dependent, self.timings.stop_grace_period)
            {
                error!("Failed to stop dependent '{dependent}': {err}");
            }
            self.forget(&dependent);
        }
    }
}

fn build_targets(
    settings: &Settings,
    layout: &RuntimeLayout,
    manifest: &Manifest,
) -> Vec<ProbeTarget> {
    manifest
        .start_order()
        .into_iter()
        .map(|def| ProbeTarget::for_service(settings, layout, def))
        .collect()
}

/// Owns every service process and its lifecycle.
pub struct Supervisor {
    shared: Arc<Shared>,
    settings: RwLock<Arc<Settings>>,
    layout: RuntimeLayout,
    binaries: BinaryManager,
    prober: Arc<dyn HealthProber>,
    targets: SharedTargets,
    logs: LogBuffer,
    op_lock: Arc<Mutex<()>>,
    running: Arc<AtomicBool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        layout: RuntimeLayout,
        manifest: Arc<Manifest>,
        binaries: BinaryManager,
        prober: Arc<dyn HealthProber>,
        states: StateTable,
        health: HealthTable,
        logs: LogBuffer,
        op_lock: Arc<Mutex<()>>,
    ) -> Result<Self> {
        let timings = settings.supervision.timings()?;
        let targets = Arc::new(RwLock::new(build_targets(&settings, &layout, &manifest)));
        let pid_file = PidFile::load(&layout.pid_file())?;

        Ok(Self {
            shared: Arc::new(Shared {
                manifest,
                timings,
                processes: Mutex::new(HashMap::new()),
                states,
                health,
                pid_file: Mutex::new(pid_file),
                launch_order: Mutex::new(Vec::new()),
            }),
            settings: RwLock::new(settings),
            layout,
            binaries,
            prober,
            targets,
            logs,
            op_lock,
            running: Arc::new(AtomicBool::new(false)),
            watcher: Mutex::new(None),
        })
    }

    /// Terminates leftovers recorded by a previous run.
    pub fn reap_orphans(&self) -> Result<Vec<String>> {
        let mut pid_file = self.shared.pid_file.lock()?;
        reap_orphans(&mut pid_file, self.shared.timings.stop_grace_period)
    }

    pub fn states(&self) -> &StateTable {
        &self.shared.states
    }

    pub fn health(&self) -> &HealthTable {
        &self.shared.health
    }

    /// Probe targets in start order. Replaced when settings change.
    pub fn probe_targets(&self) -> SharedTargets {
        Arc::clone(&self.targets)
    }

    /// Settings the next launch is generated from.
    pub fn settings(&self) -> Arc<Settings> {
        let settings = self
            .settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&settings)
    }

    fn target(&self, service: &str) -> Result<ProbeTarget> {
        self.targets
            .read()?
            .iter()
            .find(|target| target.service == service)
            .cloned()
            .ok_or_else(|| EngineError::UnknownService(service.to_string()))
    }

    /// Replaces the settings while every service is Stopped.
    ///
    /// `persist` runs under the operation lock before anything is swapped,
    /// so a failed save leaves the engine on its previous settings.
    pub fn apply_settings<F>(&self, settings: Settings, persist: F) -> Result<()>
    where
        F: FnOnce(&Settings) -> Result<()>,
    {
        let _op = self.op_lock.lock()?;
        for (service, entry) in self.shared.states.snapshot()? {
            if entry.state != ServiceState::Stopped {
                return Err(EngineError::Precondition(format!(
                    "settings can only change while every service is stopped ('{service}' is {})",
                    entry.state
                )));
            }
        }

        persist(&settings)?;
        let targets = build_targets(&settings, &self.layout, &self.shared.manifest);
        *self.targets.write()? = targets;
        *self.settings.write()? = Arc::new(settings);
        info!("Settings updated");
        Ok(())
    }

    /// Services in the order they were launched and are still tracked.
    pub fn launch_order(&self) -> Result<Vec<String>> {
        Ok(self.shared.launch_order.lock()?.clone())
    }

    /// Runs one readiness probe now, regardless of the monitor interval.
    pub fn probe(&self, service: &str) -> Result<bool> {
        let target = self.target(service)?;
        Ok(self.prober.probe(&target))
    }

    /// Starts the crash watcher thread.
    pub fn spawn_watcher(&self) -> Result<()> {
        let mut slot = self.watcher.lock()?;
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name("isomer-watcher".into())
            .spawn(move || {
                debug!("Crash watcher started");
                while running.load(Ordering::SeqCst) {
                    if let Err(err) = shared.detect_crashes() {
                        error!("Crash detection failed: {err}");
                    }
                    sleep_while(&running, WATCH_INTERVAL);
                }
                debug!("Crash watcher stopped");
            })?;
        *slot = Some(handle);
        Ok(())
    }

    pub fn shutdown_watcher(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Starts every service in dependency order.
    ///
    /// Running services are kept. On the first failure everything launched by
    /// this call is stopped in reverse order before the error is returned.
    pub fn start_services(&self) -> Result<()> {
        let _op = self.op_lock.lock()?;
        let order = self.shared.manifest.start_order();

        let mut missing = Vec::new();
        for definition in &order {
            if !self.binaries.check(&definition.id)?.status.is_usable() {
                missing.push(definition.id.clone());
            }
        }
        if !missing.is_empty() {
            return Err(EngineError::Precondition(format!(
                "binaries not installed: {}",
                missing.join(", ")
            )));
        }

        info!("Starting all services...");
        let mut launched: Vec<String> = Vec::new();
        for definition in order {
            let id = definition.id.as_str();
            match self.shared.states.state(id)? {
                ServiceState::Running => {
                    debug!("Service '{id}' already running");
                    continue;
                }
                ServiceState::Error(reason) => {
                    debug!("Clearing previous error of '{id}': {reason}");
                    self.shared.states.mark_stopped(id)?;
                }
                ServiceState::Starting | ServiceState::Stopped => {}
            }

            if let Err(err) = self.launch(definition) {
                error!("Startup of '{id}' failed: {err}");
                for service in launched.iter().rev() {
                    if let Err(stop_err) = self.shared.stop_one(service) {
                        warn!("Rollback of '{service}' failed: {stop_err}");
                    }
                }
                return Err(err);
            }
            launched.push(id.to_string());
        }

        info!("All services running");
        Ok(())
    }

    fn ensure_dependencies_ready(&self, definition: &ServiceDefinition) -> Result<()> {
        for dependency in &definition.dependencies {
            let ready = self.shared.states.state(dependency)?.is_running()
                && self.shared.health.is_healthy(dependency);
            if !ready {
                return Err(EngineError::Precondition(format!(
                    "dependency '{dependency}' of '{}' is not running and healthy",
                    definition.id
                )));
            }
        }
        Ok(())
    }

    fn ensure_ports_free(&self, definition: &ServiceDefinition) -> Result<()> {
        let settings = self.settings();
        for port in definition.listen_ports(&settings) {
            if let Err(err) = TcpListener::bind((settings.host.as_str(), port)) {
                return Err(EngineError::Precondition(format!(
                    "port {port} required by '{}' is unavailable: {err}",
                    definition.id
                )));
            }
        }
        Ok(())
    }

    /// Launches one Stopped service and waits until it is Running.
    ///
    /// On failure the service ends Stopped with `last_error` set.
    fn launch(&self, definition: &ServiceDefinition) -> Result<()> {
        let id = definition.id.as_str();
        self.ensure_dependencies_ready(definition)?;
        self.ensure_ports_free(definition)?;

        self.shared.states.mark_starting(id)?;
        match self.spawn_and_wait(definition) {
            Ok(()) => Ok(()),
            Err(StartFailure { error, exit_code }) => {
                self.shared
                    .states
                    .mark_error(id, error.to_string(), exit_code)?;
                if let Some(mut process) = self.shared.take_process(id)?
                    && let Err(err) =
                        terminate(&mut process.child, id, self.shared.timings.stop_grace_period)
                {
                    warn!("Failed to terminate '{id}' after failed startup: {err}");
                }
                self.shared.forget(id);
                self.shared.states.mark_stopped(id)?;
                Err(error)
            }
        }
    }

    fn spawn_and_wait(&self, definition: &ServiceDefinition) -> Result<(), StartFailure> {
        let id = definition.id.as_str();
        let settings = self.settings();
        let spec = generator::render(&settings, &self.layout, &self.shared.manifest, definition)?;
        generator::write(&spec)?;
        self.spawn(definition, spec)?;

        let timeout = definition.startup_timeout(self.shared.timings.startup_timeout)?;
        let target = self.target(id)?;
        let deadline = Instant::now() + timeout;

        loop {
            let exited = {
                let mut processes = self.shared.processes.lock().map_err(EngineError::from)?;
                match processes.get_mut(id) {
                    Some(process) => process.child.try_wait().map_err(EngineError::Io)?,
                    None => {
                        return Err(EngineError::Precondition(format!(
                            "service '{id}' was stopped during startup"
                        ))
                        .into());
                    }
                }
            };

            if let Some(status) = exited {
                return Err(StartFailure {
                    error: EngineError::ProcessCrash {
                        service: id.to_string(),
                        status: describe_exit(&status),
                    },
                    exit_code: status.code(),
                });
            }

            if self.prober.probe(&target) {
                self.shared.health.record(id, true)?;
                self.shared.states.mark_running(id)?;
                info!("Service '{id}' is running");
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(EngineError::StartupTimeout {
                    service: id.to_string(),
                    timeout,
                }
                .into());
            }
            thread::sleep(READINESS_POLL);
        }
    }

    fn spawn(&self, definition: &ServiceDefinition, spec: LaunchSpec) -> Result<()> {
        let id = definition.id.as_str();
        debug!("Launching '{id}': {} {:?}", spec.program.display(), spec.args);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        unsafe {
            cmd.pre_exec(|| {
                // Own process group so the whole tree can be signalled at once.
                if libc::setpgid(0, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }

                #[cfg(target_os = "linux")]
                {
                    use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                    if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| EngineError::ServiceStart {
            service: id.to_string(),
            source,
        })?;
        let pid = child.id();
        info!("Service '{id}' started with PID {pid}");

        if let Some(stdout) = child.stdout.take() {
            spawn_log_reader(
                id,
                LogStream::Stdout,
                stdout,
                self.logs.clone(),
                Some(self.layout.log_file(id, LogStream::Stdout.as_ref())),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_reader(
                id,
                LogStream::Stderr,
                stderr,
                self.logs.clone(),
                Some(self.layout.log_file(id, LogStream::Stderr.as_ref())),
            );
        }

        self.shared.processes.lock()?.insert(
            id.to_string(),
            ServiceProcess {
                child,
                pid,
                started: Instant::now(),
                spec,
            },
        );
        self.shared.states.set_pid(id, pid)?;
        self.shared.launch_order.lock()?.push(id.to_string());
        if let Err(err) = self.shared.pid_file.lock()?.insert(id, pid) {
            warn!("Failed to record PID of '{id}': {err}");
        }
        Ok(())
    }

    /// Stops every service, newest launch first.
    pub fn stop_services(&self) -> Result<()> {
        let _op = self.op_lock.lock()?;
        self.stop_all()
    }

    fn stop_all(&self) -> Result<()> {
        let mut order: Vec<String> = self.launch_order()?.into_iter().rev().collect();
        let seen: HashSet<String> = order.iter().cloned().collect();
        for definition in self.shared.manifest.start_order().into_iter().rev() {
            if !seen.contains(&definition.id) {
                order.push(definition.id.clone());
            }
        }

        info!("Stopping all services...");
        let mut first_error = None;
        for service in order {
            if let Err(err) = self.shared.stop_one(&service) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stops everything, then wipes and recreates every service data directory.
    pub fn reset_chain(&self) -> Result<()> {
        let _op = self.op_lock.lock()?;
        self.stop_all()?;

        for (service, entry) in self.shared.states.snapshot()? {
            if entry.state != ServiceState::Stopped {
                return Err(EngineError::Precondition(format!(
                    "service '{service}' is {} after stop",
                    entry.state
                )));
            }
        }

        for definition in self.shared.manifest.services() {
            let data_dir = self.layout.data_dir(&definition.id);
            remove_dir_with_retries(&data_dir)?;
            fs::create_dir_all(&data_dir)?;
        }
        info!("Chain data reset");
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown_watcher();
    }
}

fn remove_dir_with_retries(path: &Path) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match fs::remove_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) if attempt < RESET_ATTEMPTS => {
                warn!(
                    "Failed to remove {} (attempt {attempt}): {err}",
                    path.display()
                );
                thread::sleep(Duration::from_millis(200));
            }
            Err(err) => return Err(err.into()),
        }
    }
}
