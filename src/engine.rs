//! The orchestration facade consumers talk to.
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver},
    },
    thread,
};

use fs2::FileExt;
use tracing::{debug, error, info, warn};

use crate::{
    binaries::{
        ArtifactFetcher, BinaryManager, BinaryRecord, BinaryStatus, DownloadEvent, HttpFetcher,
        InstallGate,
    },
    config::{Settings, Timings},
    error::{EngineError, Result},
    events::{EngineEvent, EventBus},
    generator,
    health::{HealthMonitor, HealthProber, HealthTable, NetworkProber},
    logs::{DEFAULT_LOG_LIMIT, LogBuffer, LogLine},
    manifest::{Manifest, Platform},
    rpc::{ChainRpc, STATUS_TIMEOUT},
    runtime::RuntimeLayout,
    state::{ServiceState, ServiceStatus, StateTable, SystemStatus},
    supervisor::Supervisor,
};

/// Default faucet amount in BTC.
const DEFAULT_FAUCET_BTC: f64 = 1.0;

/// Builds an [`Engine`], optionally with custom transport or probing.
pub struct EngineBuilder {
    settings: Settings,
    manifest: Manifest,
    layout: RuntimeLayout,
    settings_path: Option<PathBuf>,
    fetcher: Option<Arc<dyn ArtifactFetcher>>,
    prober: Option<Arc<dyn HealthProber>>,
    platform: Option<Platform>,
}

impl EngineBuilder {
    pub fn new(settings: Settings, manifest: Manifest, layout: RuntimeLayout) -> Self {
        Self {
            settings,
            manifest,
            layout,
            settings_path: None,
            fetcher: None,
            prober: None,
            platform: None,
        }
    }

    /// File [`Engine::update_settings`] writes to. Defaults to the
    /// settings file inside the data root.
    pub fn settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = Some(path.into());
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn prober(mut self, prober: Arc<dyn HealthProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Locks the data root, reaps orphans of a previous run and starts the
    /// background threads. No service is started.
    pub fn build(self) -> Result<Engine> {
        let Self {
            settings,
            manifest,
            layout,
            settings_path,
            fetcher,
            prober,
            platform,
        } = self;

        settings.validate()?;
        let timings = settings.supervision.timings()?;
        generator::assigned_ports(&settings, &manifest)?;

        layout.ensure()?;
        let lock_path = layout.lock_file();
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        if lock.try_lock_exclusive().is_err() {
            return Err(EngineError::InstanceLocked(lock_path));
        }

        let settings_path = settings_path.unwrap_or_else(|| layout.settings_file());
        let settings = Arc::new(settings);
        let manifest = Arc::new(manifest);
        let operations = Arc::new(Mutex::new(()));
        let events = EventBus::new();
        let states = StateTable::new(manifest.start_order_ids(), events.clone());
        let health = HealthTable::new(timings.unhealthy_threshold, events.clone());
        let logs = LogBuffer::new(timings.log_capacity);

        let fetcher = match fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new()?),
        };
        let binaries = BinaryManager::with_platform(
            layout.clone(),
            Arc::clone(&manifest),
            fetcher,
            platform.unwrap_or_else(Platform::current),
        )
        .with_gate(InstallGate::new(Arc::clone(&operations), states.clone()));
        let prober = match prober {
            Some(prober) => prober,
            None => Arc::new(NetworkProber::new(timings.probe_timeout)?),
        };

        let supervisor = Supervisor::new(
            settings,
            layout.clone(),
            Arc::clone(&manifest),
            binaries.clone(),
            Arc::clone(&prober),
            states.clone(),
            health.clone(),
            logs.clone(),
            operations,
        )?;
        let reaped = supervisor.reap_orphans()?;
        if !reaped.is_empty() {
            warn!("Reaped orphaned services: {}", reaped.join(", "));
        }
        supervisor.spawn_watcher()?;

        let monitor = HealthMonitor::spawn(
            supervisor.probe_targets(),
            prober,
            health,
            states,
            timings.health_interval,
        )?;

        info!("Engine ready at {}", layout.root().display());
        Ok(Engine {
            settings_path,
            layout,
            manifest,
            timings,
            events,
            logs,
            binaries,
            supervisor,
            monitor,
            _lock: lock,
            shut_down: AtomicBool::new(false),
        })
    }
}

/// Owns every service of the stack for the lifetime of the process.
pub struct Engine {
    settings_path: PathBuf,
    layout: RuntimeLayout,
    manifest: Arc<Manifest>,
    timings: Timings,
    events: EventBus,
    logs: LogBuffer,
    binaries: BinaryManager,
    supervisor: Supervisor,
    monitor: HealthMonitor,
    _lock: File,
    shut_down: AtomicBool,
}

impl Engine {
    pub fn new(settings: Settings, manifest: Manifest, layout: RuntimeLayout) -> Result<Self> {
        EngineBuilder::new(settings, manifest, layout).build()
    }

    /// Settings in effect for the next launch.
    pub fn settings(&self) -> Arc<Settings> {
        self.supervisor.settings()
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Validates, saves and applies new settings.
    ///
    /// Generated configuration is fixed for the life of a process, so this
    /// is refused unless every service is Stopped. Supervision timings take
    /// effect the next time an engine is built.
    pub fn update_settings(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        let timings = settings.supervision.timings()?;
        generator::assigned_ports(&settings, &self.manifest)?;

        let path = self.settings_path.clone();
        self.supervisor
            .apply_settings(settings, |settings| settings.save(&path))?;
        if timings != self.timings {
            info!("Supervision changes apply the next time the engine starts");
        }
        Ok(())
    }

    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Starts every service in dependency order, rolling back on failure.
    pub fn start_services(&self) -> Result<()> {
        self.supervisor.start_services()?;
        self.bootstrap_wallet();
        Ok(())
    }

    fn bootstrap_wallet(&self) {
        let Some(chain) = self.manifest.chain_daemon() else {
            return;
        };
        if !self.is_ready(&chain.id) {
            return;
        }
        let settings = self.settings();
        let outcome =
            ChainRpc::new(&settings).and_then(|rpc| rpc.bootstrap(settings.mining.initial_blocks));
        if let Err(err) = outcome {
            warn!("Wallet bootstrap failed: {err}");
        }
    }

    pub fn stop_services(&self) -> Result<()> {
        self.supervisor.stop_services()
    }

    /// Stops everything and wipes chain data. Binaries and settings stay.
    pub fn reset_chain(&self) -> Result<()> {
        self.supervisor.reset_chain()?;
        self.events.publish(EngineEvent::ChainReset);
        Ok(())
    }

    fn is_ready(&self, service: &str) -> bool {
        let running = self
            .supervisor
            .states()
            .state(service)
            .map(|state| state.is_running())
            .unwrap_or(false);
        running && self.supervisor.health().is_healthy(service)
    }

    pub fn get_status(&self) -> Result<SystemStatus> {
        let snapshot = self.supervisor.states().snapshot()?;
        let settings = self.settings();
        let now = chrono::Utc::now();

        let mut services = Vec::with_capacity(snapshot.len());
        for definition in self.manifest.start_order() {
            let Some(entry) = snapshot.get(&definition.id) else {
                continue;
            };
            let version = match self.binaries.check_cached(&definition.id) {
                Ok(record) => record.version,
                Err(err) => {
                    debug!("Unable to read install state of '{}': {err}", definition.id);
                    None
                }
            };
            let running = entry.state.is_running();
            services.push(ServiceStatus {
                id: definition.id.clone(),
                display_name: definition.display_name.clone(),
                state: entry.state.clone(),
                uptime_secs: entry
                    .started_at
                    .filter(|_| running)
                    .map(|started| (now - started).num_seconds().max(0) as u64),
                pid: entry.pid,
                port: definition.primary_port(&settings),
                version,
                healthy: running && self.supervisor.health().is_healthy(&definition.id),
                last_error: entry.last_error.clone(),
                exit_code: entry.exit_code,
            });
        }

        let (block_height, mempool_size) = self.chain_metrics();
        let is_ready = !services.is_empty()
            && services
                .iter()
                .all(|status| status.state == ServiceState::Running && status.healthy);

        Ok(SystemStatus {
            services,
            block_height,
            mempool_size,
            is_ready,
        })
    }

    fn chain_metrics(&self) -> (Option<u64>, Option<u64>) {
        let Some(chain) = self.manifest.chain_daemon() else {
            return (None, None);
        };
        if !self.is_ready(&chain.id) {
            return (None, None);
        }
        match ChainRpc::with_timeout(&self.settings(), STATUS_TIMEOUT) {
            Ok(rpc) => (rpc.block_count().ok(), rpc.mempool_size().ok()),
            Err(err) => {
                debug!("Unable to query chain metrics: {err}");
                (None, None)
            }
        }
    }

    /// Install status of every service. Consults the release index when one
    /// is configured and reachable.
    pub fn check_binaries(&self) -> Result<Vec<BinaryRecord>> {
        if let Some(url) = &self.settings().release_index_url {
            match self.binaries.fetch_index(url) {
                Ok(index) => return self.binaries.check_all_with_index(&index),
                Err(err) => warn!("Release index unavailable, checking offline: {err}"),
            }
        }
        self.binaries.check_all()
    }

    /// Downloads every missing or outdated binary in parallel and waits for
    /// all transfers. Failures are published and logged, and show up as
    /// `NotInstalled` in the returned records. Services that are not
    /// Stopped keep their current install.
    pub fn download_binaries(&self) -> Result<Vec<BinaryRecord>> {
        let pending: Vec<String> = self
            .check_binaries()?
            .into_iter()
            .filter(|record| !matches!(record.status, BinaryStatus::Installed { .. }))
            .map(|record| record.service)
            .collect();

        if pending.is_empty() {
            info!("All binaries installed");
        }

        let mut receivers = Vec::with_capacity(pending.len());
        for service in &pending {
            match self.download(service) {
                Ok(rx) => receivers.push((service.clone(), rx)),
                Err(err) => {
                    error!("Download of '{service}' not started: {err}");
                    self.events.publish(EngineEvent::DownloadFailed {
                        service: service.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        for (service, rx) in receivers {
            for event in rx {
                if let DownloadEvent::Failed(reason) = event {
                    error!("Download of '{service}' failed: {reason}");
                }
            }
        }

        self.binaries.check_all()
    }

    /// Loads the release index when the manifest publishes no hash for a
    /// service and none is cached yet.
    fn ensure_release_index(&self) {
        let settings = self.settings();
        let Some(url) = &settings.release_index_url else {
            return;
        };
        if self.binaries.has_index().unwrap_or(false) {
            return;
        }
        if let Err(err) = self.binaries.fetch_index(url) {
            warn!("Release index unavailable, using built-in releases: {err}");
        }
    }

    /// Starts (or joins) one download. Events are also published on the bus.
    ///
    /// Refused with `Precondition` unless the service is Stopped.
    pub fn download(&self, service: &str) -> Result<Receiver<DownloadEvent>> {
        self.manifest.get(service)?;
        self.ensure_release_index();
        let upstream = self.binaries.download(service)?;
        let (tx, rx) = mpsc::channel();
        let events = self.events.clone();
        let id = service.to_string();

        thread::Builder::new()
            .name(format!("isomer-download-{service}"))
            .spawn(move || {
                for event in upstream {
                    let published = match &event {
                        DownloadEvent::Progress(progress) => EngineEvent::DownloadProgress {
                            service: id.clone(),
                            progress: *progress,
                        },
                        DownloadEvent::Installed { version } => EngineEvent::DownloadFinished {
                            service: id.clone(),
                            version: version.clone(),
                        },
                        DownloadEvent::Failed(error) => EngineEvent::DownloadFailed {
                            service: id.clone(),
                            error: error.clone(),
                        },
                    };
                    events.publish(published);
                    // The caller may have dropped its receiver.
                    let _ = tx.send(event);
                }
            })?;
        Ok(rx)
    }

    /// Most recent log lines, newest last.
    pub fn get_logs(&self, service: Option<&str>, limit: Option<usize>) -> Result<Vec<LogLine>> {
        if let Some(id) = service {
            self.manifest.get(id)?;
        }
        Ok(self.logs.get(service, limit.unwrap_or(DEFAULT_LOG_LIMIT)))
    }

    pub fn clear_logs(&self) {
        self.logs.clear();
    }

    fn ready_chain(&self) -> Result<ChainRpc> {
        let chain = self.manifest.chain_daemon().ok_or_else(|| {
            EngineError::Precondition("the manifest defines no chain daemon".to_string())
        })?;
        if !self.is_ready(&chain.id) {
            return Err(EngineError::Precondition(format!(
                "chain daemon '{}' is not running and healthy",
                chain.id
            )));
        }
        ChainRpc::new(&self.settings())
    }

    /// Mines `count` blocks and returns the new chain height.
    pub fn mine_blocks(&self, count: u32, address: Option<&str>) -> Result<u64> {
        let max = self.settings().mining.max_blocks_per_call;
        if count == 0 || count > max {
            return Err(EngineError::Precondition(format!(
                "block count must be between 1 and {max}, got {count}"
            )));
        }

        let rpc = self.ready_chain()?;
        let address = match address {
            Some(address) => address.to_string(),
            None => {
                rpc.ensure_wallet()?;
                rpc.new_address()?
            }
        };

        rpc.generate_to_address(count, &address)?;
        let height = rpc.block_count()?;
        info!("Mined {count} blocks to {address}; height is now {height}");
        Ok(height)
    }

    /// Sends BTC from the dev wallet. Non-positive amounts send 1 BTC.
    pub fn faucet(&self, address: &str, amount: f64) -> Result<String> {
        if address.trim().is_empty() {
            return Err(EngineError::Precondition(
                "faucet needs a destination address".to_string(),
            ));
        }
        let amount = if amount > 0.0 { amount } else { DEFAULT_FAUCET_BTC };

        let rpc = self.ready_chain()?;
        rpc.ensure_wallet()?;
        let txid = rpc.send_to_address(address, amount)?;
        info!("Faucet sent {amount} BTC to {address} (txid {txid})");
        Ok(txid)
    }

    /// Probes one service now. Services that are not Running are unhealthy.
    pub fn check_service_health(&self, service: &str) -> Result<bool> {
        if !self.supervisor.states().state(service)?.is_running() {
            return Ok(false);
        }
        self.supervisor.probe(service)
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Stops every service and the background threads. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down engine");
        self.monitor.shutdown();
        if let Err(err) = self.supervisor.stop_services() {
            error!("Failed to stop services during shutdown: {err}");
        }
        self.supervisor.shutdown_watcher();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
