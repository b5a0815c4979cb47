//! Readiness probing of running services.
use std::{
    collections::HashMap,
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    path::PathBuf,
    process::{Command, Stdio},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use reqwest::blocking::Client;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    error::{EngineError, Result},
    events::{EngineEvent, EventBus},
    manifest::{HealthCheck, ServiceDefinition},
    runtime::RuntimeLayout,
    state::StateTable,
    supervisor::wait_with_timeout,
};

/// Probe targets shared between the supervisor and the monitor loop.
pub type SharedTargets = Arc<RwLock<Vec<ProbeTarget>>>;

/// Everything a prober needs to check one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub service: String,
    pub check: HealthCheck,
    pub host: String,
    pub port: Option<u16>,
    pub data_dir: PathBuf,
    /// Basic-auth credentials for JSON-RPC probes that ask for them.
    pub auth: Option<(String, String)>,
}

impl ProbeTarget {
    pub fn for_service(
        settings: &Settings,
        layout: &RuntimeLayout,
        definition: &ServiceDefinition,
    ) -> Self {
        let auth = match definition.health {
            HealthCheck::JsonRpc { auth: true, .. } => Some((
                settings.bitcoind.rpc_user.clone(),
                settings.bitcoind.rpc_password.clone(),
            )),
            _ => None,
        };
        Self {
            service: definition.id.clone(),
            check: definition.health.clone(),
            host: settings.host.clone(),
            port: definition.primary_port(settings),
            data_dir: layout.data_dir(&definition.id),
            auth,
        }
    }

    fn base_url(&self) -> Option<String> {
        self.port.map(|port| format!("http://{}:{port}", self.host))
    }
}

/// Performs a single readiness check.
pub trait HealthProber: Send + Sync {
    fn probe(&self, target: &ProbeTarget) -> bool;
}

/// Probes services over their native protocol.
#[derive(Debug, Clone)]
pub struct NetworkProber {
    client: Client,
    timeout: Duration,
}

impl NetworkProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, timeout })
    }

    fn probe_json_rpc(&self, target: &ProbeTarget, method: &str) -> bool {
        let Some(url) = target.base_url() else {
            return false;
        };
        let body = json!({
            "jsonrpc": "1.0",
            "id": "isomer-health",
            "method": method,
            "params": [],
        });
        let mut request = self.client.post(url).json(&body);
        if let Some((user, password)) = &target.auth {
            request = request.basic_auth(user, Some(password));
        }

        match request.send().and_then(|response| response.json::<Value>()) {
            Ok(value) => {
                value.get("result").is_some()
                    && value.get("error").is_none_or(Value::is_null)
            }
            Err(err) => {
                debug!("JSON-RPC probe of '{}' failed: {err}", target.service);
                false
            }
        }
    }

    fn probe_http(&self, target: &ProbeTarget, path: &str, accept: &[u16]) -> bool {
        let Some(base) = target.base_url() else {
            return false;
        };
        let url = if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        };

        match self.client.get(&url).send() {
            Ok(response) => {
                let status = response.status();
                if accept.is_empty() {
                    status.is_success()
                } else {
                    accept.contains(&status.as_u16())
                }
            }
            Err(err) => {
                debug!("HTTP probe of '{}' at {url} failed: {err}", target.service);
                false
            }
        }
    }

    fn probe_tcp(&self, target: &ProbeTarget) -> bool {
        let Some(port) = target.port else {
            return false;
        };
        let addrs: Vec<SocketAddr> = match (target.host.as_str(), port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(err) => {
                debug!("Unable to resolve {}:{port}: {err}", target.host);
                return false;
            }
        };
        addrs
            .iter()
            .any(|addr| TcpStream::connect_timeout(addr, self.timeout).is_ok())
    }

    fn probe_command(&self, target: &ProbeTarget, command: &str) -> bool {
        let spawned = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&target.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                debug!("Health command for '{}' failed to spawn: {err}", target.service);
                return false;
            }
        };

        match wait_with_timeout(&mut child, self.timeout) {
            Ok(Some(status)) => status.success(),
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                debug!("Health command for '{}' timed out", target.service);
                false
            }
            Err(err) => {
                debug!("Health command for '{}' failed: {err}", target.service);
                false
            }
        }
    }
}

impl HealthProber for NetworkProber {
    fn probe(&self, target: &ProbeTarget) -> bool {
        match &target.check {
            HealthCheck::JsonRpc { method, .. } => self.probe_json_rpc(target, method),
            HealthCheck::Http { path, accept } => self.probe_http(target, path, accept),
            HealthCheck::Tcp => self.probe_tcp(target),
            HealthCheck::Command { command } => self.probe_command(target, command),
        }
    }
}

/// Health flags per service with consecutive-failure accounting.
#[derive(Debug, Clone)]
pub struct HealthTable {
    healthy: Arc<RwLock<HashMap<String, bool>>>,
    failures: Arc<Mutex<HashMap<String, u32>>>,
    threshold: u32,
    events: EventBus,
}

impl HealthTable {
    pub fn new(threshold: u32, events: EventBus) -> Self {
        Self {
            healthy: Arc::new(RwLock::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            threshold: threshold.max(1),
            events,
        }
    }

    pub fn is_healthy(&self, service: &str) -> bool {
        self.healthy
            .read()
            .map(|map| map.get(service).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> Result<HashMap<String, bool>> {
        Ok(self.healthy.read()?.clone())
    }

    /// Folds one probe result into the table.
    ///
    /// A success marks the service healthy immediately; it turns unhealthy
    /// only after `threshold` consecutive failures.
    pub fn record(&self, service: &str, ok: bool) -> Result<()> {
        let now_healthy = {
            let mut failures = self.failures.lock()?;
            let count = failures.entry(service.to_string()).or_insert(0);
            if ok {
                *count = 0;
                Some(true)
            } else {
                *count = count.saturating_add(1);
                (*count >= self.threshold).then_some(false)
            }
        };

        if let Some(healthy) = now_healthy {
            self.set(service, healthy)?;
        }
        Ok(())
    }

    /// Forgets a service, e.g. after it stopped.
    pub fn clear(&self, service: &str) -> Result<()> {
        self.failures.lock()?.remove(service);
        self.set(service, false)
    }

    fn set(&self, service: &str, healthy: bool) -> Result<()> {
        let previous = self
            .healthy
            .write()?
            .insert(service.to_string(), healthy)
            .unwrap_or(false);

        if previous != healthy {
            if healthy {
                info!("Service '{service}' is healthy");
            } else {
                warn!("Service '{service}' is unhealthy");
            }
            self.events.publish(EngineEvent::HealthChanged {
                service: service.to_string(),
                healthy,
            });
        }
        Ok(())
    }
}

/// Background loop probing every Running service at a fixed interval.
pub struct HealthMonitor {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Spawns the probe loop. It never stops or restarts services.
    pub fn spawn(
        targets: SharedTargets,
        prober: Arc<dyn HealthProber>,
        table: HealthTable,
        states: StateTable,
        interval: Duration,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("isomer-health".into())
            .spawn(move || {
                debug!("Health monitor started with interval {interval:?}");
                while flag.load(Ordering::SeqCst) {
                    let current = targets
                        .read()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .clone();
                    for target in &current {
                        if !flag.load(Ordering::SeqCst) {
                            break;
                        }
                        let running = states
                            .state(&target.service)
                            .map(|state| state.is_running())
                            .unwrap_or(false);
                        if !running {
                            continue;
                        }
                        let ok = prober.probe(target);
                        if let Err(err) = table.record(&target.service, ok) {
                            warn!("Failed to record health of '{}': {err}", target.service);
                        }
                    }
                    sleep_while(&flag, interval);
                }
                debug!("Health monitor stopped");
            })
            .map_err(EngineError::Io)?;

        Ok(Self {
            running,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sleeps up to `duration`, waking early once `flag` clears.
pub(crate) fn sleep_while(flag: &AtomicBool, duration: Duration) {
    const SLICE: Duration = Duration::from_millis(50);
    let deadline = Instant::now() + duration;
    while flag.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(SLICE.min(deadline - now));
    }
}
