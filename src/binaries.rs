//! Binary acquisition: install status, verified downloads, unpacking.
use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Read, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    thread,
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::{
    error::{EngineError, Result},
    manifest::{ArchiveKind, Artifact, Manifest, Platform, ServiceDefinition},
    runtime::RuntimeLayout,
    state::{ServiceState, StateTable},
};

/// Receipt written into every verified install directory.
pub const RECEIPT_FILE: &str = ".isomer-receipt.json";

const CHUNK_SIZE: usize = 64 * 1024;
/// Minimum progress increase worth reporting.
const PROGRESS_STEP: f64 = 0.01;
/// Streaming progress stays below this until the artifact is verified and unpacked.
const PROGRESS_CEILING: f64 = 0.99;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BinaryStatus {
    NotInstalled,
    Downloading { progress: f64 },
    Installed { version: String },
    UpdateAvailable { current: String, latest: String },
}

impl BinaryStatus {
    /// Whether the install on disk can be launched.
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            BinaryStatus::Installed { .. } | BinaryStatus::UpdateAvailable { .. }
        )
    }
}

/// Install state of one service's executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryRecord {
    pub service: String,
    pub path: PathBuf,
    pub version: Option<String>,
    pub sha256: Option<String>,
    pub size_bytes: Option<u64>,
    pub status: BinaryStatus,
    /// Whether a sha256 is known for the artifact a download would fetch.
    #[serde(default)]
    pub checksum_published: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub version: String,
    pub archive_sha256: String,
    pub binary_sha256: String,
    pub installed_at: DateTime<Utc>,
}

impl InstallReceipt {
    pub fn load(install_dir: &Path) -> Option<Self> {
        let path = install_dir.join(RECEIPT_FILE);
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(receipt) => Some(receipt),
            Err(err) => {
                warn!("Ignoring unreadable receipt {}: {err}", path.display());
                None
            }
        }
    }

    fn save(&self, install_dir: &Path) -> Result<()> {
        fs::write(
            install_dir.join(RECEIPT_FILE),
            serde_json::to_string_pretty(self)?,
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexArtifact {
    pub url: String,
    pub sha256: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// Remote checksums document.
///
/// ```json
/// { "latest": { "ord": "0.22.1" },
///   "releases": { "0.22.1": { "ord": { "linux-x86_64": { "url": "...", "sha256": "..." } } } } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseIndex {
    #[serde(default)]
    pub latest: HashMap<String, String>,
    #[serde(default)]
    pub releases: HashMap<String, HashMap<String, HashMap<String, IndexArtifact>>>,
}

impl ReleaseIndex {
    fn entry(&self, service: &str, version: &str, platform: &Platform) -> Option<&IndexArtifact> {
        let targets = self.releases.get(version)?.get(service)?;
        targets
            .get(&platform.key())
            .or_else(|| targets.get("any"))
    }

    /// Latest published artifact for `service` on `platform`.
    pub fn artifact(&self, service: &str, platform: &Platform) -> Option<Artifact> {
        let version = self.latest.get(service)?;
        let entry = self.entry(service, version, platform)?;
        Some(Artifact {
            version: version.clone(),
            url: entry.url.clone(),
            sha256: entry.sha256.clone(),
            size_bytes: entry.size_bytes,
        })
    }

    pub fn expected_sha256(&self, service: &str, version: &str, platform: &Platform) -> Option<&str> {
        self.entry(service, version, platform)
            .map(|entry| entry.sha256.as_str())
            .filter(|sha| !sha.is_empty())
    }
}

/// Events delivered to a `download` subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Progress(f64),
    Installed { version: String },
    Failed(String),
}

/// An opened artifact stream.
pub struct FetchStream {
    pub reader: Box<dyn Read + Send>,
    pub content_length: Option<u64>,
}

/// Transport used to fetch artifacts and the release index.
pub trait ArtifactFetcher: Send + Sync {
    fn open(&self, url: &str) -> Result<FetchStream>;
}

/// Blocking HTTP(S) fetcher that also reads `file://` URLs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("isomer/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn open(&self, url: &str) -> Result<FetchStream> {
        if let Some(path) = url.strip_prefix("file://") {
            let file = File::open(path).map_err(|err| EngineError::Network {
                context: format!("opening {url}"),
                message: err.to_string(),
            })?;
            let content_length = file.metadata().ok().map(|meta| meta.len());
            return Ok(FetchStream {
                reader: Box::new(file),
                content_length,
            });
        }

        let response = self.client.get(url).send()?.error_for_status()?;
        let content_length = response.content_length();
        Ok(FetchStream {
            reader: Box::new(response),
            content_length,
        })
    }
}

struct InFlight {
    progress: f64,
    subscribers: Vec<Sender<DownloadEvent>>,
}

/// Size and modification time of a file, used to detect changes on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

impl Fingerprint {
    fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

/// Outcome of the last full verification of one install.
struct VerifiedInstall {
    executable: Fingerprint,
    receipt: Fingerprint,
    record: BinaryRecord,
}

/// Couples installs to the supervisor: files are only swapped while the
/// service is Stopped and no lifecycle operation is in progress.
#[derive(Clone)]
pub struct InstallGate {
    operations: Arc<Mutex<()>>,
    states: StateTable,
}

impl InstallGate {
    pub fn new(operations: Arc<Mutex<()>>, states: StateTable) -> Self {
        Self { operations, states }
    }

    fn ensure_stopped(&self, service: &str) -> Result<()> {
        let state = self.states.state(service)?;
        if state != ServiceState::Stopped {
            return Err(EngineError::Precondition(format!(
                "cannot replace the binaries of '{service}' while it is {state}"
            )));
        }
        Ok(())
    }

    /// Holds the operation lock and re-checks the state before returning.
    fn lock_stopped(&self, service: &str) -> Result<std::sync::MutexGuard<'_, ()>> {
        let guard = self.operations.lock()?;
        self.ensure_stopped(service)?;
        Ok(guard)
    }
}

/// Resolves install status and performs verified installs.
#[derive(Clone)]
pub struct BinaryManager {
    layout: RuntimeLayout,
    manifest: Arc<Manifest>,
    platform: Platform,
    fetcher: Arc<dyn ArtifactFetcher>,
    index: Arc<RwLock<Option<ReleaseIndex>>>,
    inflight: Arc<Mutex<HashMap<String, InFlight>>>,
    verified: Arc<Mutex<HashMap<String, VerifiedInstall>>>,
    gate: Option<InstallGate>,
    attempts: Arc<AtomicU64>,
}

impl BinaryManager {
    pub fn new(
        layout: RuntimeLayout,
        manifest: Arc<Manifest>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        Self::with_platform(layout, manifest, fetcher, Platform::current())
    }

    pub fn with_platform(
        layout: RuntimeLayout,
        manifest: Arc<Manifest>,
        fetcher: Arc<dyn ArtifactFetcher>,
        platform: Platform,
    ) -> Self {
        let index = load_cached_index(&layout.release_index_file());
        Self {
            layout,
            manifest,
            platform,
            fetcher,
            index: Arc::new(RwLock::new(index)),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            verified: Arc::new(Mutex::new(HashMap::new())),
            gate: None,
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Refuses downloads of services that are not Stopped and serializes
    /// the final swap with supervisor operations.
    pub fn with_gate(mut self, gate: InstallGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Whether a release index is loaded, from the network or from disk.
    pub fn has_index(&self) -> Result<bool> {
        Ok(self.index.read()?.is_some())
    }

    /// Absolute path of a service's executable.
    pub fn executable_path(&self, definition: &ServiceDefinition) -> PathBuf {
        self.layout
            .install_dir(&definition.id)
            .join(&definition.executable)
    }

    /// Fetches and caches the remote release index.
    pub fn fetch_index(&self, url: &str) -> Result<ReleaseIndex> {
        info!("Fetching release index from {url}");
        let mut stream = self.fetcher.open(url)?;
        let mut body = String::new();
        stream
            .reader
            .read_to_string(&mut body)
            .map_err(|err| EngineError::Network {
                context: format!("reading {url}"),
                message: err.to_string(),
            })?;
        let index: ReleaseIndex = serde_json::from_str(&body)?;

        let cache = self.layout.release_index_file();
        if let Some(parent) = cache.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&cache, &body)?;
        *self.index.write()? = Some(index.clone());
        Ok(index)
    }

    /// Offline status of every service, in manifest order.
    pub fn check_all(&self) -> Result<Vec<BinaryRecord>> {
        self.manifest
            .services()
            .iter()
            .map(|definition| self.check(&definition.id))
            .collect()
    }

    /// Like [`check_all`](Self::check_all) but reports newer index versions.
    pub fn check_all_with_index(&self, index: &ReleaseIndex) -> Result<Vec<BinaryRecord>> {
        let mut records = self.check_all()?;
        for record in &mut records {
            if let BinaryStatus::Installed { version } = &record.status
                && let Some(latest) = index.latest.get(&record.service)
                && is_newer_version(latest, version)
            {
                record.status = BinaryStatus::UpdateAvailable {
                    current: version.clone(),
                    latest: latest.clone(),
                };
            }
        }
        Ok(records)
    }

    /// Scans the install directory of one service without network access.
    ///
    /// Hashes the executable. An install is only usable when its receipt
    /// matches the bytes on disk and the archive hash published for the
    /// receipt's version.
    pub fn check(&self, service: &str) -> Result<BinaryRecord> {
        let definition = self.manifest.get(service)?;
        let path = self.executable_path(definition);
        let mut record = BinaryRecord {
            service: service.to_string(),
            path: path.clone(),
            version: None,
            sha256: None,
            size_bytes: None,
            status: BinaryStatus::NotInstalled,
            checksum_published: self.checksum_published(definition)?,
        };

        if let Some(entry) = self.inflight.lock()?.get(service) {
            record.status = BinaryStatus::Downloading {
                progress: entry.progress,
            };
            return Ok(record);
        }

        let receipt_path = self.layout.install_dir(service).join(RECEIPT_FILE);
        let fingerprints = (Fingerprint::of(&path), Fingerprint::of(&receipt_path));
        let record = self.verify_install(definition, record)?;

        let mut verified = self.verified.lock()?;
        match fingerprints {
            (Some(executable), Some(receipt)) if record.status.is_usable() => {
                verified.insert(
                    service.to_string(),
                    VerifiedInstall {
                        executable,
                        receipt,
                        record: record.clone(),
                    },
                );
            }
            _ => {
                verified.remove(service);
            }
        }
        Ok(record)
    }

    /// Like [`check`](Self::check) but reuses the last successful
    /// verification while the executable and its receipt are unchanged.
    pub fn check_cached(&self, service: &str) -> Result<BinaryRecord> {
        let definition = self.manifest.get(service)?;
        if !self.inflight.lock()?.contains_key(service) {
            let path = self.executable_path(definition);
            let receipt_path = self.layout.install_dir(service).join(RECEIPT_FILE);
            if let Some(cached) = self.verified.lock()?.get(service)
                && Fingerprint::of(&path).as_ref() == Some(&cached.executable)
                && Fingerprint::of(&receipt_path).as_ref() == Some(&cached.receipt)
            {
                return Ok(cached.record.clone());
            }
        }
        self.check(service)
    }

    fn verify_install(
        &self,
        definition: &ServiceDefinition,
        mut record: BinaryRecord,
    ) -> Result<BinaryRecord> {
        let service = definition.id.as_str();
        let path = record.path.clone();
        if !path.is_file() {
            return Ok(record);
        }
        let Some(receipt) = InstallReceipt::load(&self.layout.install_dir(service)) else {
            debug!("No install receipt for '{service}'");
            return Ok(record);
        };

        let actual = sha256_file(&path)?;
        if !actual.eq_ignore_ascii_case(&receipt.binary_sha256) {
            warn!(
                "Executable of '{service}' does not match its receipt (expected {}, got {actual})",
                receipt.binary_sha256
            );
            return Ok(record);
        }

        let Some(expected) = self.expected_archive_sha256(definition, &receipt.version)? else {
            warn!(
                "No published hash for '{service}' {}; the install cannot be verified",
                receipt.version
            );
            return Ok(record);
        };
        if !expected.eq_ignore_ascii_case(&receipt.archive_sha256) {
            warn!(
                "Install of '{service}' {} came from an unexpected archive ({})",
                receipt.version, receipt.archive_sha256
            );
            return Ok(record);
        }

        record.sha256 = Some(actual);
        record.size_bytes = fs::metadata(&path).ok().map(|meta| meta.len());
        record.version = Some(receipt.version.clone());
        record.status = if is_newer_version(&definition.release.version, &receipt.version) {
            BinaryStatus::UpdateAvailable {
                current: receipt.version,
                latest: definition.release.version.clone(),
            }
        } else {
            BinaryStatus::Installed {
                version: receipt.version,
            }
        };
        Ok(record)
    }

    fn checksum_published(&self, definition: &ServiceDefinition) -> Result<bool> {
        Ok(self
            .resolve_artifact(definition)
            .map(|artifact| !artifact.sha256.is_empty())
            .unwrap_or(false))
    }

    fn expected_archive_sha256(
        &self,
        definition: &ServiceDefinition,
        version: &str,
    ) -> Result<Option<String>> {
        if let Some(sha) = definition.release.expected_sha256(version, &self.platform) {
            return Ok(Some(sha.to_string()));
        }
        Ok(self.index.read()?.as_ref().and_then(|index| {
            index
                .expected_sha256(&definition.id, version, &self.platform)
                .map(str::to_string)
        }))
    }

    fn resolve_artifact(&self, definition: &ServiceDefinition) -> Result<Artifact> {
        let from_index = self
            .index
            .read()?
            .as_ref()
            .and_then(|index| index.artifact(&definition.id, &self.platform));

        let artifact = from_index.or_else(|| definition.release.artifact(&self.platform));
        artifact.ok_or_else(|| {
            EngineError::Precondition(format!(
                "no release of '{}' for platform {}",
                definition.id,
                self.platform.key()
            ))
        })
    }

    /// Starts (or joins) the download of one service.
    ///
    /// A caller joining an in-flight transfer first receives the current
    /// progress, then the same events as the original caller.
    ///
    /// Fails right away when the service is not Stopped or when no hash is
    /// published for the artifact.
    pub fn download(&self, service: &str) -> Result<Receiver<DownloadEvent>> {
        let definition = self.manifest.get(service)?;
        let (tx, rx) = mpsc::channel();

        let mut inflight = self.inflight.lock()?;
        if let Some(entry) = inflight.get_mut(service) {
            debug!("Joining in-flight download of '{service}'");
            let _ = tx.send(DownloadEvent::Progress(entry.progress));
            entry.subscribers.push(tx);
            return Ok(rx);
        }

        if let Some(gate) = &self.gate {
            gate.ensure_stopped(service)?;
        }
        let artifact = self.resolve_artifact(definition)?;
        if artifact.sha256.is_empty() {
            return Err(EngineError::MissingChecksum {
                service: service.to_string(),
                version: artifact.version,
                platform: self.platform.key(),
            });
        }

        inflight.insert(
            service.to_string(),
            InFlight {
                progress: 0.0,
                subscribers: vec![tx],
            },
        );
        drop(inflight);

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let manager = self.clone();
        let id = service.to_string();
        let spawned = thread::Builder::new()
            .name(format!("isomer-download-{id}"))
            .spawn(move || {
                let outcome = manager.run_download(&id, attempt);
                manager.finish(&id, outcome);
            });

        if let Err(err) = spawned {
            self.inflight.lock()?.remove(service);
            return Err(EngineError::Io(err));
        }
        Ok(rx)
    }

    fn finish(&self, service: &str, outcome: Result<String>) {
        let event = match &outcome {
            Ok(version) => {
                info!("Installed '{service}' {version}");
                DownloadEvent::Installed {
                    version: version.clone(),
                }
            }
            Err(err) => {
                error!("Download of '{service}' failed: {err}");
                DownloadEvent::Failed(err.to_string())
            }
        };

        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = inflight.remove(service) {
            for subscriber in entry.subscribers {
                let _ = subscriber.send(event.clone());
            }
        }
    }

    fn emit_progress(&self, service: &str, progress: f64) {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(entry) = inflight.get_mut(service) else {
            return;
        };
        let is_final = progress >= 1.0 && entry.progress < 1.0;
        if !is_final && progress < entry.progress + PROGRESS_STEP {
            return;
        }
        entry.progress = progress;
        entry
            .subscribers
            .retain(|tx| tx.send(DownloadEvent::Progress(progress)).is_ok());
    }

    fn run_download(&self, service: &str, attempt: u64) -> Result<String> {
        let definition = self.manifest.get(service)?.clone();
        let artifact = self.resolve_artifact(&definition)?;
        info!(
            "Downloading '{service}' {} from {}",
            artifact.version, artifact.url
        );

        fs::create_dir_all(self.layout.tmp_dir())?;
        fs::create_dir_all(self.layout.bin_dir())?;
        let part = self.layout.tmp_dir().join(format!("{service}-{attempt}.part"));
        let staging = self
            .layout
            .bin_dir()
            .join(format!(".staging-{service}-{attempt}"));

        let result = self.fetch_verify_install(&definition, &artifact, &part, &staging, attempt);

        let _ = fs::remove_file(&part);
        if staging.exists() {
            let _ = fs::remove_dir_all(&staging);
        }
        result.map(|()| artifact.version)
    }

    fn fetch_verify_install(
        &self,
        definition: &ServiceDefinition,
        artifact: &Artifact,
        part: &Path,
        staging: &Path,
        attempt: u64,
    ) -> Result<()> {
        let service = definition.id.as_str();
        let actual = self.stream_to_file(service, artifact, part)?;

        if artifact.sha256.is_empty() || !artifact.sha256.eq_ignore_ascii_case(&actual) {
            return Err(EngineError::Integrity {
                service: service.to_string(),
                expected: artifact.sha256.clone(),
                actual,
            });
        }
        debug!("Checksum verified for '{service}'");

        if staging.exists() {
            fs::remove_dir_all(staging)?;
        }
        fs::create_dir_all(staging)?;
        unpack(definition, &artifact.version, part, staging)?;

        let staged_executable = staging.join(&definition.executable);
        if !staged_executable.is_file() {
            return Err(EngineError::Archive {
                service: service.to_string(),
                message: format!("archive does not contain {}", definition.executable),
            });
        }
        fs::set_permissions(&staged_executable, fs::Permissions::from_mode(0o755))?;

        self.emit_progress(service, 1.0);

        let receipt = InstallReceipt {
            version: artifact.version.clone(),
            archive_sha256: actual.to_ascii_lowercase(),
            binary_sha256: sha256_file(&staged_executable)?,
            installed_at: Utc::now(),
        };
        receipt.save(staging)?;

        let _guard = match &self.gate {
            Some(gate) => Some(gate.lock_stopped(service)?),
            None => None,
        };
        let install_dir = self.layout.install_dir(service);
        swap_into_place(staging, &install_dir, &self.layout.bin_dir(), service, attempt)?;
        self.verified.lock()?.remove(service);
        Ok(())
    }

    /// Streams the artifact into `part`, returning its sha256.
    fn stream_to_file(&self, service: &str, artifact: &Artifact, part: &Path) -> Result<String> {
        let FetchStream {
            mut reader,
            content_length,
        } = self.fetcher.open(&artifact.url)?;
        let total = content_length.or(artifact.size_bytes).filter(|&n| n > 0);

        let mut file = File::create(part)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut received: u64 = 0;

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(EngineError::Network {
                        context: format!("downloading {}", artifact.url),
                        message: err.to_string(),
                    });
                }
            };
            file.write_all(&buf[..n])?;
            hasher.update(&buf[..n]);
            received += n as u64;

            if let Some(total) = total {
                let fraction = (received as f64 / total as f64).min(PROGRESS_CEILING);
                self.emit_progress(service, fraction);
            }
        }
        file.sync_all()?;
        debug!("Received {received} bytes for '{service}'");

        Ok(hex::encode(hasher.finalize()))
    }
}

fn unpack(
    definition: &ServiceDefinition,
    version: &str,
    archive_path: &Path,
    staging: &Path,
) -> Result<()> {
    let archive_error = |message: String| EngineError::Archive {
        service: definition.id.clone(),
        message,
    };
    let destination = staging.join(&definition.executable);

    match &definition.release.archive {
        ArchiveKind::Raw => {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(archive_path, &destination)?;
        }
        ArchiveKind::TarGz { member: Some(member) } => {
            let member = PathBuf::from(member.replace("{version}", version));
            let mut archive = tar::Archive::new(GzDecoder::new(File::open(archive_path)?));
            let entries = archive
                .entries()
                .map_err(|err| archive_error(err.to_string()))?;

            let mut found = false;
            for entry in entries {
                let mut entry = entry.map_err(|err| archive_error(err.to_string()))?;
                let path = entry
                    .path()
                    .map_err(|err| archive_error(err.to_string()))?
                    .into_owned();
                if path == member || path.ends_with(&member) {
                    if let Some(parent) = destination.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    entry
                        .unpack(&destination)
                        .map_err(|err| archive_error(err.to_string()))?;
                    found = true;
                    break;
                }
            }
            if !found {
                return Err(archive_error(format!(
                    "member {} not found",
                    member.display()
                )));
            }
        }
        ArchiveKind::TarGz { member: None } => {
            let mut archive = tar::Archive::new(GzDecoder::new(File::open(archive_path)?));
            archive
                .unpack(staging)
                .map_err(|err| archive_error(err.to_string()))?;
        }
    }
    Ok(())
}

/// Replaces `install_dir` with `staging`; the previous install is removed only after the swap.
fn swap_into_place(
    staging: &Path,
    install_dir: &Path,
    bin_dir: &Path,
    service: &str,
    attempt: u64,
) -> Result<()> {
    let previous = bin_dir.join(format!(".old-{service}-{attempt}"));
    let had_previous = install_dir.exists();
    if had_previous {
        fs::rename(install_dir, &previous)?;
    }

    if let Err(err) = fs::rename(staging, install_dir) {
        if had_previous && let Err(restore) = fs::rename(&previous, install_dir) {
            error!("Failed to restore previous install of '{service}': {restore}");
        }
        return Err(err.into());
    }

    if had_previous && let Err(err) = fs::remove_dir_all(&previous) {
        warn!("Failed to remove previous install of '{service}': {err}");
    }
    Ok(())
}

fn load_cached_index(path: &Path) -> Option<ReleaseIndex> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(index) => Some(index),
        Err(err) => {
            warn!("Ignoring unreadable release index {}: {err}", path.display());
            None
        }
    }
}

/// Parses release versions, accepting a leading `v` and tags without a
/// patch component such as `29.2`.
fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }

    let (core, pre) = match raw.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (raw, None),
    };
    let components = core.split('.').count();
    if components >= 3 {
        return None;
    }
    let mut padded = core.to_string();
    for _ in components..3 {
        padded.push_str(".0");
    }
    if let Some(pre) = pre {
        padded.push('-');
        padded.push_str(pre);
    }
    Version::parse(&padded).ok()
}

/// Whether `candidate` is a strictly newer release than `current`.
/// Versions that do not parse are compared for equality only.
pub fn is_newer_version(candidate: &str, current: &str) -> bool {
    match (parse_version(candidate), parse_version(current)) {
        (Some(candidate), Some(current)) => candidate > current,
        _ => candidate != current,
    }
}

/// Hex sha256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
