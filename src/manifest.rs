//! Binary registry: the static description of every managed service.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fs,
    mem::discriminant,
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::{Settings, parse_duration},
    error::{EngineError, Result},
};

/// Release base for binaries that are not published upstream.
const ISOMER_RELEASE_BASE: &str =
    "https://github.com/jonatns/isomer/releases/download/binaries-v0.1.3";

/// Checksums document published next to the isomer release artifacts.
pub const DEFAULT_RELEASE_INDEX_URL: &str =
    "https://github.com/jonatns/isomer/releases/download/binaries-v0.1.3/release-index.json";

/// Role a service plays in the stack. Drives config generation and port lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceKind {
    ChainDaemon,
    Metashrew,
    Ord,
    Esplora,
    Gateway,
    /// Arbitrary executable with placeholder-expanded arguments.
    Custom {
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        port: Option<u16>,
    },
}

impl ServiceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ServiceKind::ChainDaemon => "chain_daemon",
            ServiceKind::Metashrew => "metashrew",
            ServiceKind::Ord => "ord",
            ServiceKind::Esplora => "esplora",
            ServiceKind::Gateway => "gateway",
            ServiceKind::Custom { .. } => "custom",
        }
    }

    /// Whether both values are the same variant, ignoring payload.
    pub fn same_kind(&self, other: &ServiceKind) -> bool {
        discriminant(self) == discriminant(other)
    }
}

/// Readiness probe declared for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheck {
    /// JSON-RPC 1.0 POST to the primary port.
    JsonRpc {
        method: String,
        /// Send the chain daemon's basic-auth credentials.
        #[serde(default)]
        auth: bool,
    },
    /// HTTP GET; any 2xx unless `accept` lists explicit statuses.
    Http {
        #[serde(default = "default_http_path")]
        path: String,
        #[serde(default)]
        accept: Vec<u16>,
    },
    /// TCP connect to the primary port.
    Tcp,
    /// Shell command run in the data directory; exit 0 means healthy.
    Command { command: String },
}

fn default_http_path() -> String {
    "/".to_string()
}

/// How a downloaded artifact turns into an install directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArchiveKind {
    /// The download is the executable itself.
    Raw,
    /// Gzipped tarball. With `member`, only that entry is extracted as the executable.
    TarGz {
        #[serde(default)]
        member: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformTarget {
    /// Value substituted for `{target}` in the URL template.
    #[serde(default)]
    pub target: String,
    /// Expected sha256 of the downloaded artifact; empty when unpublished.
    #[serde(default)]
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub version: String,
    pub archive: ArchiveKind,
    pub url_template: String,
    /// Keyed by platform (`linux-x86_64`, `darwin-arm64`, ...) or `any`.
    #[serde(default)]
    pub targets: BTreeMap<String, PlatformTarget>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// Artifact location resolved for one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub version: String,
    pub url: String,
    pub sha256: String,
    pub size_bytes: Option<u64>,
}

/// Host platform in release-key form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
}

impl Platform {
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "aarch64" => "arm64",
            other => other,
        };
        Self { os, arch }
    }

    pub fn key(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }
}

impl Release {
    /// Target entry for the platform, falling back to `any`.
    pub fn target_for(&self, platform: &Platform) -> Option<&PlatformTarget> {
        self.targets
            .get(&platform.key())
            .or_else(|| self.targets.get("any"))
    }

    /// Resolves URL and expected hash for the platform.
    pub fn artifact(&self, platform: &Platform) -> Option<Artifact> {
        let target = self.target_for(platform)?;
        let url = self
            .url_template
            .replace("{version}", &self.version)
            .replace("{target}", &target.target)
            .replace("{os}", platform.os)
            .replace("{arch}", platform.arch);
        Some(Artifact {
            version: self.version.clone(),
            url,
            sha256: target.sha256.clone(),
            size_bytes: self.size_bytes,
        })
    }

    /// Known expected archive hash for `version` on `platform`, if this release describes it.
    pub fn expected_sha256(&self, version: &str, platform: &Platform) -> Option<&str> {
        if version != self.version {
            return None;
        }
        self.target_for(platform)
            .map(|target| target.sha256.as_str())
            .filter(|sha| !sha.is_empty())
    }
}

/// Static description of one managed service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    pub kind: ServiceKind,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Path relative to the service install directory.
    pub executable: String,
    /// Program that runs `executable`, e.g. `node`.
    #[serde(default)]
    pub interpreter: Option<String>,
    pub health: HealthCheck,
    #[serde(default)]
    pub startup_timeout: Option<String>,
    pub release: Release,
}

impl ServiceDefinition {
    /// Port the health probe and status report refer to.
    pub fn primary_port(&self, settings: &Settings) -> Option<u16> {
        let ports = &settings.ports;
        match &self.kind {
            ServiceKind::ChainDaemon => Some(ports.bitcoind_rpc),
            ServiceKind::Metashrew => Some(ports.metashrew),
            ServiceKind::Ord => Some(ports.ord),
            ServiceKind::Esplora => Some(ports.esplora_http),
            ServiceKind::Gateway => Some(ports.jsonrpc),
            ServiceKind::Custom { port, .. } => *port,
        }
    }

    /// Every port the service listens on.
    pub fn listen_ports(&self, settings: &Settings) -> Vec<u16> {
        let ports = &settings.ports;
        match &self.kind {
            ServiceKind::ChainDaemon => vec![ports.bitcoind_rpc, ports.bitcoind_p2p],
            ServiceKind::Esplora => vec![ports.esplora_http, ports.electrum],
            _ => self.primary_port(settings).into_iter().collect(),
        }
    }

    pub fn startup_timeout(&self, default: Duration) -> Result<Duration> {
        match &self.startup_timeout {
            Some(raw) => parse_duration(raw),
            None => Ok(default),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    services: Vec<ServiceDefinition>,
}

/// Validated set of service definitions with a fixed start order.
#[derive(Debug, Clone)]
pub struct Manifest {
    services: Vec<ServiceDefinition>,
    start_order: Vec<usize>,
}

impl Manifest {
    /// Validates definitions and computes the start order.
    pub fn new(mut services: Vec<ServiceDefinition>) -> Result<Self> {
        let mut seen = HashSet::new();
        for service in &mut services {
            if !is_valid_id(&service.id) {
                return Err(EngineError::ConfigInvalid(format!(
                    "invalid service id '{}'",
                    service.id
                )));
            }
            if !seen.insert(service.id.clone()) {
                return Err(EngineError::ConfigInvalid(format!(
                    "service '{}' is defined more than once",
                    service.id
                )));
            }
            if service.executable.trim().is_empty() {
                return Err(EngineError::ConfigInvalid(format!(
                    "service '{}' has no executable",
                    service.id
                )));
            }
            if let Some(raw) = &service.startup_timeout {
                parse_duration(raw)?;
            }
            if service.display_name.is_empty() {
                service.display_name = service.id.clone();
            }
        }

        for service in &services {
            for dependency in &service.dependencies {
                if !seen.contains(dependency) {
                    return Err(EngineError::UnknownDependency {
                        service: service.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let start_order = topological_order(&services)?;
        debug!(
            "Service start order: {:?}",
            start_order
                .iter()
                .map(|&i| services[i].id.as_str())
                .collect::<Vec<_>>()
        );

        Ok(Self {
            services,
            start_order,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: ManifestFile = serde_yaml::from_str(content)?;
        Self::new(file.services)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::Io(std::io::Error::new(
                e.kind(),
                format!("{} ({})", e, path.display()),
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Definitions in declaration order.
    pub fn services(&self) -> &[ServiceDefinition] {
        &self.services
    }

    pub fn get(&self, id: &str) -> Result<&ServiceDefinition> {
        self.services
            .iter()
            .find(|service| service.id == id)
            .ok_or_else(|| EngineError::UnknownService(id.to_string()))
    }

    /// Definitions with every dependency before its dependents.
    pub fn start_order(&self) -> Vec<&ServiceDefinition> {
        self.start_order.iter().map(|&i| &self.services[i]).collect()
    }

    pub fn start_order_ids(&self) -> Vec<String> {
        self.start_order()
            .into_iter()
            .map(|service| service.id.clone())
            .collect()
    }

    /// Services that list `id` directly as a dependency.
    pub fn direct_dependents(&self, id: &str) -> Vec<&str> {
        self.services
            .iter()
            .filter(|service| service.dependencies.iter().any(|dep| dep == id))
            .map(|service| service.id.as_str())
            .collect()
    }

    /// Every service that depends on `id` directly or indirectly, in start order.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let mut affected = HashSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            for dependent in self.direct_dependents(&current) {
                if affected.insert(dependent.to_string()) {
                    stack.push(dependent.to_string());
                }
            }
        }

        self.start_order()
            .into_iter()
            .filter(|service| affected.contains(&service.id))
            .map(|service| service.id.clone())
            .collect()
    }

    /// Closest dependency of `service` (direct first, then transitive) with the given kind.
    pub fn dependency_of_kind(
        &self,
        service: &ServiceDefinition,
        kind: &ServiceKind,
    ) -> Option<&ServiceDefinition> {
        let mut visited = HashSet::new();
        let mut frontier: Vec<&str> = service.dependencies.iter().map(String::as_str).collect();

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for id in frontier {
                if !visited.insert(id) {
                    continue;
                }
                let Ok(candidate) = self.get(id) else {
                    continue;
                };
                if candidate.kind.same_kind(kind) {
                    return Some(candidate);
                }
                next.extend(candidate.dependencies.iter().map(String::as_str));
            }
            frontier = next;
        }
        None
    }

    /// The service mining and faucet calls are routed to.
    pub fn chain_daemon(&self) -> Option<&ServiceDefinition> {
        self.services
            .iter()
            .find(|service| service.kind == ServiceKind::ChainDaemon)
    }

    /// The built-in regtest stack.
    pub fn builtin() -> Result<Self> {
        Self::new(builtin_services())
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Kahn's algorithm with ties broken by declaration order.
fn topological_order(services: &[ServiceDefinition]) -> Result<Vec<usize>> {
    let index: HashMap<&str, usize> = services
        .iter()
        .enumerate()
        .map(|(i, service)| (service.id.as_str(), i))
        .collect();

    let mut in_degree: Vec<usize> = vec![0; services.len()];
    let mut reverse: Vec<Vec<usize>> = vec![Vec::new(); services.len()];
    for (i, service) in services.iter().enumerate() {
        let deps: BTreeSet<usize> = service
            .dependencies
            .iter()
            .filter_map(|dep| index.get(dep.as_str()).copied())
            .collect();
        in_degree[i] = deps.len();
        for dep in deps {
            reverse[dep].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..services.len())
        .filter(|&i| in_degree[i] == 0)
        .collect();
    let mut order = Vec::with_capacity(services.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &reverse[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != services.len() {
        return Err(EngineError::DependencyCycle {
            cycle: find_cycle(services, &index).join(" -> "),
        });
    }
    Ok(order)
}

fn find_cycle(services: &[ServiceDefinition], index: &HashMap<&str, usize>) -> Vec<String> {
    fn visit(
        node: usize,
        services: &[ServiceDefinition],
        index: &HashMap<&str, usize>,
        visited: &mut HashSet<usize>,
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        path.push(node);

        for dep in &services[node].dependencies {
            let Some(&dep) = index.get(dep.as_str()) else {
                continue;
            };
            if let Some(start) = path.iter().position(|&n| n == dep) {
                let mut cycle: Vec<String> = path[start..]
                    .iter()
                    .map(|&n| services[n].id.clone())
                    .collect();
                cycle.push(services[dep].id.clone());
                return Some(cycle);
            }
            if !visited.contains(&dep)
                && let Some(cycle) = visit(dep, services, index, visited, path)
            {
                return Some(cycle);
            }
        }

        path.pop();
        None
    }

    let mut visited = HashSet::new();
    for node in 0..services.len() {
        if visited.contains(&node) {
            continue;
        }
        let mut path = Vec::new();
        if let Some(cycle) = visit(node, services, index, &mut visited, &mut path) {
            return cycle;
        }
    }
    Vec::new()
}

fn target(target: &str, sha256: &str) -> PlatformTarget {
    PlatformTarget {
        target: target.to_string(),
        sha256: sha256.to_string(),
    }
}

fn builtin_services() -> Vec<ServiceDefinition> {
    let bitcoind = ServiceDefinition {
        id: "bitcoind".into(),
        display_name: "Bitcoin Core".into(),
        kind: ServiceKind::ChainDaemon,
        dependencies: Vec::new(),
        executable: "bitcoind".into(),
        interpreter: None,
        health: HealthCheck::JsonRpc {
            method: "getblockchaininfo".into(),
            auth: true,
        },
        startup_timeout: None,
        release: Release {
            version: "29.2".into(),
            archive: ArchiveKind::TarGz {
                member: Some("bitcoin-{version}/bin/bitcoind".into()),
            },
            url_template:
                "https://bitcoincore.org/bin/bitcoin-core-{version}/bitcoin-{version}-{target}.tar.gz"
                    .into(),
            targets: BTreeMap::from([
                (
                    "darwin-arm64".into(),
                    target(
                        "arm64-apple-darwin",
                        "bd07450f76d149d094842feab58e6240673120c8a317a1c51d45ba30c34e85ef",
                    ),
                ),
                (
                    "darwin-x86_64".into(),
                    target(
                        "x86_64-apple-darwin",
                        "69ca05fbe838123091cf4d6d2675352f36cf55f49e2e6fb3b52fcf32b5e8dd9f",
                    ),
                ),
                (
                    "linux-x86_64".into(),
                    target(
                        "x86_64-linux-gnu",
                        "1fd58d0ae94b8a9e21bbaeab7d53395a44976e82bd5492b0a894826c135f9009",
                    ),
                ),
                (
                    "linux-arm64".into(),
                    target(
                        "aarch64-linux-gnu",
                        "f88f72a3c5bf526581aae573be8c1f62133eaecfe3d34646c9ffca7b79dfdc7a",
                    ),
                ),
            ]),
            size_bytes: Some(45_000_000),
        },
    };

    let metashrew = ServiceDefinition {
        id: "metashrew".into(),
        display_name: "Metashrew".into(),
        kind: ServiceKind::Metashrew,
        dependencies: vec!["bitcoind".into()],
        executable: "rockshrew-mono".into(),
        interpreter: None,
        health: HealthCheck::JsonRpc {
            method: "metashrew_height".into(),
            auth: false,
        },
        startup_timeout: Some("120s".into()),
        release: Release {
            version: "9.0.2-alpha.1".into(),
            archive: ArchiveKind::TarGz { member: None },
            url_template: format!("{ISOMER_RELEASE_BASE}/rockshrew-mono-{{os}}-{{arch}}.tar.gz"),
            targets: ["darwin-arm64", "darwin-x86_64", "linux-x86_64", "linux-arm64"]
                .into_iter()
                .map(|key| (key.to_string(), target("", "")))
                .collect(),
            size_bytes: Some(25_000_000),
        },
    };

    let ord = ServiceDefinition {
        id: "ord".into(),
        display_name: "Ord".into(),
        kind: ServiceKind::Ord,
        dependencies: vec!["bitcoind".into()],
        executable: "ord".into(),
        interpreter: None,
        health: HealthCheck::Http {
            path: "/status".into(),
            accept: Vec::new(),
        },
        startup_timeout: None,
        release: Release {
            version: "0.22.1".into(),
            archive: ArchiveKind::TarGz {
                member: Some("ord".into()),
            },
            url_template:
                "https://github.com/ordinals/ord/releases/download/{version}/ord-{version}-{target}.tar.gz"
                    .into(),
            targets: BTreeMap::from([
                (
                    "darwin-arm64".into(),
                    target(
                        "aarch64-apple-darwin",
                        "f4a6c9e1bdbc00b0fb01e053078ce9577aa83495dbcd396e8c9df1ad66064037",
                    ),
                ),
                ("darwin-x86_64".into(), target("x86_64-apple-darwin", "")),
                (
                    "linux-x86_64".into(),
                    target("x86_64-unknown-linux-gnu", ""),
                ),
            ]),
            size_bytes: Some(15_000_000),
        },
    };

    let esplora = ServiceDefinition {
        id: "esplora".into(),
        display_name: "Esplora".into(),
        kind: ServiceKind::Esplora,
        dependencies: vec!["bitcoind".into()],
        executable: "flextrs".into(),
        interpreter: None,
        health: HealthCheck::Http {
            path: "/blocks/tip/height".into(),
            accept: Vec::new(),
        },
        startup_timeout: None,
        release: Release {
            version: "0.4.1".into(),
            archive: ArchiveKind::Raw,
            url_template: format!("{ISOMER_RELEASE_BASE}/flextrs-{{os}}-{{arch}}"),
            targets: BTreeMap::from([
                (
                    "darwin-arm64".into(),
                    target(
                        "",
                        "ae38e7a5bc3b10b7b0fd74f84288ae2470972cb1f227029c8d9d54682119cafe",
                    ),
                ),
                ("darwin-x86_64".into(), target("", "")),
                ("linux-x86_64".into(), target("", "")),
                ("linux-arm64".into(), target("", "")),
            ]),
            size_bytes: Some(15_000_000),
        },
    };

    let jsonrpc = ServiceDefinition {
        id: "jsonrpc".into(),
        display_name: "Alkanes JSON-RPC".into(),
        kind: ServiceKind::Gateway,
        dependencies: vec![
            "bitcoind".into(),
            "metashrew".into(),
            "ord".into(),
            "esplora".into(),
        ],
        executable: "jsonrpc/bin/jsonrpc.js".into(),
        interpreter: Some("node".into()),
        health: HealthCheck::Http {
            path: "/".into(),
            accept: vec![200, 404, 405],
        },
        startup_timeout: None,
        release: Release {
            version: "0.1.0".into(),
            archive: ArchiveKind::TarGz { member: None },
            url_template: format!("{ISOMER_RELEASE_BASE}/alkanes-jsonrpc-bundle.tar.gz"),
            targets: BTreeMap::from([(
                "any".into(),
                target(
                    "",
                    "bedc8928c7c48eb45ab51f9094b06a732ee7542e091cf4e75fd902e8aea84a55",
                ),
            )]),
            size_bytes: Some(10_000_000),
        },
    };

    vec![bitcoind, metashrew, ord, esplora, jsonrpc]
}
