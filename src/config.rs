//! Configuration management for isomer.
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use rand::{Rng, distributions::Alphanumeric};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::{EngineError, Result},
    manifest::DEFAULT_RELEASE_INDEX_URL,
};

/// Central settings object every generated service configuration derives from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Overrides the data root when no `--root` flag is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_root: Option<PathBuf>,
    /// Interface every service binds to and every peer address points at.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub ports: PortConfig,
    #[serde(default)]
    pub bitcoind: BitcoindSettings,
    #[serde(default)]
    pub mining: MiningSettings,
    #[serde(default)]
    pub supervision: SupervisionSettings,
    /// Remote checksums document used for update checks and downloads.
    /// Set to `null` to rely on the hashes compiled into the manifest.
    #[serde(default = "default_release_index_url")]
    pub release_index_url: Option<String>,
}

/// Port table for the built-in services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub bitcoind_rpc: u16,
    pub bitcoind_p2p: u16,
    pub metashrew: u16,
    pub ord: u16,
    pub esplora_http: u16,
    pub electrum: u16,
    pub jsonrpc: u16,
}

/// Chain daemon credentials and wallet parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitcoindSettings {
    pub rpc_user: String,
    pub rpc_password: String,
    pub fallback_fee: f64,
    /// Wallet used for mining rewards and faucet payouts.
    pub wallet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningSettings {
    /// Blocks mined after startup until the chain reaches this height.
    pub initial_blocks: u64,
    pub max_blocks_per_call: u32,
}

/// Supervision knobs, durations written as `<n>[ms|s|m|h]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisionSettings {
    pub startup_timeout: String,
    pub stop_grace_period: String,
    pub health_interval: String,
    pub probe_timeout: String,
    pub unhealthy_threshold: u32,
    pub log_capacity: usize,
}

/// Parsed form of [`SupervisionSettings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub startup_timeout: Duration,
    pub stop_grace_period: Duration,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub unhealthy_threshold: u32,
    pub log_capacity: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_release_index_url() -> Option<String> {
    Some(DEFAULT_RELEASE_INDEX_URL.to_string())
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_root: None,
            host: default_host(),
            ports: PortConfig::default(),
            bitcoind: BitcoindSettings::default(),
            mining: MiningSettings::default(),
            supervision: SupervisionSettings::default(),
            release_index_url: default_release_index_url(),
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            bitcoind_rpc: 18443,
            bitcoind_p2p: 18444,
            metashrew: 8080,
            ord: 8090,
            esplora_http: 50010,
            electrum: 50001,
            jsonrpc: 18888,
        }
    }
}

impl PortConfig {
    /// Every named port in the table.
    pub fn entries(&self) -> [(&'static str, u16); 7] {
        [
            ("bitcoind_rpc", self.bitcoind_rpc),
            ("bitcoind_p2p", self.bitcoind_p2p),
            ("metashrew", self.metashrew),
            ("ord", self.ord),
            ("esplora_http", self.esplora_http),
            ("electrum", self.electrum),
            ("jsonrpc", self.jsonrpc),
        ]
    }
}

impl Default for BitcoindSettings {
    fn default() -> Self {
        Self {
            rpc_user: "isomer".to_string(),
            rpc_password: "isomer".to_string(),
            fallback_fee: 0.00001,
            wallet: "dev".to_string(),
        }
    }
}

impl Default for MiningSettings {
    fn default() -> Self {
        Self {
            initial_blocks: 101,
            max_blocks_per_call: 1000,
        }
    }
}

impl Default for SupervisionSettings {
    fn default() -> Self {
        Self {
            startup_timeout: "60s".to_string(),
            stop_grace_period: "10s".to_string(),
            health_interval: "2s".to_string(),
            probe_timeout: "2s".to_string(),
            unhealthy_threshold: 3,
            log_capacity: 5000,
        }
    }
}

impl SupervisionSettings {
    pub fn timings(&self) -> Result<Timings> {
        Ok(Timings {
            startup_timeout: parse_duration(&self.startup_timeout)?,
            stop_grace_period: parse_duration(&self.stop_grace_period)?,
            health_interval: parse_duration(&self.health_interval)?,
            probe_timeout: parse_duration(&self.probe_timeout)?,
            unhealthy_threshold: self.unhealthy_threshold.max(1),
            log_capacity: self.log_capacity,
        })
    }
}

impl Settings {
    /// Parses settings from YAML text after expanding `${VAR}` references.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content)?;
        let settings: Settings = serde_yaml::from_str(&expanded)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads the settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::Io(std::io::Error::new(
                e.kind(),
                format!("{} ({})", e, path.display()),
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Loads the settings file, creating it with fresh RPC credentials on first run.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if path.exists() {
            debug!("Loading settings from {}", path.display());
            return Self::load(path);
        }

        let mut settings = Settings::default();
        settings.bitcoind.rpc_password = generate_password();
        settings.save(path)?;
        info!("Wrote initial settings to {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Rejects settings that parsed but cannot produce a working stack.
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashMap<u16, &str> = HashMap::new();
        for (name, port) in self.ports.entries() {
            if port == 0 {
                return Err(EngineError::ConfigInvalid(format!(
                    "port '{name}' must be non-zero"
                )));
            }
            if let Some(previous) = seen.insert(port, name) {
                return Err(EngineError::ConfigInvalid(format!(
                    "port {port} is assigned to both '{previous}' and '{name}'"
                )));
            }
        }

        if self.bitcoind.rpc_user.is_empty() || self.bitcoind.rpc_password.is_empty() {
            return Err(EngineError::ConfigInvalid(
                "bitcoind RPC credentials must not be empty".into(),
            ));
        }
        if self.bitcoind.wallet.is_empty() {
            return Err(EngineError::ConfigInvalid(
                "wallet name must not be empty".into(),
            ));
        }
        if self.mining.max_blocks_per_call == 0 {
            return Err(EngineError::ConfigInvalid(
                "max_blocks_per_call must be at least 1".into(),
            ));
        }
        if self.supervision.log_capacity == 0 {
            return Err(EngineError::ConfigInvalid(
                "log_capacity must be at least 1".into(),
            ));
        }

        self.supervision.timings()?;
        Ok(())
    }

    /// Base URL of the chain daemon's RPC endpoint.
    pub fn rpc_url(&self) -> String {
        format!("http://{}:{}", self.host, self.ports.bitcoind_rpc)
    }
}

/// Parses `<n>`, `<n>ms`, `<n>s`, `<n>m` or `<n>h`; a bare number is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(EngineError::ConfigInvalid(
            "Duration value cannot be empty".into(),
        ));
    }

    let invalid = || EngineError::ConfigInvalid(format!("Invalid duration value: '{raw}'"));

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

/// Expands `${VAR}` references; a missing variable is a configuration error.
fn expand_env_vars(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(EngineError::ConfigInvalid(format!(
            "Missing environment variable: {var_name}"
        ))),
        None => Ok(result.into_owned()),
    }
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}
