//! On-disk layout of an isomer data root.
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::error::Result;

/// Name of the directory created under the user's data directory.
const ROOT_DIR_NAME: &str = "isomer";

/// Directory layout for binaries, chain data, logs and engine state.
///
/// ```text
/// <root>/bin/<service>/      installed artifacts + receipt
/// <root>/data/<service>/     chain data and generated configuration
/// <root>/logs/               persistent per-service log files
/// <root>/tmp/                in-flight downloads and staging
/// <root>/state/              pids.json, engine.lock, control.sock,
///                             release-index.json
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLayout {
    root: PathBuf,
}

impl RuntimeLayout {
    /// Layout rooted at an explicit directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout rooted at `$HOME/.local/share/isomer`.
    pub fn user_default() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::from_user_home(&home)
    }

    fn from_user_home(home: &Path) -> Self {
        Self::new(home.join(".local/share").join(ROOT_DIR_NAME))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parent of all per-service install directories.
    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    /// Install directory of a single service.
    pub fn install_dir(&self, service: &str) -> PathBuf {
        self.bin_dir().join(service)
    }

    /// Parent of all per-service data directories.
    pub fn data_root(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Data directory of a single service.
    pub fn data_dir(&self, service: &str) -> PathBuf {
        self.data_root().join(service)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Persistent log file for one stream of a service.
    pub fn log_file(&self, service: &str, stream: &str) -> PathBuf {
        self.log_dir().join(format!("{service}_{stream}.log"))
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    /// PID ledger used for orphan reaping.
    pub fn pid_file(&self) -> PathBuf {
        self.state_dir().join("pids.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir().join("engine.lock")
    }

    pub fn control_socket(&self) -> PathBuf {
        self.state_dir().join("control.sock")
    }

    /// Last release index fetched from the network.
    pub fn release_index_file(&self) -> PathBuf {
        self.state_dir().join("release-index.json")
    }

    /// Default settings file location.
    pub fn settings_file(&self) -> PathBuf {
        self.root.join("isomer.yaml")
    }

    /// Creates every top-level directory of the layout.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.bin_dir(),
            self.data_root(),
            self.log_dir(),
            self.tmp_dir(),
            self.state_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
