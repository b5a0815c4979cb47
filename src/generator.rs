//! Per-service launch configuration derived from [`Settings`].
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::Settings,
    error::{EngineError, Result},
    manifest::{Manifest, ServiceDefinition, ServiceKind},
    runtime::RuntimeLayout,
};

/// Launch snapshot written into each service data directory.
pub const LAUNCH_SNAPSHOT: &str = "launch.json";

/// Configuration file written before a service is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Everything needed to spawn one service process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub service: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub data_dir: PathBuf,
    pub config_file: Option<ConfigFile>,
}

/// Builds the launch spec for `definition`. Touches nothing on disk.
pub fn render(
    settings: &Settings,
    layout: &RuntimeLayout,
    manifest: &Manifest,
    definition: &ServiceDefinition,
) -> Result<LaunchSpec> {
    let install_dir = layout.install_dir(&definition.id);
    let data_dir = layout.data_dir(&definition.id);
    let executable = install_dir.join(&definition.executable);

    let mut env = BTreeMap::new();
    let mut config_file = None;
    let host = settings.host.as_str();
    let btc = &settings.bitcoind;
    let auth = format!("{}:{}", btc.rpc_user, btc.rpc_password);

    let args: Vec<String> = match &definition.kind {
        ServiceKind::ChainDaemon => {
            let conf_path = data_dir.join("bitcoin.conf");
            config_file = Some(ConfigFile {
                path: conf_path.clone(),
                contents: bitcoin_conf(settings),
            });
            vec![
                format!("-datadir={}", data_dir.display()),
                format!("-conf={}", conf_path.display()),
                "-printtoconsole".to_string(),
            ]
        }
        ServiceKind::Metashrew => {
            let chain = required_dependency(manifest, definition, &ServiceKind::ChainDaemon)?;
            vec![
                "--host".into(),
                host.into(),
                "--port".into(),
                settings.ports.metashrew.to_string(),
                "--indexer".into(),
                install_dir.join("alkanes.wasm").display().to_string(),
                "--db-path".into(),
                data_dir.display().to_string(),
                "--auth".into(),
                auth,
                "--daemon-rpc-url".into(),
                format!("http://{host}:{}", rpc_port(settings, chain)?),
            ]
        }
        ServiceKind::Ord => {
            let chain = required_dependency(manifest, definition, &ServiceKind::ChainDaemon)?;
            vec![
                "--data-dir".into(),
                data_dir.display().to_string(),
                "--index-transactions".into(),
                "--index-addresses".into(),
                "--index-sats".into(),
                "--index-runes".into(),
                "--chain".into(),
                "regtest".into(),
                "--bitcoin-rpc-url".into(),
                format!("{host}:{}", rpc_port(settings, chain)?),
                "--bitcoin-rpc-username".into(),
                btc.rpc_user.clone(),
                "--bitcoin-rpc-password".into(),
                btc.rpc_password.clone(),
                "--bitcoin-data-dir".into(),
                layout.data_dir(&chain.id).display().to_string(),
                "server".into(),
                "--http-port".into(),
                settings.ports.ord.to_string(),
            ]
        }
        ServiceKind::Esplora => {
            let chain = required_dependency(manifest, definition, &ServiceKind::ChainDaemon)?;
            vec![
                "-vvv".into(),
                "--db-dir".into(),
                data_dir.display().to_string(),
                "--daemon-dir".into(),
                layout.data_dir(&chain.id).display().to_string(),
                "--network".into(),
                "regtest".into(),
                "--daemon-rpc-addr".into(),
                format!("{host}:{}", rpc_port(settings, chain)?),
                "--http-addr".into(),
                format!("{host}:{}", settings.ports.esplora_http),
                "--electrum-rpc-addr".into(),
                format!("{host}:{}", settings.ports.electrum),
                "--auth".into(),
                auth,
            ]
        }
        ServiceKind::Gateway => {
            let chain = required_dependency(manifest, definition, &ServiceKind::ChainDaemon)?;
            let metashrew = required_dependency(manifest, definition, &ServiceKind::Metashrew)?;
            let ord = required_dependency(manifest, definition, &ServiceKind::Ord)?;
            let esplora = required_dependency(manifest, definition, &ServiceKind::Esplora)?;

            env.insert("HOST".into(), host.into());
            env.insert("PORT".into(), settings.ports.jsonrpc.to_string());
            env.insert(
                "DAEMON_RPC_ADDR".into(),
                format!("{host}:{}", rpc_port(settings, chain)?),
            );
            env.insert("RPCUSER".into(), btc.rpc_user.clone());
            env.insert("RPCPASSWORD".into(), btc.rpc_password.clone());
            env.insert(
                "METASHREW_URI".into(),
                format!("http://{host}:{}", rpc_port(settings, metashrew)?),
            );
            env.insert("ORD_HOST".into(), host.into());
            env.insert("ORD_PORT".into(), rpc_port(settings, ord)?.to_string());
            env.insert("ESPLORA_HOST".into(), host.into());
            env.insert(
                "ESPLORA_PORT".into(),
                rpc_port(settings, esplora)?.to_string(),
            );
            env.insert("RUST_LOG".into(), "info".into());
            Vec::new()
        }
        ServiceKind::Custom {
            args,
            env: custom_env,
            port,
        } => {
            let values = PlaceholderValues {
                data_dir: &data_dir,
                install_dir: &install_dir,
                port: *port,
                rpc_url: settings.rpc_url(),
                rpc_user: &btc.rpc_user,
                rpc_password: &btc.rpc_password,
            };
            for (key, value) in custom_env {
                env.insert(key.clone(), expand_placeholders(&definition.id, value, &values)?);
            }
            args.iter()
                .map(|arg| expand_placeholders(&definition.id, arg, &values))
                .collect::<Result<_>>()?
        }
    };

    let (program, args) = match &definition.interpreter {
        Some(interpreter) => {
            let mut full = vec![executable.display().to_string()];
            full.extend(args);
            (PathBuf::from(interpreter), full)
        }
        None => (executable, args),
    };

    Ok(LaunchSpec {
        service: definition.id.clone(),
        program,
        args,
        env,
        working_dir: data_dir.clone(),
        data_dir,
        config_file,
    })
}

/// Creates the data directory and writes the config file plus a launch snapshot.
pub fn write(spec: &LaunchSpec) -> Result<()> {
    fs::create_dir_all(&spec.data_dir)?;
    if let Some(config) = &spec.config_file {
        if let Some(parent) = config.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&config.path, &config.contents)?;
        debug!(
            "Wrote config for '{}' to {}",
            spec.service,
            config.path.display()
        );
    }
    fs::write(
        spec.data_dir.join(LAUNCH_SNAPSHOT),
        serde_json::to_string_pretty(spec)?,
    )?;
    Ok(())
}

/// Every port assignment across the manifest; duplicates are rejected.
pub fn assigned_ports(settings: &Settings, manifest: &Manifest) -> Result<Vec<(String, u16)>> {
    let mut assigned: Vec<(String, u16)> = Vec::new();
    for definition in manifest.services() {
        for port in definition.listen_ports(settings) {
            if let Some((owner, _)) = assigned.iter().find(|(_, p)| *p == port) {
                return Err(EngineError::ConfigInvalid(format!(
                    "port {port} is assigned to both '{owner}' and '{}'",
                    definition.id
                )));
            }
            assigned.push((definition.id.clone(), port));
        }
    }
    Ok(assigned)
}

fn bitcoin_conf(settings: &Settings) -> String {
    let btc = &settings.bitcoind;
    let ports = &settings.ports;
    format!(
        "regtest=1\n\
         server=1\n\
         txindex=1\n\
         fallbackfee={fee}\n\
         \n\
         [regtest]\n\
         rpcuser={user}\n\
         rpcpassword={password}\n\
         rpcbind={host}\n\
         rpcallowip={host}\n\
         rpcport={rpc}\n\
         port={p2p}\n",
        fee = btc.fallback_fee,
        user = btc.rpc_user,
        password = btc.rpc_password,
        host = settings.host,
        rpc = ports.bitcoind_rpc,
        p2p = ports.bitcoind_p2p,
    )
}

fn required_dependency<'a>(
    manifest: &'a Manifest,
    definition: &ServiceDefinition,
    kind: &ServiceKind,
) -> Result<&'a ServiceDefinition> {
    manifest
        .dependency_of_kind(definition, kind)
        .ok_or_else(|| {
            EngineError::ConfigInvalid(format!(
                "service '{}' requires a {} dependency",
                definition.id,
                kind.label()
            ))
        })
}

fn rpc_port(settings: &Settings, definition: &ServiceDefinition) -> Result<u16> {
    definition.primary_port(settings).ok_or_else(|| {
        EngineError::ConfigInvalid(format!("service '{}' has no port", definition.id))
    })
}

struct PlaceholderValues<'a> {
    data_dir: &'a Path,
    install_dir: &'a Path,
    port: Option<u16>,
    rpc_url: String,
    rpc_user: &'a str,
    rpc_password: &'a str,
}

fn expand_placeholders(
    service: &str,
    input: &str,
    values: &PlaceholderValues<'_>,
) -> Result<String> {
    let re = Regex::new(r"\{([A-Za-z_]+)\}")
        .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;

    let mut failure: Option<String> = None;
    let expanded = re.replace_all(input, |caps: &Captures| {
        let resolved = match &caps[1] {
            "data_dir" => Some(values.data_dir.display().to_string()),
            "install_dir" => Some(values.install_dir.display().to_string()),
            "port" => values.port.map(|p| p.to_string()),
            "rpc_url" => Some(values.rpc_url.clone()),
            "rpc_user" => Some(values.rpc_user.to_string()),
            "rpc_password" => Some(values.rpc_password.to_string()),
            _ => None,
        };
        resolved.unwrap_or_else(|| {
            failure.get_or_insert_with(|| caps[0].to_string());
            String::new()
        })
    });

    match failure {
        Some(placeholder) => Err(EngineError::ConfigInvalid(format!(
            "service '{service}' uses unresolvable placeholder {placeholder}"
        ))),
        None => Ok(expanded.into_owned()),
    }
}
