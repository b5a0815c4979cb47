use std::{
    error::Error,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use isomer::{
    binaries::{BinaryManager, BinaryRecord, BinaryStatus, DownloadEvent, HttpFetcher},
    cli::{BinariesCommand, Cli, Commands, ConfigCommand, parse_args},
    config::Settings,
    engine::{Engine, EngineBuilder},
    ipc::{self, ControlCommand, ControlError, ControlResponse},
    manifest::Manifest,
    runtime::RuntimeLayout,
    server::ControlServer,
    state::SystemStatus,
};

fn main() {
    let args = parse_args();
    init_logging(&args);

    if let Err(err) = run(args) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(args: Cli) -> Result<(), Box<dyn Error>> {
    let context = Context::resolve(&args)?;

    match args.command {
        Commands::Up => run_up(context)?,
        Commands::Down => match context.send(ControlCommand::Shutdown) {
            Ok(response) => print_response(response),
            Err(ControlError::NotAvailable) => {
                warn!("No running isomer engine found; nothing to stop");
            }
            Err(err) => return Err(err.into()),
        },
        Commands::Status { json } => match context.send(ControlCommand::Status) {
            Ok(ControlResponse::Status(status)) => print_status(&status, json)?,
            Ok(other) => print_response(other),
            Err(ControlError::NotAvailable) => {
                println!("isomer engine is not running");
                let records = context.binaries()?.check_all()?;
                print_binaries(&records, json)?;
            }
            Err(err) => return Err(err.into()),
        },
        Commands::Logs { service, limit } => {
            print_response(context.send(ControlCommand::Logs { service, limit })?)
        }
        Commands::ClearLogs => print_response(context.send(ControlCommand::ClearLogs)?),
        Commands::Reset { yes } => {
            if !yes {
                return Err("refusing to wipe chain data without --yes".into());
            }
            match context.send(ControlCommand::Reset) {
                Ok(response) => print_response(response),
                Err(ControlError::NotAvailable) => {
                    let engine = context.engine()?;
                    engine.reset_chain()?;
                    println!("Chain data reset");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Commands::Mine { count, address } => {
            print_response(context.send(ControlCommand::Mine { count, address })?)
        }
        Commands::Faucet { address, amount } => {
            print_response(context.send(ControlCommand::Faucet { address, amount })?)
        }
        Commands::Health { service } => {
            print_response(context.send(ControlCommand::Health { service })?)
        }
        Commands::Binaries { action } => match action {
            BinariesCommand::Check { json } => {
                let manager = context.binaries()?;
                let records = match &context.settings.release_index_url {
                    Some(url) => match manager.fetch_index(url) {
                        Ok(index) => manager.check_all_with_index(&index)?,
                        Err(err) => {
                            warn!("Release index unavailable, checking offline: {err}");
                            manager.check_all()?
                        }
                    },
                    None => manager.check_all()?,
                };
                print_binaries(&records, json)?;
            }
            BinariesCommand::Download { service } => {
                match context.send(ControlCommand::Download {
                    service: service.clone(),
                }) {
                    Ok(ControlResponse::Binaries(records)) => print_binaries(&records, false)?,
                    Ok(ControlResponse::Error(message)) => return Err(message.into()),
                    Ok(other) => print_response(other),
                    Err(ControlError::NotAvailable) => download(&context.engine()?, service)?,
                    Err(err) => return Err(err.into()),
                }
            }
        },
        Commands::Config { action } => match action {
            ConfigCommand::Show { json } => {
                let settings = match context.send(ControlCommand::GetSettings) {
                    Ok(ControlResponse::Settings(settings)) => settings,
                    Ok(other) => {
                        print_response(other);
                        return Ok(());
                    }
                    Err(ControlError::NotAvailable) => context.settings.clone(),
                    Err(err) => return Err(err.into()),
                };
                if json {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                } else {
                    print!("{}", serde_yaml::to_string(&settings)?);
                }
            }
            ConfigCommand::Apply { file } => {
                let settings = Settings::load(&file)?;
                match context.send(ControlCommand::UpdateSettings(settings.clone())) {
                    Ok(ControlResponse::Error(message)) => return Err(message.into()),
                    Ok(response) => print_response(response),
                    Err(ControlError::NotAvailable) => {
                        let engine = context.engine()?;
                        engine.update_settings(settings)?;
                        println!("Settings saved to {}", engine.settings_path().display());
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        },
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Resolved settings, manifest and data root for one invocation.
struct Context {
    settings: Settings,
    settings_path: PathBuf,
    manifest: Manifest,
    layout: RuntimeLayout,
}

impl Context {
    fn resolve(args: &Cli) -> Result<Self, Box<dyn Error>> {
        let default_layout = match &args.root {
            Some(root) => RuntimeLayout::new(root),
            None => RuntimeLayout::user_default(),
        };
        let settings_path: PathBuf = args
            .config
            .clone()
            .unwrap_or_else(|| default_layout.settings_file());
        let settings = Settings::load_or_init(&settings_path)?;

        let layout = match (&args.root, &settings.data_root) {
            (None, Some(data_root)) => RuntimeLayout::new(data_root),
            _ => default_layout,
        };
        let manifest = match &args.manifest {
            Some(path) => Manifest::load(path)?,
            None => Manifest::builtin()?,
        };

        Ok(Self {
            settings,
            settings_path,
            manifest,
            layout,
        })
    }

    fn send(&self, command: ControlCommand) -> Result<ControlResponse, ControlError> {
        ipc::send_command(&self.layout.control_socket(), &command)
    }

    fn engine(&self) -> Result<Engine, Box<dyn Error>> {
        Ok(EngineBuilder::new(
            self.settings.clone(),
            self.manifest.clone(),
            self.layout.clone(),
        )
        .settings_path(&self.settings_path)
        .build()?)
    }

    fn binaries(&self) -> Result<BinaryManager, Box<dyn Error>> {
        self.layout.ensure()?;
        Ok(BinaryManager::new(
            self.layout.clone(),
            Arc::new(self.manifest.clone()),
            Arc::new(HttpFetcher::new()?),
        ))
    }
}

fn run_up(context: Context) -> Result<(), Box<dyn Error>> {
    let engine = context.engine()?;
    let server = ControlServer::bind(&context.layout.control_socket())?;

    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        eprintln!("isomer is shutting down...");
        handler_flag.store(true, Ordering::SeqCst);
    })?;

    if let Err(err) = engine.start_services() {
        error!("Failed to start services: {err}");
        engine.shutdown();
        return Err(err.into());
    }
    info!("Stack is up; press Ctrl-C or run `isomer down` to stop");

    let served = server.serve(&engine, &stop);
    engine.shutdown();
    drop(server);
    served?;
    Ok(())
}

fn download(engine: &Engine, service: Option<String>) -> Result<(), Box<dyn Error>> {
    let targets: Vec<String> = match service {
        Some(service) => vec![service],
        None => engine
            .check_binaries()?
            .into_iter()
            .filter(|record| !matches!(record.status, BinaryStatus::Installed { .. }))
            .map(|record| record.service)
            .collect(),
    };
    if targets.is_empty() {
        println!("All binaries installed");
        return Ok(());
    }

    let mut failed = Vec::new();
    let mut receivers = Vec::with_capacity(targets.len());
    for service in targets {
        match engine.download(&service) {
            Ok(rx) => receivers.push((service, rx)),
            Err(err) => {
                println!("{service}: {err}");
                failed.push(service);
            }
        }
    }

    for (service, rx) in receivers {
        let mut last_percent = None;
        for event in rx {
            match event {
                DownloadEvent::Progress(progress) => {
                    let percent = (progress * 100.0).floor() as u32;
                    if last_percent != Some(percent) && percent % 10 == 0 {
                        println!("{service}: {percent}%");
                        last_percent = Some(percent);
                    }
                }
                DownloadEvent::Installed { version } => {
                    println!("{service}: installed {version}");
                }
                DownloadEvent::Failed(reason) => {
                    println!("{service}: failed: {reason}");
                    failed.push(service.clone());
                }
            }
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(format!("downloads failed: {}", failed.join(", ")).into())
    }
}

fn print_response(response: ControlResponse) {
    match response {
        ControlResponse::Ok => {}
        ControlResponse::Message(message) => println!("{message}"),
        ControlResponse::Status(status) => {
            let _ = print_status(&status, false);
        }
        ControlResponse::Logs(lines) => {
            for line in lines {
                println!(
                    "{} [{}:{}] {}",
                    line.timestamp.format("%H:%M:%S%.3f"),
                    line.service,
                    line.stream,
                    line.message
                );
            }
        }
        ControlResponse::Height(height) => println!("Block height: {height}"),
        ControlResponse::Txid(txid) => println!("{txid}"),
        ControlResponse::Healthy(healthy) => {
            println!("{}", if healthy { "healthy" } else { "unhealthy" })
        }
        ControlResponse::Binaries(records) => {
            let _ = print_binaries(&records, false);
        }
        ControlResponse::Settings(settings) => match serde_yaml::to_string(&settings) {
            Ok(yaml) => print!("{yaml}"),
            Err(err) => eprintln!("{err}"),
        },
        ControlResponse::Error(message) => eprintln!("{message}"),
    }
}

fn print_status(status: &SystemStatus, json: bool) -> Result<(), Box<dyn Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }

    println!(
        "{:<12} {:<24} {:<8} {:<7} {:<8} {:<10} {}",
        "SERVICE", "STATE", "HEALTHY", "PORT", "PID", "UPTIME", "VERSION"
    );
    for service in &status.services {
        let state = match &service.last_error {
            Some(reason) if !service.state.is_running() => format!("{} ({reason})", service.state),
            _ => service.state.to_string(),
        };
        println!(
            "{:<12} {:<24} {:<8} {:<7} {:<8} {:<10} {}",
            service.id,
            state,
            if service.healthy { "yes" } else { "no" },
            service.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            service.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            service
                .uptime_secs
                .map(|s| format!("{s}s"))
                .unwrap_or_else(|| "-".into()),
            service.version.as_deref().unwrap_or("-"),
        );
    }
    if let Some(height) = status.block_height {
        println!("Block height: {height}");
    }
    if let Some(mempool) = status.mempool_size {
        println!("Mempool: {mempool} tx");
    }
    println!("Ready: {}", if status.is_ready { "yes" } else { "no" });
    Ok(())
}

fn print_binaries(records: &[BinaryRecord], json: bool) -> Result<(), Box<dyn Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }

    for record in records {
        let status = match &record.status {
            BinaryStatus::NotInstalled if !record.checksum_published => {
                "not installed (no published sha256; set release_index_url)".to_string()
            }
            BinaryStatus::NotInstalled => "not installed".to_string(),
            BinaryStatus::Downloading { progress } => {
                format!("downloading ({:.0}%)", progress * 100.0)
            }
            BinaryStatus::Installed { version } => format!("installed {version}"),
            BinaryStatus::UpdateAvailable { current, latest } => {
                format!("update available ({current} -> {latest})")
            }
        };
        println!("{:<12} {status}", record.service);
    }
    Ok(())
}
