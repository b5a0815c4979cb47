//! Serves the control socket for a running engine.
use std::{
    fs, io,
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
    binaries::DownloadEvent,
    engine::Engine,
    error::EngineError,
    ipc::{self, ControlCommand, ControlError, ControlResponse},
};

const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Executes one control command against the engine.
pub fn handle_command(
    engine: &Engine,
    command: ControlCommand,
) -> Result<ControlResponse, EngineError> {
    match command {
        ControlCommand::Status => Ok(ControlResponse::Status(engine.get_status()?)),
        ControlCommand::Logs { service, limit } => Ok(ControlResponse::Logs(
            engine.get_logs(service.as_deref(), limit)?,
        )),
        ControlCommand::ClearLogs => {
            engine.clear_logs();
            Ok(ControlResponse::Ok)
        }
        ControlCommand::Health { service } => Ok(ControlResponse::Healthy(
            engine.check_service_health(&service)?,
        )),
        ControlCommand::Mine { count, address } => Ok(ControlResponse::Height(
            engine.mine_blocks(count, address.as_deref())?,
        )),
        ControlCommand::Faucet { address, amount } => {
            Ok(ControlResponse::Txid(engine.faucet(&address, amount)?))
        }
        ControlCommand::Reset => {
            engine.reset_chain()?;
            Ok(ControlResponse::Message(
                "Chain reset; run `isomer up` again to restart services".into(),
            ))
        }
        ControlCommand::Download { service: None } => {
            Ok(ControlResponse::Binaries(engine.download_binaries()?))
        }
        ControlCommand::Download {
            service: Some(service),
        } => {
            for event in engine.download(&service)? {
                if let DownloadEvent::Failed(reason) = event {
                    return Ok(ControlResponse::Error(format!(
                        "download of '{service}' failed: {reason}"
                    )));
                }
            }
            Ok(ControlResponse::Binaries(engine.check_binaries()?))
        }
        ControlCommand::GetSettings => Ok(ControlResponse::Settings((*engine.settings()).clone())),
        ControlCommand::UpdateSettings(settings) => {
            engine.update_settings(settings)?;
            Ok(ControlResponse::Message(format!(
                "Settings saved to {}",
                engine.settings_path().display()
            )))
        }
        ControlCommand::Shutdown => {
            engine.stop_services()?;
            Ok(ControlResponse::Message("Engine shutting down".into()))
        }
    }
}

/// Unix socket listener bound to the engine's control path.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Binds `path`, replacing a stale socket file.
    pub fn bind(path: &Path) -> Result<Self, ControlError> {
        if path.exists() {
            if UnixStream::connect(path).is_ok() {
                return Err(ControlError::Server(format!(
                    "another engine is serving {}",
                    path.display()
                )));
            }
            fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts commands until `stop` is set or a `Shutdown` command arrives.
    pub fn serve(&self, engine: &Engine, stop: &AtomicBool) -> Result<(), ControlError> {
        info!("isomer listening on {}", self.path.display());

        while !stop.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if self.handle_connection(engine, stream) {
                        stop.store(true, Ordering::SeqCst);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("Control listener error: {err}");
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Returns true when the client asked for shutdown.
    fn handle_connection(&self, engine: &Engine, mut stream: UnixStream) -> bool {
        if let Err(err) = stream.set_nonblocking(false) {
            warn!("Unable to configure control connection: {err}");
            return false;
        }

        match ipc::read_command(&mut stream) {
            Ok(command) => {
                debug!("Control command: {command:?}");
                let should_shutdown = matches!(command, ControlCommand::Shutdown);
                let response = match handle_command(engine, command) {
                    Ok(response) => response,
                    Err(err) => {
                        error!("Control command failed: {err}");
                        ControlResponse::Error(err.to_string())
                    }
                };
                let _ = ipc::write_response(&mut stream, &response);
                should_shutdown
            }
            Err(err) => {
                warn!("Invalid control command: {err}");
                let _ = ipc::write_response(&mut stream, &ControlResponse::Error(err.to_string()));
                false
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
