//! Control socket protocol between CLI invocations and a running `isomer up`.
use serde::{Deserialize, Serialize};
use std::{
    io::{self, BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::Path,
    time::Duration,
};
use thiserror::Error;

use crate::{binaries::BinaryRecord, config::Settings, logs::LogLine, state::SystemStatus};

/// How long a client waits for the engine to answer. Mining and resets can
/// take a while on a busy machine.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);

/// Message sent from CLI invocations to the running engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlCommand {
    Status,
    Logs {
        service: Option<String>,
        limit: Option<usize>,
    },
    ClearLogs,
    Health {
        service: String,
    },
    Mine {
        count: u32,
        address: Option<String>,
    },
    Faucet {
        address: String,
        amount: f64,
    },
    Reset,
    /// Installs one service, or every missing one, and waits for completion.
    Download {
        service: Option<String>,
    },
    GetSettings,
    /// Validates and saves new settings; refused unless everything is stopped.
    UpdateSettings(Settings),
    /// Stops every service and ends the serving process.
    Shutdown,
}

/// Response sent by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlResponse {
    Ok,
    Message(String),
    Status(SystemStatus),
    Logs(Vec<LogLine>),
    Height(u64),
    Txid(String),
    Healthy(bool),
    Binaries(Vec<BinaryRecord>),
    Settings(Settings),
    Error(String),
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("engine reported error: {0}")]
    Server(String),
    #[error("control socket not available; is `isomer up` running?")]
    NotAvailable,
}

/// Sends a command to the engine and waits for its response.
pub fn send_command(
    socket: &Path,
    command: &ControlCommand,
) -> Result<ControlResponse, ControlError> {
    if !socket.exists() {
        return Err(ControlError::NotAvailable);
    }

    let mut stream = match UnixStream::connect(socket) {
        Ok(stream) => stream,
        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
            return Err(ControlError::NotAvailable);
        }
        Err(err) => return Err(err.into()),
    };
    stream.set_read_timeout(Some(RESPONSE_TIMEOUT))?;
    write_line(&mut stream, command)?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    if response_line.trim().is_empty() {
        return Err(ControlError::NotAvailable);
    }

    let response: ControlResponse = serde_json::from_str(response_line.trim())?;
    if let ControlResponse::Error(message) = &response {
        return Err(ControlError::Server(message.clone()));
    }

    Ok(response)
}

/// Reads one command from a connected client.
pub fn read_command(stream: &mut UnixStream) -> Result<ControlCommand, ControlError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    if line.trim().is_empty() {
        return Err(ControlError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty control command",
        )));
    }

    Ok(serde_json::from_str(line.trim())?)
}

/// Writes a response to the connected client.
pub fn write_response(
    stream: &mut UnixStream,
    response: &ControlResponse,
) -> Result<(), ControlError> {
    write_line(stream, response)
}

fn write_line<T: Serialize>(stream: &mut UnixStream, message: &T) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(message)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
