//! Newline-delimited JSON control protocol between CLI invocations and the supervisor.
use serde::{Deserialize, Serialize};
use std::{
    io::{self, BufRead, BufReader, Write},
    net::TcpStream,
};
use thiserror::Error;

use crate::controller::ListedProcess;

/// Message sent from CLI invocations to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    Start { extension: String, args: Vec<String> },
    Kill { extension: String },
    List,
}

impl ControlCommand {
    /// Start request for `extension`; an empty `args` launches `<binary> <extension>`.
    pub fn start(extension: impl Into<String>, args: Vec<String>) -> Self {
        let extension = extension.into();
        let args = if args.is_empty() {
            vec![extension.clone()]
        } else {
            args
        };
        ControlCommand::Start { extension, args }
    }
}

/// Response sent by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Operation status code; 0 means success.
    Status(i32),
    Listing(Vec<ListedProcess>),
    Error(String),
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control connection I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("supervisor reported error: {0}")]
    Server(String),
    #[error("supervisor not reachable at {0}")]
    NotAvailable(String),
}

/// Sends a command to the supervisor at `address` and waits for a response.
pub fn send_command(
    address: &str,
    command: &ControlCommand,
) -> Result<ControlResponse, ControlError> {
    let mut stream = TcpStream::connect(address).map_err(|err| match err.kind() {
        io::ErrorKind::ConnectionRefused => ControlError::NotAvailable(address.to_string()),
        _ => ControlError::Io(err),
    })?;

    write_message(&mut stream, command)?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    if response_line.trim().is_empty() {
        return Err(ControlError::NotAvailable(address.to_string()));
    }

    let response: ControlResponse = serde_json::from_str(response_line.trim())?;
    if let ControlResponse::Error(message) = &response {
        return Err(ControlError::Server(message.clone()));
    }

    Ok(response)
}

/// Reads a command from an accepted connection. Used by the supervisor's handlers.
pub fn read_command(stream: &mut TcpStream) -> Result<ControlCommand, ControlError> {
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

/// Writes a response to the connected CLI client.
pub fn write_response(
    stream: &mut TcpStream,
    response: &ControlResponse,
) -> Result<(), ControlError> {
    write_message(stream, response)
}

fn write_message<T: Serialize>(stream: &mut TcpStream, message: &T) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(message)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
