//! Control-operation server exposing a [`Controller`] over the TCP control protocol.
use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        mpsc::{self, Receiver},
    },
    thread,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    controller::{Controller, StartOutcome},
    error::ControllerError,
    ipc::{self, ControlCommand, ControlResponse},
    process::ProcessEntry,
};

/// Errors emitted by the resident control service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to bind control endpoint {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error("failed to install termination handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Long-lived server that owns the Controller and answers control commands.
pub struct Service {
    controller: Arc<Controller>,
    listener: TcpListener,
}

impl Service {
    /// Binds the control endpoint. A bind failure is fatal for the supervisor.
    pub fn bind(address: &str, controller: Controller) -> Result<Self, ServiceError> {
        let listener = TcpListener::bind(address).map_err(|source| ServiceError::Bind {
            address: address.to_string(),
            source,
        })?;

        Ok(Self {
            controller: Arc::new(controller),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServiceError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until SIGINT, SIGTERM or SIGHUP arrives, then shuts the Controller down.
    pub fn run(self) -> Result<(), ServiceError> {
        let (halt, halted) = mpsc::channel();
        ctrlc::set_handler(move || {
            let _ = halt.send(());
        })?;
        self.serve_until(halted)
    }

    /// Serves until `halt` yields (or its sender is dropped), then shuts the Controller down.
    pub fn serve_until(self, halt: Receiver<()>) -> Result<(), ServiceError> {
        let address = self.local_addr()?;
        info!("pman listening on {address}");

        let controller = Arc::clone(&self.controller);
        let listener = self.listener;
        thread::spawn(move || accept_loop(listener, controller));

        let _ = halt.recv();
        info!("Termination requested; stopping all extensions...");

        let (done, completed) = mpsc::channel();
        let result = self.controller.shutdown(done);
        let _ = completed.recv();

        match &result {
            Ok(()) => info!("Shutdown complete"),
            Err(err) => error!("Shutdown finished with errors: {err}"),
        }
        result.map_err(ServiceError::from)
    }
}

fn accept_loop(listener: TcpListener, controller: Arc<Controller>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let controller = Arc::clone(&controller);
                thread::spawn(move || serve_connection(stream, &controller));
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => warn!("Control listener accept failed: {err}"),
        }
    }
}

fn serve_connection(mut stream: TcpStream, controller: &Controller) {
    let response = match ipc::read_command(&mut stream) {
        Ok(command) => {
            debug!("Received control command: {command:?}");
            handle(controller, command)
        }
        Err(err) => {
            warn!("Invalid control command: {err}");
            ControlResponse::Error(err.to_string())
        }
    };

    if let Err(err) = ipc::write_response(&mut stream, &response) {
        warn!("Failed to answer control client: {err}");
    }
}

/// Maps one control command onto the Controller.
pub fn handle(controller: &Controller, command: ControlCommand) -> ControlResponse {
    match command {
        ControlCommand::Start { extension, args } => {
            match controller.start(ProcessEntry::new(extension, args)) {
                Ok(StartOutcome::Started(_)) | Ok(StartOutcome::AlreadyRunning(_)) => {
                    ControlResponse::Status(0)
                }
                Err(err) => ControlResponse::Error(err.to_string()),
            }
        }
        ControlCommand::Kill { extension } => match controller.kill(&extension) {
            Ok(_) => ControlResponse::Status(0),
            Err(err) => ControlResponse::Error(err.to_string()),
        },
        ControlCommand::List => ControlResponse::Listing(controller.list()),
    }
}
