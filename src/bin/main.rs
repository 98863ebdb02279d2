use std::error::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pman::{
    cli::{Cli, Commands, parse_args},
    config::Config,
    controller::Controller,
    ipc::{self, ControlCommand, ControlResponse},
    service::Service,
    status,
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    let mut config = Config::load(args.config.as_deref())?;
    args.apply_to(&mut config)?;

    match args.command {
        Commands::Serve { .. } => serve(&config)?,
        Commands::Run { extension, args } => {
            send(&config, ControlCommand::start(extension.clone(), args))?;
            println!("Started extension '{extension}'");
        }
        Commands::Kill { extension } => {
            send(&config, ControlCommand::Kill {
                extension: extension.clone(),
            })?;
            println!("Killed extension '{extension}'");
        }
        Commands::List { json } => {
            let listing = match send(&config, ControlCommand::List)? {
                ControlResponse::Listing(rows) => rows,
                other => return Err(format!("unexpected response: {other:?}").into()),
            };
            if json {
                println!("{}", status::render_json(&listing)?);
            } else {
                print!("{}", status::render_table(&listing));
            }
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Listings go to stdout, so diagnostics stay on stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn serve(config: &Config) -> Result<(), Box<dyn Error>> {
    let options = config.controller_options()?;
    info!(
        "Starting pman supervisor: binary {:?}, registry {:?}",
        options.binary_path, options.registry_file
    );

    let controller = Controller::new(options)?;
    let service = Service::bind(&config.address(), controller)?;
    service.run()?;
    Ok(())
}

fn send(config: &Config, command: ControlCommand) -> Result<ControlResponse, Box<dyn Error>> {
    Ok(ipc::send_command(&config.address(), &command)?)
}
