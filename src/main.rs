use std::path::PathBuf;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use sv241_gateway::{
    cli,
    config::Config,
    discovery,
    gateway::Gateway,
    hub::HubHandle,
    link::SerialConnector,
    logging,
    mock::{MockConnector, MockFirmware},
    server,
};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use tracing::{debug, error, info, Level};

fn load_config(cli: &cli::Cli) -> Result<Config> {
    let mut config = if let Some(config_path) = &cli.config {
        Config::new_from_path(config_path)?
    } else {
        Config::default()
    };

    if let Some(port) = cli.port {
        config.network_port = port;
    }

    if let Some(serial) = &cli.serial {
        config.serial.port = serial.clone();
    }

    config.validate()?;

    Ok(config)
}

async fn run(config: Config, mock: bool, hub: HubHandle) -> Result<()> {
    let gateway = if mock {
        info!("Using a simulated SV241");
        Gateway::start(
            config.clone(),
            MockConnector::simulated(MockFirmware::default()),
            hub,
        )
    } else {
        Gateway::start(
            config.clone(),
            SerialConnector::new(&config.serial.port, config.serial.baud),
            hub,
        )
    };

    match discovery::bind(config.discovery_port).await {
        Ok(socket) => {
            tokio::spawn(discovery::serve(socket, config.network_port));
        }
        // Clients can still be pointed at the port by hand.
        Err(e) => error!("{e}"),
    }

    #[cfg(unix)]
    let hangup = async {
        match signal(SignalKind::hangup()) {
            Ok(mut hangup) => {
                hangup.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        _ = hangup => {
            info!("Told to hang up, quitting")
        }
        result = server::run_on_port(gateway, config.network_port) => {
            error!("Server returned");
            result?;
            return Err(eyre!("Server stopped unexpectedly"));
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let mut cli = cli::Cli::parse();

    if let Some(command) = cli.command.take() {
        cli::handle_command(command)?;

        return Ok(());
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            logging::init(Level::INFO, None, None).await;
            error!("Could not load configuration: {e}");
            logging::shutdown();

            return Err(e);
        }
    };

    let hub = HubHandle::spawn(config.hub_queue_capacity);

    // Levels were checked when the config was validated.
    let stdout_level = logging::parse_level(&config.log.level).unwrap_or(Level::INFO);
    let file_logging = config.log.directory.as_ref().map(|directory| {
        (
            logging::parse_level(&config.log.file_level).unwrap_or(Level::DEBUG),
            PathBuf::from(directory),
        )
    });

    logging::init(stdout_level, file_logging, Some(hub.clone())).await;
    debug!(?config, "Using configuration");

    let result = run(config, cli.mock, hub).await;

    if let Err(e) = &result {
        error!("Gateway failed: {e}");
    }

    logging::shutdown();

    result
}
