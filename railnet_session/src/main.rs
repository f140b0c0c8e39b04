// CLI entry point for a headless Railnet participant.
//
// `railnet serve` hosts a session; `railnet join` connects to one. Both run
// a `Ticker` in place of a game loop and log through `tracing` (filter with
// `RUST_LOG`). A server runs until the process is killed; a client exits
// once its session is no longer live, e.g. after the server leaves.
//
// Usage:
//   railnet [--config FILE] [--tick-ms N] serve [--port PORT] [--name NAME]
//   railnet [--config FILE] [--tick-ms N] join --server HOST:PORT --name NAME

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use railnet_session::track::Collaborators;
use railnet_session::{SessionConfig, SessionError, Ticker, connect, start_server};

#[derive(Parser)]
#[command(name = "railnet", about = "Multiplayer train session server and client")]
struct Cli {
    /// JSON session config; defaults apply to anything it leaves out.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Milliseconds between ticks.
    #[arg(long, global = true, default_value_t = 100)]
    tick_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host a session.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Join a session.
    Join {
        /// Server address as HOST:PORT.
        #[arg(long)]
        server: String,
        #[arg(long)]
        name: Option<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), SessionError> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    let period = Duration::from_millis(cli.tick_ms.max(1));

    match cli.command {
        Command::Serve { port, name } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(name) = name {
                config.player.name = name;
            }
            let collaborators = Collaborators::from_config(&config);
            let (server, addr) = start_server(&config, collaborators)?;
            info!(%addr, "serving; stop with Ctrl+C");
            let _ticker = Ticker::spawn(server.session().clone(), period)?;
            loop {
                thread::sleep(Duration::from_secs(1));
            }
        }
        Command::Join { server, name } => {
            let (host, port) = split_address(&server)?;
            config.host = host;
            config.port = port;
            if let Some(name) = name {
                config.player.name = name;
            }
            let collaborators = Collaborators::from_config(&config);
            let client = connect(&config, collaborators)?;
            let ticker = Ticker::spawn(client.session().clone(), period)?;
            while !ticker.is_finished() {
                thread::sleep(period);
            }
            info!(status = ?client.session().status(), "session over");
            ticker.stop();
            client.disconnect();
            Ok(())
        }
    }
}

fn split_address(address: &str) -> Result<(String, u16), SessionError> {
    let invalid = || {
        SessionError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("expected HOST:PORT, got {address:?}"),
        ))
    };
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse().map_err(|_| invalid())?;
    Ok((host.to_owned(), port))
}
