//! tandem-coordinator: authoritative coordinator for collaborative analysis
//! sessions.
//!
//! Listens on TCP, keeps repositories, branches and event history in SQLite
//! under the data directory, and writes the bound address to
//! `<data_dir>/coordinator.addr` once it is accepting clients.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};

use tandem_coordinator::config::{self, CoordinatorConfig};
use tandem_coordinator::{logging, Server};

#[derive(Parser)]
#[command(name = "tandem-coordinator")]
#[command(about = "Coordinator for collaborative analysis sessions")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.tandem/coordinator.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(long, short)]
    port: Option<u16>,

    /// Log filter, e.g. `info` or `tandem_coordinator=debug`
    #[arg(long)]
    level: Option<String>,

    /// Directory holding the database, address file and logs
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Log to stdout only
    #[arg(long)]
    no_log_file: bool,
}

fn main() {
    let cli = Cli::parse();

    let (mut config, config_error) = match config::load_config(cli.config.clone()) {
        Ok(config) => (config, None),
        Err(err) => (CoordinatorConfig::default(), Some(err)),
    };
    apply_overrides(&mut config, &cli);

    let data_dir = match config.data_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("tandem-coordinator: {}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = fs_err::create_dir_all(&data_dir) {
        eprintln!("tandem-coordinator: failed to create data directory: {}", err);
        std::process::exit(1);
    }

    let _logging_guard = logging::init(&config.logging, cli.level.as_deref(), Some(&data_dir));
    if let Some(err) = config_error {
        warn!(error = %err, "Failed to load coordinator config; using defaults");
    }

    let server = match Server::bind(&config) {
        Ok(server) => server,
        Err(err) => {
            error!(error = %err, addr = %config.bind_addr(), "Failed to start coordinator");
            std::process::exit(1);
        }
    };

    match server.local_addr() {
        Ok(addr) => {
            info!(
                addr = %addr,
                data_dir = %data_dir.display(),
                version = env!("CARGO_PKG_VERSION"),
                "Tandem coordinator started"
            );
            if let Err(err) = write_addr_file(&config, &addr.to_string()) {
                warn!(error = %err, "Failed to write coordinator address file");
            }
        }
        Err(err) => warn!(error = %err, "Failed to resolve bound address"),
    }

    server.run();
}

fn apply_overrides(config: &mut CoordinatorConfig, cli: &Cli) {
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = Some(dir.clone());
    }
    if cli.no_log_file {
        config.logging.file = false;
    }
}

fn write_addr_file(config: &CoordinatorConfig, addr: &str) -> Result<(), String> {
    let path = config.addr_file_path()?;
    fs_err::write(&path, format!("{}\n", addr))
        .map_err(|err| format!("Failed to write {}: {}", path.display(), err))
}
