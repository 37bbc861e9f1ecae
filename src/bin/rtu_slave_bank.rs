//! RTU Slave Bank
//!
//! Serves every slave listed in the configuration file on one serial line until
//! Ctrl-C, or until no serial endpoint can be bound.
//!
//! Usage: cargo run --bin rtu-slave-bank -- --config modbus_server_config.json
//! Example: cargo run --bin rtu-slave-bank -- --port /dev/ttyUSB0 --example-slave

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};

use rtu_slave_bank::config::DEFAULT_CONFIG_FILE;
use rtu_slave_bank::logging::init_tracing;
use rtu_slave_bank::{ModbusResult, ServerConfig, SlaveBankServer, SlaveConfig};

#[derive(Parser, Debug)]
#[command(name = "rtu-slave-bank", version, about = "Multi-device Modbus RTU slave emulator")]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "RTU_SLAVE_BANK_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override `serial.port`
    #[arg(short, long)]
    port: Option<String>,

    /// Override `server.log_level` (RUST_LOG still wins)
    #[arg(long)]
    log_level: Option<String>,

    /// Register the demo slave 1 if the configuration does not define it
    #[arg(long)]
    example_slave: bool,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    save_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        match ServerConfig::from_file(&args.config) {
            Ok(config) => config,
            Err(e) => {
                init_tracing("info");
                error!("Invalid configuration {}: {}", args.config.display(), e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        ServerConfig::default()
    };

    if let Some(port) = args.port {
        config.serial.port = port;
    }
    let log_level = args
        .log_level
        .unwrap_or_else(|| config.server.log_level.clone());
    init_tracing(&log_level);

    if !args.config.exists() {
        warn!(
            "{} not found, using default configuration",
            args.config.display()
        );
    }
    if args.example_slave && !config.slaves.iter().any(|slave| slave.slave_id == 1) {
        config.slaves.push(SlaveConfig::example(1));
    }

    if args.save_config {
        return match config.save(&args.config) {
            Ok(()) => {
                info!("Configuration written to {}", args.config.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Cannot write {}: {}", args.config.display(), e);
                ExitCode::FAILURE
            }
        };
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ServerConfig) -> ModbusResult<()> {
    let mut server = SlaveBankServer::new(config)?;
    info!("{}", rtu_slave_bank::info());
    server.start_server().await?;

    let fatal = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Cannot listen for Ctrl-C: {}", e);
            }
            info!("Shutdown requested");
            None
        }
        result = server.wait() => result.err(),
    };

    let stopped = server.stop_server().await;
    match fatal {
        Some(e) => Err(e),
        None => stopped,
    }
}
