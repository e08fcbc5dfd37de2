mod address;
mod bus;
mod codec;
mod config;
mod control;
mod db;
mod poller;
mod pump;
mod rtu;
mod rules;
mod symbolic;
mod sweep;
mod threshold;
mod tracker;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::env;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use address::RegisterKind;
use db::Db;
use rtu::RtuClient;

#[derive(Parser, Debug)]
#[command(name = "pumpstation-controller", version, about = "Modbus RTU master for a water pumping station")]
struct Cli {
    /// Station config file
    #[arg(long, env = "STATION_CONFIG", default_value = "station.toml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control loop until interrupted (default)
    Run,
    /// Read every configured register once and report the results
    Sweep {
        /// Print one JSON object per register on stdout
        #[arg(long)]
        json: bool,
    },
    /// Print the next free protocol address for a device and function code
    NextAddress {
        #[arg(long)]
        device: i64,
        #[arg(long)]
        function: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // ── Config ──────────────────────────────────────────────────────
    let mut cfg = config::load(&cli.config)?;
    if let Ok(url) = env::var("DB_URL") {
        cfg.database.url = Some(url);
    }
    if let Ok(port) = env::var("SERIAL_PORT") {
        cfg.serial.port = port;
    }

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.database.url()).await?;
    db.migrate().await?;
    config::apply(&cfg, &db).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::NextAddress { device, function } => {
            let kind = RegisterKind::from_function_code(function)
                .with_context(|| format!("function code {function} must be 1, 2, 3 or 4"))?;
            let address = db.next_free_address(device, kind).await?;
            println!("{address}");
            db.close().await;
        }
        Command::Sweep { json } => {
            let mut client = RtuClient::new(cfg.serial.clone());
            if let Err(e) = client.connect() {
                error!(port = %cfg.serial.port, "cannot open serial port: {e}");
                db.close().await;
                return Err(e).context("failed to connect modbus transport");
            }
            let bus = bus::shared(client);

            let result = sweep::run(&db, &bus).await;
            db.close().await;
            bus.lock().await.disconnect().await;

            let lines = result?;
            if json {
                for line in &lines {
                    println!("{}", serde_json::to_string(line)?);
                }
            }
            let summary = sweep::SweepSummary::of(&lines);
            if summary.failed > 0 {
                warn!(failed = summary.failed, total = summary.total, "some registers could not be read");
            }
        }
        Command::Run => {
            let mut client = RtuClient::new(cfg.serial.clone());
            if let Err(e) = client.connect() {
                error!(port = %cfg.serial.port, "cannot open serial port, control loop not started: {e}");
                db.close().await;
                return Err(e).context("failed to connect modbus transport");
            }

            // Register the handler now so an early Ctrl-C is not lost.
            let (stop_tx, mut stop_rx) = watch::channel(false);
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("failed to listen for ctrl-c: {e}");
                    std::future::pending::<()>().await;
                }
                info!("interrupt received");
                let _ = stop_tx.send(true);
            });

            control::run(db, bus::shared(client), cfg.control.clone(), async move {
                let _ = stop_rx.wait_for(|stop| *stop).await;
            })
            .await?;
        }
    }

    Ok(())
}
