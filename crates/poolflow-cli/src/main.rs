//! PoolFlow command line remote
//!
//! Usage:
//!   poolflow status
//!   poolflow discover --pair
//!   poolflow pump auto
//!   poolflow slot 2 add
//!   poolflow --simulate watch

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::time::timeout;
use tracing::{debug, info};

use poolflow_core::config::{Config, ConfigBuilder};
use poolflow_core::event::PoolEvent;
use poolflow_core::logging;
use poolflow_core::types::{DeviceAddress, PumpMode, SlotIndex};
use poolflow_devices::connector::SharedConnector;
use poolflow_devices::pairing::{FilePairingStore, MemoryPairingStore, PairingStore};
use poolflow_devices::simulator::{SimulatedController, SimulatorConnector};
use poolflow_devices::TcpConnector;
use poolflow_engine::{PoolClient, PoolService, PoolSnapshot};

/// Address the simulated controller answers on
const SIMULATED_ADDRESS: DeviceAddress = DeviceAddress::new(192, 168, 1, 100);

#[derive(Parser, Debug)]
#[command(name = "poolflow")]
#[command(about = "Remote control for networked pool pump controllers", version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "poolflow.toml")]
    config: PathBuf,

    /// Talk to an in-process simulated controller instead of the network
    #[arg(long)]
    simulate: bool,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    /// Seconds to wait for the controller to answer
    #[arg(short, long, default_value = "15")]
    wait: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the paired controller and print its state
    Status,
    /// Print session notifications until interrupted
    Watch,
    /// Scan the local network for a controller
    Discover {
        /// Pair with the first controller found
        #[arg(long)]
        pair: bool,
    },
    /// Check whether a controller answers at an address
    Probe {
        /// IPv4 address
        address: DeviceAddress,
    },
    /// Pair with the controller at an address
    Pair {
        /// IPv4 address
        address: DeviceAddress,
    },
    /// Forget the paired controller
    Unpair,
    /// Change the pump mode
    Pump {
        #[arg(value_enum)]
        mode: ModeArg,
    },
    /// Show or adjust a time slot
    Slot {
        /// Slot index (0-5)
        index: usize,
        #[arg(value_enum, default_value = "show")]
        action: SlotAction,
    },
    /// Send a raw command line, e.g. "/errors"
    Send {
        line: String,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Off,
    On,
    Auto,
}

impl From<ModeArg> for PumpMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Off => PumpMode::Off,
            ModeArg::On => PumpMode::On,
            ModeArg::Auto => PumpMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SlotAction {
    Show,
    Add,
    Sub,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ConfigBuilder::new()
        .with_config_file(&args.config)
        .with_environment_prefix("POOLFLOW")
        .build()
        .context("Failed to load configuration")?;
    logging::init_from_config(&config.logging)?;

    if let Commands::Config = args.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    // Only `watch` and `discover` want the session to scan by itself
    config.discovery.scan_on_start = matches!(args.command, Commands::Watch);
    if let Commands::Discover { pair: true } = args.command {
        config.discovery.auto_pair = true;
    }

    let (store, connector) = backend(&args, &config);
    let client = PoolService::start(config, store, connector).await?;
    let wait = Duration::from_secs(args.wait);

    let result = run(&args, &client, wait).await;
    client.shutdown().await?;
    result
}

fn backend(args: &Args, config: &Config) -> (Arc<dyn PairingStore>, SharedConnector) {
    if !args.simulate {
        let store = FilePairingStore::new(config.pairing_file());
        return (Arc::new(store), Arc::new(TcpConnector));
    }

    info!("Using simulated controller at {}", SIMULATED_ADDRESS);
    let connector = SimulatorConnector::new();
    connector.add(
        SIMULATED_ADDRESS,
        SimulatedController::new()
            .with_mode(PumpMode::Auto)
            .with_temperatures(26, 21)
            .with_slots([2, 0, 3, 0, 4, 1]),
    );
    let store = match args.command {
        Commands::Discover { .. } | Commands::Probe { .. } | Commands::Pair { .. } => {
            MemoryPairingStore::new()
        }
        _ => MemoryPairingStore::with_address(SIMULATED_ADDRESS),
    };
    (Arc::new(store), Arc::new(connector))
}

async fn run(args: &Args, client: &PoolClient, wait: Duration) -> Result<()> {
    match &args.command {
        Commands::Status => {
            let snapshot = ready(client, wait).await?;
            print_snapshot(&snapshot, args.json)
        }
        Commands::Watch => watch(client, args.json).await,
        Commands::Discover { .. } => discover(client, args.json).await,
        Commands::Probe { address } => {
            let found = client.test_address(*address).await?;
            if args.json {
                println!("{}", serde_json::json!({ "address": address, "found": found }));
            } else if found {
                println!("Controller found at {}", address);
            } else {
                println!("No controller at {}", address);
            }
            Ok(())
        }
        Commands::Pair { address } => {
            client.pair(*address).await?;
            let snapshot = ready(client, wait).await?;
            println!("Paired with {}", address);
            print_snapshot(&snapshot, args.json)
        }
        Commands::Unpair => {
            client.unpair().await?;
            client.wait_until(|s| !s.connection.is_paired).await?;
            println!("Unpaired");
            Ok(())
        }
        Commands::Pump { mode } => {
            let mode = PumpMode::from(*mode);
            ready(client, wait).await?;
            client.set_pump_mode(mode).await?;
            let snapshot = within(wait, client.wait_until(|s| s.pump_mode == mode)).await?;
            println!("Pump mode: {}", snapshot.pump_mode);
            Ok(())
        }
        Commands::Slot { index, action } => slot(client, *index, *action, wait).await,
        Commands::Send { line } => {
            ready(client, wait).await?;
            let mut events = client.events()?;
            client.send_raw(line.clone()).await?;
            // Replies only show up as state changes
            let before = client.snapshot();
            let _ = timeout(wait, client.wait_until(|s| *s != before)).await;
            while let Ok(event) = events.try_recv() {
                debug!("Event: {:?}", event);
            }
            print_snapshot(&client.snapshot(), args.json)
        }
        Commands::Config => Ok(()),
    }
}

/// Wait for the initial data of the paired controller
async fn ready(client: &PoolClient, wait: Duration) -> Result<PoolSnapshot> {
    if !client.snapshot().connection.is_paired {
        bail!("No controller paired; run `poolflow discover --pair` or `poolflow pair <address>`");
    }
    within(wait, client.wait_until(|s| s.connection.data_initialized))
        .await
        .context("Controller did not report its state")
}

async fn within<F>(wait: Duration, future: F) -> Result<PoolSnapshot>
where
    F: std::future::Future<Output = poolflow_engine::Result<PoolSnapshot>>,
{
    match timeout(wait, future).await {
        Ok(snapshot) => Ok(snapshot?),
        Err(_) => bail!("Timed out after {}s", wait.as_secs()),
    }
}

async fn slot(client: &PoolClient, index: usize, action: SlotAction, wait: Duration) -> Result<()> {
    let slot = SlotIndex::new(index).with_context(|| format!("Slot index {} out of range (0-5)", index))?;
    let before = ready(client, wait).await?.time_slots.get(slot);

    let hours = match action {
        SlotAction::Show => {
            client.fetch_time_slot(index).await?;
            before
        }
        SlotAction::Add | SlotAction::Sub => {
            if matches!(action, SlotAction::Add) {
                client.increment_time_slot(index).await?;
            } else {
                client.decrement_time_slot(index).await?;
            }
            // A slot already at its bound does not change
            match timeout(wait, client.wait_until(|s| s.time_slots.get(slot) != before)).await {
                Ok(snapshot) => snapshot?.time_slots.get(slot),
                Err(_) => before,
            }
        }
    };

    println!("Slot {}: {}h", slot, hours);
    Ok(())
}

async fn watch(client: &PoolClient, json: bool) -> Result<()> {
    let mut events = client.events()?;
    print_snapshot(&client.snapshot(), json)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(PoolEvent::DataReady) => print_snapshot(&client.snapshot(), json)?,
                Ok(event) => print_event(&event, json)?,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Missed {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn discover(client: &PoolClient, json: bool) -> Result<()> {
    let mut events = client.events()?;
    client.start_discovery().await?;

    loop {
        match events.recv().await {
            Ok(PoolEvent::DiscoveryFinished { outcome, found }) => {
                debug!("Scan ended: {:?}, {} found", outcome, found);
                break;
            }
            Ok(event) => print_event(&event, json)?,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    let snapshot = client.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot.discovered)?);
    } else if snapshot.discovered.is_empty() {
        println!("No controller found");
    } else {
        for pool in &snapshot.discovered {
            println!("{}  {}  signal {}/5", pool.address, pool.name, pool.signal.bars());
        }
    }
    Ok(())
}

fn print_event(event: &PoolEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        PoolEvent::Connected { address } => println!("Connected to {}", address),
        PoolEvent::Disconnected { address, will_retry } => {
            println!("Disconnected from {} (retry: {})", address, will_retry)
        }
        PoolEvent::DataReady => println!("Data ready"),
        PoolEvent::Paired { address } => println!("Paired with {}", address),
        PoolEvent::Unpaired => println!("Unpaired"),
        PoolEvent::DeviceFound { pool } => println!("Found {} at {}", pool.name, pool.address),
        PoolEvent::DiscoveryFinished { outcome, found } => {
            println!("Discovery finished: {:?} ({} found)", outcome, found)
        }
    }
    Ok(())
}

fn print_snapshot(snapshot: &PoolSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    match snapshot.paired_address {
        Some(address) => println!("Controller:  {} ({:?})", address, snapshot.phase),
        None => println!("Controller:  not paired"),
    }
    let t = &snapshot.temperature;
    println!("Pump mode:   {}", snapshot.pump_mode);
    println!("Water:       {}°C (trend {:+})", t.water, t.trend);
    println!("Air:         {}°C", t.air);
    let slots: Vec<String> = snapshot
        .time_slots
        .as_array()
        .iter()
        .map(|h| format!("{}h", h))
        .collect();
    println!("Time slots:  {}", slots.join(" "));
    if snapshot.error_flags.any() {
        println!("Faults:      {:?}", snapshot.error_flags);
    } else {
        println!("Faults:      none");
    }
    if let Some(at) = snapshot.connection.last_update {
        println!("Updated:     {}", at.to_rfc3339());
    }
    Ok(())
}
