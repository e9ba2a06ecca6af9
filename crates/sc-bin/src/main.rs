//! `sc-sim`: drive a simulated sample changer from the command line.
//!
//! Every invocation builds a fresh simulated robot from the changer
//! configuration, attaches the controller, runs one resync and then performs
//! the requested operation.
//!
//! # Usage
//!
//! ```bash
//! sc-sim show
//! sc-sim --config config/isara2.toml load 2:03
//! sc-sim --mode realistic --mounted 1:01 load 3:05
//! sc-sim maintenance open_lid:2
//! RUST_LOG=sc_hardware=debug sc-sim run --seconds 10
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use sc_core::model::Geometry;
use sc_driver_mock::{MockMode, MockProfile, MockSampleChanger, TimingConfig};
use sc_hardware::config::load_config;
use sc_hardware::{spawn_resync, ChangerConfig, DriverKind, MaintenanceCommand, SampleChanger, TimingSettings};

#[derive(Parser)]
#[command(name = "sc-sim")]
#[command(about = "Sample-changer controller against a simulated robot", long_about = None)]
struct Cli {
    /// Changer configuration file (TOML). Without it a 29-puck Isara2 is simulated.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Simulation mode: instant, realistic or chaos
    #[arg(long, global = true, default_value = "instant")]
    mode: MockMode,

    /// Sample already on the goniometer when the simulation starts
    #[arg(long, global = true)]
    mounted: Option<String>,

    /// Seed for simulated barcodes
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the resync loop and print events as JSON lines
    Run {
        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Load a sample, exchanging the mounted one if any
    Load {
        /// Sample address, e.g. `2:03` or `B3:2-1`
        address: String,
    },

    /// Unload the mounted sample
    Unload,

    /// Read barcodes of a sample, basket or (recursively) the dewar
    Scan {
        address: String,
        #[arg(long)]
        recursive: bool,
    },

    /// Run a maintenance operation (`dry`, `power_off`, `open_lid:2`, ...)
    Maintenance { operation: MaintenanceCommand },

    /// Print the inventory
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = changer_config(&cli)?;
    let (mock, changer) = simulate(&cli, config)?;
    changer.resync().await;
    info!(changer = %changer.name(), state = %changer.state(), "simulation ready");

    match cli.command {
        Commands::Run { seconds } => run(changer, seconds.map(Duration::from_secs)).await?,
        Commands::Load { address } => {
            changer.load(Some(address.into())).await?;
            print_status(&changer);
        }
        Commands::Unload => {
            changer.unload().await?;
            print_status(&changer);
        }
        Commands::Scan { address, recursive } => {
            let scanned = changer.scan(address, recursive).await?;
            let samples: Vec<_> = changer.with_model(|m| {
                scanned
                    .iter()
                    .filter_map(|id| m.get(*id))
                    .map(|c| json!({ "address": c.address, "barcode": c.barcode }))
                    .collect()
            });
            println!("{}", serde_json::to_string_pretty(&samples)?);
        }
        Commands::Maintenance { operation } => {
            changer.maintenance(operation).await?;
            changer.resync().await;
            print_status(&changer);
        }
        Commands::Show => print_inventory(&changer),
    }

    info!(dispatched = ?mock.dispatched_names(), "done");
    Ok(())
}

fn changer_config(cli: &Cli) -> Result<ChangerConfig> {
    if let Some(path) = &cli.config {
        return load_config(path).with_context(|| format!("loading {}", path.display()));
    }
    let timing = match cli.mode {
        MockMode::Instant => TimingSettings::fast(),
        MockMode::Realistic | MockMode::Chaos => TimingSettings::default(),
    };
    Ok(ChangerConfig::new("SC-SIM", DriverKind::Isara2, Geometry::unipucks(29)).with_timing(timing))
}

fn mock_profile(driver: DriverKind) -> MockProfile {
    match driver {
        DriverKind::Grob => MockProfile::grob(),
        DriverKind::Marvin => MockProfile::marvin(),
        DriverKind::PlateManipulator => MockProfile::plate_manipulator(),
        DriverKind::Isara2 | DriverKind::Generic => MockProfile::isara(),
    }
}

fn simulate(cli: &Cli, config: ChangerConfig) -> Result<(MockSampleChanger, Arc<SampleChanger>)> {
    let timing = match cli.mode {
        MockMode::Instant => TimingConfig::quick(),
        MockMode::Realistic | MockMode::Chaos => TimingConfig::robot(),
    };
    let mut builder = MockSampleChanger::builder(config.geometry.clone())
        .name(config.name.clone())
        .profile(mock_profile(config.driver))
        .mode(cli.mode)
        .timing(timing);
    if let Some(seed) = cli.seed {
        builder = builder.random_barcodes(Some(seed));
    }
    let mock = builder.build()?;
    if let Some(address) = &cli.mounted {
        mock.set_mounted(Some(address))?;
    }
    let changer = SampleChanger::new(config, Arc::new(mock.clone()))?;
    Ok((mock, Arc::new(changer)))
}

async fn run(changer: Arc<SampleChanger>, limit: Option<Duration>) -> Result<()> {
    let mut events = changer.subscribe();
    for event in changer.replay_telemetry() {
        println!("{}", serde_json::to_string(&event)?);
    }
    let resync = spawn_resync(Arc::clone(&changer));
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(n)) => eprintln!("missed {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }
    resync.shutdown().await;
    Ok(())
}

fn print_status(changer: &SampleChanger) {
    println!("state:    {}", changer.state());
    println!(
        "loaded:   {}",
        changer.loaded_sample_address().as_deref().unwrap_or("-")
    );
}

fn print_inventory(changer: &SampleChanger) {
    print_status(changer);
    changer.with_model(|m| {
        for &holder in m.holders() {
            let Some(basket) = m.get(holder) else {
                continue;
            };
            let flag = if basket.present { "present" } else { "absent" };
            println!("{:>6}  {:<8} {}", basket.address, basket.kind.label(), flag);
            for sample in m.descendant_samples(holder).into_iter().filter_map(|id| m.get(id)) {
                if sample.barcode.is_none() && !sample.is_loaded() {
                    continue;
                }
                let marker = if sample.is_loaded() { "*" } else { " " };
                println!(
                    "      {} {:<10} {}",
                    marker,
                    sample.address,
                    sample.barcode.as_deref().unwrap_or("")
                );
            }
        }
    });
}
