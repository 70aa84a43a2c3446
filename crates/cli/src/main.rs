//! sp420 command line tool
//!
//! Finds SP-420 light sensors on the USB bus and reads, calibrates or watches
//! them. USB work is blocking and runs on the blocking thread pool; hot-plug
//! notifications reach the async side through a channel.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cli::Config;
use cli::session::{Forwarder, Notice, lock, shutdown};
use common::setup_logging;
use sensor::{Device, LightSource, Registry, SharedDevice};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// How often `watch` lists sensors, which rescans on platforms without hot-plug
const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "sp420")]
#[command(author, version, about = "SP-420 light sensor tool")]
#[command(long_about = "
Reads Apogee SP-420 light sensors over USB.

EXAMPLES:
    # List attached sensors
    sp420 list

    # Read irradiance from the first sensor
    sp420 read

    # Read from the sensor at bus 1, address 7 under electric light
    sp420 --device 1:7 --light-source electric read

    # Store a new calibration
    sp420 calibration set 3.12 0.0005

    # Print sensors as they are plugged in and out
    sp420 watch

CONFIGURATION:
    The configuration file is looked up in the following order:
    1. Path specified with --config
    2. ~/.config/sp420/config.toml
    3. /etc/sp420/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration (to --config or the default location) and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log every USB transfer
    #[arg(long)]
    debug: bool,

    /// Light source being measured (electric, sunlight)
    #[arg(long, value_name = "SOURCE")]
    light_source: Option<LightSource>,

    /// Sensor to use, as bus:address (default: first found)
    #[arg(short, long, value_name = "BUS:ADDR")]
    device: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List attached sensors
    List,
    /// Read calibrated irradiance in W/m²
    Read,
    /// Read the uncalibrated sensor voltage
    Raw,
    /// Print the sensor type reported by the firmware
    SensorType,
    /// Show or change the calibration
    Calibration {
        #[command(subcommand)]
        action: CalibrationCommand,
    },
    /// Print sensors as they are added and removed until Ctrl-C
    Watch,
}

#[derive(Subcommand, Debug)]
enum CalibrationCommand {
    /// Calibration currently in use
    Show,
    /// Factory calibration
    Permanent,
    /// Store a new calibration
    Set {
        multiplier: f32,
        /// Offset in volts
        offset: f32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = Config::default();
        let path = args.config.clone().unwrap_or_else(Config::default_path);
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        Config::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        Config::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    Config::validate_log_level(log_level)?;
    let usb_debug = args.debug || config.usb.debug;
    setup_logging(log_level, usb_debug).context("Failed to setup logging")?;

    info!("sp420 v{}", env!("CARGO_PKG_VERSION"));

    let mut options = config.registry_options()?;
    options.debug = usb_debug;
    if let Some(light_source) = args.light_source {
        options.light_source = light_source;
    }

    let registry = Arc::new(Registry::new(options));
    let result = run(args.command.unwrap_or(Commands::List), &registry, args.device).await;

    // Devices and registry are only released explicitly
    let closing = Arc::clone(&registry);
    if let Err(e) = blocking(move || shutdown(&closing)).await {
        error!("Error shutting down: {:#}", e);
    }

    result
}

async fn run(command: Commands, registry: &Arc<Registry>, device: Option<String>) -> Result<()> {
    match command {
        Commands::List => list(registry).await,
        Commands::Read => {
            let watts = with_device(registry, device, Device::read).await?;
            if watts < 0.0 {
                warn!("Negative reading {:.2} W/m², calibration required", watts);
                println!("0.00 W/m²");
            } else {
                println!("{:.2} W/m²", watts);
            }
            Ok(())
        }
        Commands::Raw => {
            let volts = with_device(registry, device, Device::read_raw_volts).await?;
            println!("{:.6} V", volts);
            Ok(())
        }
        Commands::SensorType => {
            let sensor_type = with_device(registry, device, Device::sensor_type).await?;
            println!("{}", sensor_type);
            Ok(())
        }
        Commands::Calibration { action } => {
            let calibration = match action {
                CalibrationCommand::Show => {
                    with_device(registry, device, |d| Ok(d.calibration())).await?
                }
                CalibrationCommand::Permanent => {
                    with_device(registry, device, Device::permanent_calibration).await?
                }
                CalibrationCommand::Set { multiplier, offset } => {
                    with_device(registry, device, move |d| d.set_calibration(multiplier, offset))
                        .await?
                }
            };
            println!(
                "Multiplier {:.6}, Offset {:.6}",
                calibration.multiplier, calibration.offset
            );
            Ok(())
        }
        Commands::Watch => watch(registry).await,
    }
}

/// List attached sensors and exit
async fn list(registry: &Arc<Registry>) -> Result<()> {
    let listing = Arc::clone(registry);
    let devices = blocking(move || listing.list()).await?;

    if devices.is_empty() {
        println!("No SP-420 sensors found.");
        return Ok(());
    }

    println!("Found {} sensor(s):\n", devices.len());
    for device in &devices {
        let device = lock(device);
        println!("  {}", *device);
        if let Some(report) = device.bootstrap_report()
            && !report.is_complete()
        {
            println!("      Incomplete bootstrap, failed: {:?}", report.failed_steps());
        }
    }

    Ok(())
}

/// Print arrivals and departures until Ctrl-C
async fn watch(registry: &Arc<Registry>) -> Result<()> {
    let (tx, rx) = async_channel::unbounded();
    let forwarder = Arc::new(Forwarder::new(tx));
    registry.register(forwarder.clone());

    let starting = Arc::clone(registry);
    blocking(move || starting.init()).await?;
    println!("Watching for sensors, press Ctrl-C to stop");

    let mut poll = tokio::time::interval(WATCH_POLL_INTERVAL);
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = loop {
        tokio::select! {
            notice = rx.recv() => match notice {
                Ok(Notice::Added(device)) => println!("Added   {}", device),
                Ok(Notice::Removed(device)) => println!("Removed {}", device),
                Err(_) => break Ok(()),
            },
            _ = poll.tick() => {
                let listing = Arc::clone(registry);
                if let Err(e) = blocking(move || listing.list()).await {
                    break Err(e);
                }
            }
            _ = &mut ctrl_c => {
                info!("Received Ctrl-C, stopping");
                break Ok(());
            }
        }
    };

    registry.unregister(&forwarder);
    result
}

/// Run blocking sensor work off the async runtime
async fn blocking<T, F>(op: F) -> Result<T>
where
    F: FnOnce() -> sensor::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(op)
        .await
        .context("Sensor task failed")?;
    Ok(result?)
}

/// Run `op` on the selected sensor
async fn with_device<T, F>(registry: &Arc<Registry>, uuid: Option<String>, op: F) -> Result<T>
where
    F: FnOnce(&mut Device) -> sensor::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let registry = Arc::clone(registry);
    blocking(move || {
        let shared = select_device(&registry, uuid.as_deref())?;
        let mut device = lock(&shared);
        op(&mut device)
    })
    .await
    .context("Sensor operation failed")
}

fn select_device(registry: &Registry, uuid: Option<&str>) -> sensor::Result<SharedDevice> {
    let Some(uuid) = uuid else {
        return registry.find_one();
    };

    registry
        .list()?
        .into_iter()
        .find(|device| lock(device).uuid() == uuid)
        .ok_or(sensor::Error::NoDevice)
}
