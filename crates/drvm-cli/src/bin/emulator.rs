use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};

use drvm_cli::{init_tracing, load_config, verbosity_directive, EMULATOR_CONFIG_PATH};
use drvm_emulator::{DeviceType, DriverEmulator, EmulatorConfig, HandlerRegistry};

#[derive(Parser)]
#[command(name = "emulator", about = "Host-side driver emulator", version)]
struct Cli {
    /// Path to config file (default: /etc/drvm/driver-emulator.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Load a driver by path, or by file name from the search paths
    Load { driver: String },

    /// Unload a driver by name
    Unload { name: String },

    /// List loaded drivers
    List,

    /// Check whether a driver could be loaded
    Check { driver: String },

    /// Enumerate devices of one type (usb, hid, storage, network, audio)
    Devices { device_type: DeviceType },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config: EmulatorConfig = load_config(cli.config.as_deref(), EMULATOR_CONFIG_PATH)?;

    let directive = verbosity_directive(&cli.verbose).unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&directive, config.logging.file.as_deref())?;

    let mut emulator = DriverEmulator::new(config, HandlerRegistry::with_defaults());

    let ok = match cli.command {
        Command::Load { driver } => match emulator.try_load(&driver) {
            Ok(record) => {
                let bound = emulator
                    .bound_devices(&record.name)
                    .map_or(0, |devices| devices.len());
                println!(
                    "Loaded {} ({}), {} device(s) bound",
                    record.name,
                    record.device_type(),
                    bound
                );
                true
            }
            Err(e) => {
                eprintln!("Failed to load {driver}: {e}");
                false
            }
        },

        Command::Unload { name } => match emulator.try_unload(&name) {
            Ok(record) => {
                println!("Unloaded {}", record.name);
                true
            }
            Err(e) => {
                eprintln!("Failed to unload {name}: {e}");
                false
            }
        },

        Command::List => {
            let drivers = emulator.list();
            if drivers.is_empty() {
                println!("No drivers loaded");
            } else {
                println!("Loaded drivers: {}", drivers.len());
                for driver in drivers {
                    println!("  - {} ({})", driver.name, driver.device_type());
                }
            }
            true
        }

        Command::Check { driver } => {
            let report = emulator.check_compatibility(&driver);
            println!("Driver compatibility check: {driver}");
            println!("Compatible: {}", report.compatible);
            if !report.issues.is_empty() {
                println!("Issues:");
                for issue in &report.issues {
                    println!("  - {issue}");
                }
            }
            if !report.warnings.is_empty() {
                println!("Warnings:");
                for warning in &report.warnings {
                    println!("  - {warning}");
                }
            }
            report.compatible
        }

        Command::Devices { device_type } => {
            let devices = emulator.enumerate(device_type);
            println!("{} {} device(s)", devices.len(), device_type);
            for d in &devices {
                println!("  {}  {}:{}  {}", d.id, d.vendor_id, d.product_id, d.name);
            }
            true
        }
    };

    if !ok {
        process::exit(1);
    }
    Ok(())
}
