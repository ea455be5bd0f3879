use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};

use drvm_cli::{init_tracing, load_config, verbosity_directive, VM_CONFIG_PATH};
use drvm_rpc::api::DriverStatus;
use drvm_rpc::RpcClient;
use drvm_vm::{ProcessIsolator, VmConfig, VmManager};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "vm_manager", about = "Lightweight VM for Windows driver operations", version)]
struct Cli {
    /// Path to config file (default: /etc/drvm/vm-config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Create the VM disk image
    Create,

    /// Boot the VM from its disk
    Start,

    /// Shut the VM down
    Stop,

    /// Show VM state and resource usage
    Status,

    /// Boot the VM from the configured installer image
    Install,

    /// Write the guest isolation scripts
    Isolate {
        #[arg(long)]
        output_dir: PathBuf,

        /// Print the isolation summary
        #[arg(long)]
        show_summary: bool,
    },

    /// Talk to the driver service inside the running VM
    Guest {
        #[command(subcommand)]
        command: GuestCommand,
    },
}

#[derive(clap::Subcommand)]
enum GuestCommand {
    /// Show the guest service status
    Status,

    /// List guest devices and their drivers
    Drivers {
        #[arg(long)]
        category: Option<String>,
    },

    /// Install the driver for a device instance id
    InstallDriver { device_id: String },

    /// Remove the driver of a device instance id
    UninstallDriver { device_id: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let directive = verbosity_directive(&cli.verbose).unwrap_or_else(|| "warn".into());
    init_tracing(&directive, None)?;

    run(cli.config.as_deref(), cli.command)
}

fn run(config_flag: Option<&Path>, command: Command) -> Result<()> {
    let open_vm = || -> Result<VmManager> {
        let config: VmConfig = load_config(config_flag, VM_CONFIG_PATH)?;
        Ok(VmManager::new(config)?)
    };

    match command {
        Command::Create => {
            let vm = open_vm()?;
            vm.create_disk()?;
            println!("VM disk ready at {}", vm.config().disk_path.display());
        }
        Command::Start => {
            let mut vm = open_vm()?;
            vm.start(false)?;
            println!("VM started successfully");
            println!("RPC port: {}", vm.config().rpc_port());
        }
        Command::Stop => {
            open_vm()?.stop()?;
            println!("VM stopped");
        }
        Command::Status => print_status(&mut open_vm()?),
        Command::Install => {
            let mut vm = open_vm()?;
            println!("Starting VM in installation mode...");
            vm.start(true)?;
            println!("VM booted from installer image, RPC port: {}", vm.config().rpc_port());
        }
        Command::Isolate {
            output_dir,
            show_summary,
        } => isolate(&output_dir, show_summary)?,
        Command::Guest { command } => guest(&mut open_vm()?, command)?,
    }
    Ok(())
}

fn print_status(vm: &mut VmManager) {
    let info = vm.info();
    let usage = vm.resource_usage();

    println!("VM Status:");
    println!("  State: {}", info.state);
    println!("  Running: {}", info.running);
    if let Some(pid) = info.pid {
        println!("  PID: {pid}");
    }
    println!("  Memory: {} MB", info.memory_mb);
    println!("  CPUs: {}", info.cpu_cores);
    println!("  RPC Port: {}", info.rpc_port);
    println!();
    println!("Resource Usage:");
    println!("  CPU: {:.1}%", usage.cpu_percent);
    println!("  Memory: {:.0} MB", usage.memory_mb);
    println!("  Disk I/O: {:.1} MB/s", usage.disk_io_mbps);
    println!("  Network: {:.1} MB/s", usage.network_mbps);
}

fn isolate(output_dir: &Path, show_summary: bool) -> Result<()> {
    let isolator = ProcessIsolator::default();
    let written = isolator
        .export(output_dir)
        .with_context(|| format!("Failed to write isolation files to {}", output_dir.display()))?;
    for path in &written {
        println!("Wrote {}", path.display());
    }

    if show_summary {
        let summary = serde_json::to_string_pretty(&isolator.summary())?;
        println!("{summary}");
    }
    Ok(())
}

fn guest(vm: &mut VmManager, command: GuestCommand) -> Result<()> {
    if !vm.is_running() {
        bail!("VM is not running, start it with `vm_manager start`");
    }
    let client = RpcClient::new(format!("127.0.0.1:{}", vm.config().rpc_port()));
    if !client.connect(CONNECT_TIMEOUT) {
        bail!("Guest service is not reachable on {}", client.addr());
    }

    match command {
        GuestCommand::Status => {
            let status = client.get_status()?;
            println!("Guest: {}", status.vm_type);
            println!("  Isolated: {}", status.isolated);
            println!("  Installed this run: {}", status.installed_drivers_count);
            println!("  Memory: {} MB", status.memory_mb);
            println!("  CPUs: {}", status.cpu_cores);
            println!("  Processes: {}", status.processes_count);
        }
        GuestCommand::Drivers { category } => {
            let drivers = client.list_drivers(category.as_deref())?;
            println!("Devices: {}", drivers.len());
            for d in drivers {
                let state = match d.status {
                    DriverStatus::Installed => "installed",
                    DriverStatus::NeedsDriver => "needs driver",
                };
                let version = d.driver_version.as_deref().unwrap_or("-");
                println!("  {} [{}] {} ({}, {})", d.device_id, d.category, d.device_name, state, version);
            }
        }
        GuestCommand::InstallDriver { device_id } => {
            let reply = client.install_driver(&device_id)?;
            println!("{}", reply.message.unwrap_or_else(|| format!("Driver installed for {device_id}")));
        }
        GuestCommand::UninstallDriver { device_id } => {
            let reply = client.uninstall_driver(&device_id)?;
            println!("{}", reply.message.unwrap_or_else(|| format!("Driver uninstalled for {device_id}")));
        }
    }
    client.disconnect();
    Ok(())
}
