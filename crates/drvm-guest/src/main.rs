use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use tracing_subscriber::EnvFilter;

use drvm_guest::{default_backend, CatalogBackend, DriverBackend, GuestDriverManager, GuestOptions, PnpUtilBackend};

#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    /// pnputil on Windows, the built-in catalog elsewhere
    Auto,
    Pnputil,
    Catalog,
}

#[derive(Parser)]
#[command(name = "drvm-guest", about = "Driver control service for the Windows guest", version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// RPC port
    #[arg(long, default_value_t = drvm_rpc::DEFAULT_RPC_PORT)]
    port: u16,

    /// Memory reported by get_status, in MB
    #[arg(long, default_value_t = 512)]
    memory_mb: u64,

    /// CPU cores reported by get_status
    #[arg(long, default_value_t = 1)]
    cpu_cores: u32,

    /// Label reported as vm_type
    #[arg(long, env = "DRVM_VM_TYPE")]
    vm_type: Option<String>,

    #[arg(long, value_enum, default_value_t = BackendKind::Auto)]
    backend: BackendKind,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = EnvFilter::new(args.verbose.tracing_level_filter().to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or(default_filter))
        .init();

    let backend: Box<dyn DriverBackend> = match args.backend {
        BackendKind::Auto => default_backend(),
        BackendKind::Pnputil => Box::new(PnpUtilBackend::new()),
        BackendKind::Catalog => Box::new(CatalogBackend::default()),
    };

    let defaults = GuestOptions::default();
    let options = GuestOptions {
        vm_type: args.vm_type.unwrap_or(defaults.vm_type),
        memory_mb: args.memory_mb,
        cpu_cores: args.cpu_cores,
    };
    let manager = GuestDriverManager::new(backend, options);

    let addr = format!("{}:{}", args.bind, args.port);
    let server = drvm_guest::bind(addr.as_str(), manager)
        .with_context(|| format!("failed to listen on {addr}"))?;
    server.serve().context("RPC server failed")?;
    Ok(())
}
