mod config;
mod error;
mod isolation;
mod manager;
mod process;
mod usage;

pub use config::{NetworkConfig, VmConfig, MAX_CPU_CORES, MAX_MEMORY_MB, MIN_MEMORY_MB};
pub use error::{Result, VmError};
pub use isolation::{IsolationSummary, ProcessIsolator};
pub use manager::{qemu_args, VmInfo, VmManager, VmState};
pub use usage::ResourceUsage;

pub fn default_data_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    format!("{}/.local/share/drvm", home)
}
