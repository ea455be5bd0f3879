//! Pieces shared by the `emulator` and `vm_manager` binaries.

mod config;
mod logging;

pub use config::{load_config, EMULATOR_CONFIG_PATH, VM_CONFIG_PATH};
pub use logging::{init_tracing, verbosity_directive};
