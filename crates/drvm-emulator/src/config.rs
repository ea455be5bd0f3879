use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::DeviceType;

/// Emulator settings. Every key is optional in the JSON file; missing keys
/// (including keys of the nested sections) fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub driver_search_paths: Vec<String>,
    pub supported_device_types: Vec<DeviceType>,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
}

/// `sandbox_enabled` and `network_isolation` describe the host the emulator
/// runs on; the emulator does not enforce them, it warns at startup when
/// either is switched off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub sandbox_enabled: bool,
    pub network_isolation: bool,
    pub max_drivers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset, e.g. `"info"`.
    pub level: String,
    /// Append log output to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        EmulatorConfig {
            driver_search_paths: vec![
                "/opt/drvm/drivers".into(),
                "/usr/local/share/drvm/drivers".into(),
                "~/.drvm/drivers".into(),
            ],
            supported_device_types: DeviceType::ALL.to_vec(),
            security: SecurityConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            sandbox_enabled: true,
            network_isolation: true,
            max_drivers: 32,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".into(),
            file: None,
        }
    }
}

impl EmulatorConfig {
    /// Search paths with a leading `~` replaced by `$HOME`.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.driver_search_paths
            .iter()
            .map(|p| expand_home(p))
            .collect()
    }

    pub fn supports(&self, device_type: DeviceType) -> bool {
        self.supported_device_types.contains(&device_type)
    }
}

impl SecurityConfig {
    /// Names of the protections switched off in this config.
    pub fn disabled_protections(&self) -> Vec<&'static str> {
        let mut off = Vec::new();
        if !self.sandbox_enabled {
            off.push("sandbox_enabled");
        }
        if !self.network_isolation {
            off.push("network_isolation");
        }
        off
    }
}

fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return PathBuf::from(path),
    };
    match std::env::var_os("HOME") {
        Some(home) => {
            let mut expanded = PathBuf::from(home);
            expanded.push(rest.trim_start_matches('/'));
            expanded
        }
        None => PathBuf::from(path),
    }
}
