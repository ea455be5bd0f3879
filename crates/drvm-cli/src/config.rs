use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::de::DeserializeOwned;

pub const EMULATOR_CONFIG_PATH: &str = "/etc/drvm/driver-emulator.json";
pub const VM_CONFIG_PATH: &str = "/etc/drvm/vm-config.json";

/// Read a JSON config file. A missing file at `default_path` means built-in
/// defaults; a missing file given with `--config` is an error.
pub fn load_config<T>(config_flag: Option<&Path>, default_path: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let path = match config_flag {
        Some(p) => p.to_path_buf(),
        None => PathBuf::from(default_path),
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let cfg: T = serde_json::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
            tracing::debug!(path = %path.display(), "loaded config");
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if config_flag.is_some() {
                bail!("Config file not found: {}", path.display());
            }
            Ok(T::default())
        }
        Err(e) => bail!("Failed to read {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drvm_emulator::EmulatorConfig;
    use drvm_vm::VmConfig;

    #[test]
    fn missing_default_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let default = dir.path().join("absent.json");
        let cfg: VmConfig = load_config(None, default.to_str().unwrap()).unwrap();
        assert_eq!(cfg.memory_mb, 512);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("absent.json");
        let err = load_config::<VmConfig>(Some(&flag), VM_CONFIG_PATH).unwrap_err();
        assert!(err.to_string().starts_with("Config file not found"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emulator.json");
        std::fs::write(&path, r#"{"security": {"max_drivers": 2}}"#).unwrap();

        let cfg: EmulatorConfig = load_config(Some(&path), EMULATOR_CONFIG_PATH).unwrap();
        assert_eq!(cfg.security.max_drivers, 2);
        assert!(cfg.security.sandbox_enabled);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.json");
        std::fs::write(&path, "{ memory_mb: ").unwrap();
        let err = load_config::<VmConfig>(Some(&path), VM_CONFIG_PATH).unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse"));
    }
}
