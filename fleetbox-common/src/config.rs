//! Configuration file discovery and root folder resolution

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Environment variable naming the data root folder
pub const ROOT_FOLDER_ENV: &str = "FLEETBOX_ROOT_FOLDER";

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. `root_folder` key from the TOML config file
/// 4. OS-dependent compiled default
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    config_value: Option<&str>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = config_value {
        return PathBuf::from(path);
    }

    default_root_folder()
}

/// Locate the platform config file, if one exists
///
/// Linux checks `~/.config/fleetbox/config.toml` then `/etc/fleetbox/config.toml`.
pub fn default_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("fleetbox").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/fleetbox/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("fleetbox"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/fleetbox"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("fleetbox"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\fleetbox"))
    } else {
        dirs::data_dir()
            .map(|d| d.join("fleetbox"))
            .unwrap_or_else(|| PathBuf::from("./fleetbox_data"))
    }
}

/// Load a TOML config file into `T`
///
/// An explicit path that does not exist is an error. With no explicit path
/// the platform default is tried; when that is absent too, `T::default()` is
/// returned and a warning logged.
pub fn load_toml<T>(explicit: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            path.to_path_buf()
        }
        None => match default_config_file() {
            Some(path) => path,
            None => {
                warn!("No config file found, using compiled defaults");
                return Ok(T::default());
            }
        },
    };

    let content = std::fs::read_to_string(&path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Invalid config file {}: {}", path.display(), e)))
}
