use std::path::{Path, PathBuf};
use std::sync::Once;

use crate::types::PartitionKey;

static CREATE_DIR_WARNED: Once = Once::new();

/// Resolve the Rallytime home directory.
///
/// Priority:
/// 1) RALLYTIME_HOME
/// 2) HOME/USERPROFILE
/// 3) ./.rallytime
pub fn rallytime_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("RALLYTIME_HOME") {
        return PathBuf::from(override_path);
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        return PathBuf::from(home).join(".rallytime");
    }
    PathBuf::from(".").join(".rallytime")
}

fn ensure_home_dir(home: &Path) {
    if let Err(err) = std::fs::create_dir_all(home) {
        CREATE_DIR_WARNED.call_once(|| {
            eprintln!(
                "Warning: failed to create Rallytime home directory {}: {}. Set RALLYTIME_HOME or pass --data-root.",
                home.display(),
                err
            );
        });
    }
}

/// Default data root: ~/.rallytime/data
pub fn default_data_root() -> PathBuf {
    let home = rallytime_home();
    ensure_home_dir(&home);
    home.join("data")
}

/// Default logs directory: ~/.rallytime/logs
pub fn default_logs_dir() -> PathBuf {
    let home = rallytime_home();
    ensure_home_dir(&home);
    home.join("logs")
}

/// Default config file: ~/.rallytime/rallytime.toml
pub fn default_config_path() -> PathBuf {
    rallytime_home().join("rallytime.toml")
}

/// `<data-root>/gates`
pub fn gates_dir(data_root: &Path) -> PathBuf {
    data_root.join("gates")
}

/// `<data-root>/gates/<gate_id>/pass-<YYYYMMDD>.ndjson`
pub fn partition_path(data_root: &Path, key: &PartitionKey) -> PathBuf {
    gates_dir(data_root)
        .join(key.gate_id.as_str())
        .join(key.file_name())
}
