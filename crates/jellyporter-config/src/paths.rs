use std::path::PathBuf;

pub const ENV_CONFIG_PATH: &str = "JELLYPORTER_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/jellyporter.yaml";

/// Resolve the config file location: explicit flag, then the
/// `JELLYPORTER_CONFIG_PATH` environment variable, then the system default.
pub fn config_path(flag: Option<PathBuf>) -> PathBuf {
    if let Some(path) = flag {
        return path;
    }

    if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    PathBuf::from(DEFAULT_CONFIG_PATH)
}
