/// Canonical file locations for procwatch data files.
///
/// Both files live under the platform data directory, in `procwatch/`:
///   - config.toml    Read by the daemon at startup.
///   - procwatch.log  Activity log written by the daemon and served to clients.
///
/// When the platform reports no data directory, the current directory is used.
use std::path::PathBuf;

const APP_DIR_NAME: &str = "procwatch";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const LOG_FILE_NAME: &str = "procwatch.log";

/// Returns the procwatch application data directory.
pub fn app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Returns the full path to the config file.
pub fn config_file_path() -> PathBuf {
    app_data_dir().join(CONFIG_FILE_NAME)
}

/// Returns the default path of the activity log.
pub fn default_log_path() -> PathBuf {
    app_data_dir().join(LOG_FILE_NAME)
}
