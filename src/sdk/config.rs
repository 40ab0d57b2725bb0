use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Settings for opening a [`Store`](crate::sdk::Store).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the database file and the fallback blobs.
    pub data_dir: PathBuf,
    /// Database file name inside `data_dir`.
    pub database_file: String,
    /// Skip the primary backend and run degraded from the start.
    pub disable_primary: bool,
    /// Period of the auto-backup task.
    pub backup_interval: Duration,
    /// How many times an operation polls for readiness before giving up on the primary.
    pub ready_poll_attempts: u32,
    /// Pause between two readiness polls.
    pub ready_poll_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            database_file: "novel.db".to_string(),
            disable_primary: false,
            backup_interval: Duration::from_secs(5 * 60),
            ready_poll_attempts: 50,
            ready_poll_interval: Duration::from_millis(100),
        }
    }
}

impl StoreConfig {
    /// Default settings rooted at `data_dir`.
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `NOVEL_DATA_DIR`, `NOVEL_DISABLE_PRIMARY` and
    /// `NOVEL_BACKUP_INTERVAL_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = env::var("NOVEL_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(flag) = env::var("NOVEL_DISABLE_PRIMARY") {
            config.disable_primary = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(secs) = env::var("NOVEL_BACKUP_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) if secs > 0 => config.backup_interval = Duration::from_secs(secs),
                _ => log::warn!("Ignoring invalid NOVEL_BACKUP_INTERVAL_SECS={:?}", secs),
            }
        }
        config
    }

    /// Full path of the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::new("/tmp/novel");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/novel/novel.db"));
        assert_eq!(config.backup_interval, Duration::from_secs(300));
        assert!(!config.disable_primary);
    }
}
