//! Runtime configuration.

use std::path::PathBuf;

/// Everything the server needs to come up, assembled from the CLI flags.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Client-facing listener port.
    pub port: u16,
    /// Leader address when running as a follower.
    pub replica_of: Option<(String, u16)>,
    /// Snapshot directory, as handed to `--dir`.
    pub dir: Option<PathBuf>,
    /// Snapshot file name, as handed to `--dbfilename`.
    pub dbfilename: Option<String>,
}

/// The well-known port, used when `--port` is absent.
pub const DEFAULT_PORT: u16 = 6379;

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            replica_of: None,
            dir: None,
            dbfilename: None,
        }
    }
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Whether this node follows a leader.
    pub fn is_replica(&self) -> bool {
        self.replica_of.is_some()
    }

    /// Path of the startup snapshot, when both halves were supplied.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        match (&self.dir, &self.dbfilename) {
            (Some(dir), Some(name)) => Some(dir.join(name)),
            _ => None,
        }
    }

    /// The value `CONFIG GET` reports for a recognized key.
    pub fn config_value(&self, key: &str) -> Option<String> {
        match key {
            "dir" => Some(
                self.dir
                    .as_ref()
                    .map(|d| d.display().to_string())
                    .unwrap_or_default(),
            ),
            "dbfilename" => Some(self.dbfilename.clone().unwrap_or_default()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_path_requires_both_flags() {
        let mut config = ServerConfig::new(6379);
        assert_eq!(config.snapshot_path(), None);
        config.dir = Some(PathBuf::from("/data"));
        assert_eq!(config.snapshot_path(), None);
        config.dbfilename = Some("dump.rdb".into());
        assert_eq!(config.snapshot_path(), Some(PathBuf::from("/data/dump.rdb")));
    }

    #[test]
    fn config_get_recognizes_two_keys() {
        let mut config = ServerConfig::new(6379);
        config.dir = Some(PathBuf::from("/data"));
        assert_eq!(config.config_value("dir"), Some("/data".into()));
        assert_eq!(config.config_value("dbfilename"), Some(String::new()));
        assert_eq!(config.config_value("maxmemory"), None);
    }
}
